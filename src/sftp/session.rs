//! File browser panes
//!
//! A pane is one side of the file browser: [`SftpSession`] for a device
//! (connected through the shared session driver) or [`LocalPane`] for the
//! local disk. Both speak [`FilePane`], so every operation, including copies
//! between any two panes, is written once.
//!
//! Every request carries a [`RequestId`]. Results come back as
//! [`SessionEvent::Listing`] or [`SessionEvent::OperationFailed`] tagged with
//! that id. Mutations re-list the affected directory afterwards. A failed
//! operation never touches the connection state.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::fs::{list_dir, remove_all, FileSystem};
use super::local::LocalFileSystem;
use super::transfer::{copy_as, copy_entry, duplicate_name, CopyOutcome};
use super::types::{FileInfo, ListFilter, Ownership};
use crate::prompt::Prompter;
use crate::session::{
    ActivityContext, ActivityEnd, EventSink, LifecycleState, RequestId, SessionActivity,
    SessionDriver, SessionEvent,
};
use crate::ssh::{DeviceTarget, SshError, Transport, TransportConnector};

/// One side of the file browser
#[async_trait]
pub trait FilePane: Send + Sync {
    /// The file system behind the pane, if currently available
    fn file_system(&self) -> Result<Arc<dyn FileSystem>, SftpError>;

    fn sink(&self) -> &EventSink;

    fn filter(&self) -> ListFilter;

    fn prompter(&self) -> &dyn Prompter;

    async fn home_dir(&self) -> Result<String, SftpError> {
        self.file_system()?.home_dir().await
    }

    /// List `path` and emit the result for `request`.
    async fn list(&self, request: RequestId, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        let result: Result<Vec<FileInfo>, SftpError> = async {
            let fs = self.file_system()?;
            list_dir(fs.as_ref(), path, &self.filter()).await
        }
        .await;
        match result {
            Ok(entries) => {
                self.sink().emit(SessionEvent::Listing {
                    request_id: request,
                    path: path.to_string(),
                    entries: entries.clone(),
                });
                Ok(entries)
            }
            Err(e) => Err(report(self.sink(), request, "list", e)),
        }
    }

    async fn create_dir(&self, request: RequestId, dir: &str, name: &str) -> Result<(), SftpError> {
        let result: Result<(), SftpError> = async {
            check_name(name)?;
            let fs = self.file_system()?;
            fs.create_dir(&fs.join(dir, name)).await
        }
        .await;
        refresh_after(self, request, "create directory", dir, result).await
    }

    async fn create_file(&self, request: RequestId, dir: &str, name: &str) -> Result<(), SftpError> {
        let result: Result<(), SftpError> = async {
            check_name(name)?;
            let fs = self.file_system()?;
            fs.create_file(&fs.join(dir, name)).await
        }
        .await;
        refresh_after(self, request, "create file", dir, result).await
    }

    /// Delete a file, or a directory and everything below it.
    async fn delete(&self, request: RequestId, path: &str) -> Result<(), SftpError> {
        let result: Result<String, SftpError> = async {
            let fs = self.file_system()?;
            let removed = remove_all(fs.as_ref(), path).await?;
            debug!("Deleted {} entries under {}", removed, path);
            parent_of(fs.as_ref(), path)
        }
        .await;
        refresh_parent(self, request, "delete", result).await
    }

    /// Rename within the same directory.
    async fn rename(&self, request: RequestId, path: &str, new_name: &str) -> Result<(), SftpError> {
        let result: Result<String, SftpError> = async {
            check_name(new_name)?;
            let fs = self.file_system()?;
            let dir = parent_of(fs.as_ref(), path)?;
            let destination = fs.join(&dir, new_name);
            if fs.exists(&destination).await? {
                return Err(SftpError::AlreadyExists(destination));
            }
            fs.rename(path, &destination).await?;
            Ok(dir)
        }
        .await;
        refresh_parent(self, request, "rename", result).await
    }

    /// Copy next to the original under a free "<name> copy" name.
    async fn duplicate(&self, request: RequestId, path: &str) -> Result<(), SftpError> {
        let result: Result<String, SftpError> = async {
            let fs = self.file_system()?;
            let dir = parent_of(fs.as_ref(), path)?;
            let name = fs
                .file_name(path)
                .ok_or_else(|| SftpError::InvalidPath(path.to_string()))?;
            let copy_name = duplicate_name(fs.as_ref(), &dir, name).await?;
            let destination = fs.join(&dir, &copy_name);
            copy_as(fs.as_ref(), path, fs.as_ref(), &destination, self.prompter()).await?;
            Ok(dir)
        }
        .await;
        refresh_parent(self, request, "duplicate", result).await
    }

    async fn set_permissions(&self, request: RequestId, path: &str, mode: u32) -> Result<(), SftpError> {
        let result: Result<String, SftpError> = async {
            let fs = self.file_system()?;
            fs.set_permissions(path, mode).await?;
            parent_of(fs.as_ref(), path)
        }
        .await;
        refresh_parent(self, request, "change permissions", result).await
    }

    async fn set_owner(&self, request: RequestId, path: &str, owner: &Ownership) -> Result<(), SftpError> {
        let result: Result<String, SftpError> = async {
            let fs = self.file_system()?;
            fs.set_owner(path, owner).await?;
            parent_of(fs.as_ref(), path)
        }
        .await;
        refresh_parent(self, request, "change owner", result).await
    }

    /// Copy `src_path` from this pane into `dest_dir` of `dest`.
    ///
    /// Asks before overwriting. On success the destination pane re-lists
    /// `dest_dir`; a declined overwrite changes nothing.
    async fn copy_to(
        &self,
        request: RequestId,
        src_path: &str,
        dest: &dyn FilePane,
        dest_dir: &str,
    ) -> Result<CopyOutcome, SftpError> {
        let result: Result<CopyOutcome, SftpError> = async {
            let src_fs = self.file_system()?;
            let dest_fs = dest.file_system()?;
            copy_entry(src_fs.as_ref(), src_path, dest_fs.as_ref(), dest_dir, self.prompter()).await
        }
        .await;
        match result {
            Ok(outcome @ CopyOutcome::Copied { .. }) => {
                // Errors of the refresh are reported by `list` itself
                let _ = dest.list(request, dest_dir).await;
                Ok(outcome)
            }
            Ok(CopyOutcome::Skipped) => Ok(CopyOutcome::Skipped),
            Err(e) => Err(report(self.sink(), request, "copy", e)),
        }
    }
}

/// Report `result`; on success re-list `dir` for the same request
async fn refresh_after<P: FilePane + ?Sized>(
    pane: &P,
    request: RequestId,
    operation: &str,
    dir: &str,
    result: Result<(), SftpError>,
) -> Result<(), SftpError> {
    match result {
        Ok(()) => {
            let _ = pane.list(request, dir).await;
            Ok(())
        }
        Err(e) => Err(report(pane.sink(), request, operation, e)),
    }
}

/// Like [`refresh_after`], with the directory produced by the operation
async fn refresh_parent<P: FilePane + ?Sized>(
    pane: &P,
    request: RequestId,
    operation: &str,
    result: Result<String, SftpError>,
) -> Result<(), SftpError> {
    match result {
        Ok(dir) => {
            let _ = pane.list(request, &dir).await;
            Ok(())
        }
        Err(e) => Err(report(pane.sink(), request, operation, e)),
    }
}

fn report(sink: &EventSink, request: RequestId, operation: &str, err: SftpError) -> SftpError {
    warn!("{} failed: {}", operation, err);
    sink.emit(SessionEvent::OperationFailed {
        request_id: request,
        operation: operation.to_string(),
        message: err.to_string(),
    });
    err
}

fn check_name(name: &str) -> Result<(), SftpError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(SftpError::InvalidPath(format!("{:?} is not a valid name", name)));
    }
    Ok(())
}

fn parent_of(fs: &dyn FileSystem, path: &str) -> Result<String, SftpError> {
    fs.parent(path)
        .ok_or_else(|| SftpError::InvalidPath(format!("{} has no parent directory", path)))
}

/// SFTP subsystem of the current connection
struct SftpLink {
    fs: Mutex<Option<Arc<dyn FileSystem>>>,
}

#[async_trait]
impl SessionActivity for SftpLink {
    async fn prepare(&self, transport: &Arc<dyn Transport>) -> Result<(), SshError> {
        let fs = transport.open_sftp().await?;
        *self.fs.lock() = Some(fs);
        Ok(())
    }

    async fn run(
        &self,
        transport: Arc<dyn Transport>,
        ctx: &ActivityContext,
    ) -> Result<ActivityEnd, SshError> {
        let fs = self.fs.lock().clone();
        let reason = match fs {
            Some(fs) => tokio::select! {
                _ = transport.closed() => "SFTP connection lost",
                _ = fs.closed() => "SFTP subsystem closed",
            },
            None => {
                transport.closed().await;
                "SFTP connection lost"
            }
        };
        self.fs.lock().take();
        Ok(ActivityEnd::Lost {
            reason: reason.to_string(),
            failover: ctx.endpoint_count > 1,
        })
    }

    fn detached(&self) {
        self.fs.lock().take();
    }
}

/// Remote pane on a device
pub struct SftpSession {
    driver: SessionDriver,
    link: Arc<SftpLink>,
    prompter: Arc<dyn Prompter>,
    filter: Mutex<ListFilter>,
}

impl SftpSession {
    pub fn new(
        connector: Arc<TransportConnector>,
        target: DeviceTarget,
        prompter: Arc<dyn Prompter>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let filter = ListFilter {
            show_hidden: connector.settings().show_hidden_files,
            pattern: None,
        };
        let link = Arc::new(SftpLink {
            fs: Mutex::new(None),
        });
        let (sink, events) = EventSink::new();
        info!("SFTP session for {}", target.display_name());
        let driver = SessionDriver::new(connector, target, link.clone(), sink, false);
        (
            Self {
                driver,
                link,
                prompter,
                filter: Mutex::new(filter),
            },
            events,
        )
    }

    pub fn start(&self) -> Result<(), SshError> {
        self.driver.start()
    }

    pub fn state(&self) -> LifecycleState {
        self.driver.state()
    }

    pub fn set_filter(&self, filter: ListFilter) {
        *self.filter.lock() = filter;
    }

    pub async fn disconnect(&self) {
        self.link.fs.lock().take();
        self.driver.disconnect().await;
    }

    pub async fn reconnect(&self) {
        self.driver.reconnect().await;
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.driver.set_auto_reconnect(enabled);
    }

    pub async fn dispose(&self) {
        self.link.fs.lock().take();
        self.driver.dispose().await;
    }
}

#[async_trait]
impl FilePane for SftpSession {
    fn file_system(&self) -> Result<Arc<dyn FileSystem>, SftpError> {
        self.link.fs.lock().clone().ok_or(SftpError::NotConnected)
    }

    fn sink(&self) -> &EventSink {
        self.driver.sink()
    }

    fn filter(&self) -> ListFilter {
        self.filter.lock().clone()
    }

    fn prompter(&self) -> &dyn Prompter {
        self.prompter.as_ref()
    }
}

/// Pane on the local disk
pub struct LocalPane {
    fs: Arc<dyn FileSystem>,
    sink: EventSink,
    prompter: Arc<dyn Prompter>,
    filter: Mutex<ListFilter>,
}

impl LocalPane {
    pub fn new(
        prompter: Arc<dyn Prompter>,
        show_hidden: bool,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::with_file_system(Arc::new(LocalFileSystem::new()), prompter, show_hidden)
    }

    pub fn with_file_system(
        fs: Arc<dyn FileSystem>,
        prompter: Arc<dyn Prompter>,
        show_hidden: bool,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sink, events) = EventSink::new();
        (
            Self {
                fs,
                sink,
                prompter,
                filter: Mutex::new(ListFilter {
                    show_hidden,
                    pattern: None,
                }),
            },
            events,
        )
    }

    pub fn set_filter(&self, filter: ListFilter) {
        *self.filter.lock() = filter;
    }

    pub fn dispose(&self) {
        self.sink.close();
    }
}

#[async_trait]
impl FilePane for LocalPane {
    fn file_system(&self) -> Result<Arc<dyn FileSystem>, SftpError> {
        Ok(self.fs.clone())
    }

    fn sink(&self) -> &EventSink {
        &self.sink
    }

    fn filter(&self) -> ListFilter {
        self.filter.lock().clone()
    }

    fn prompter(&self) -> &dyn Prompter {
        self.prompter.as_ref()
    }
}
