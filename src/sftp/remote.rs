//! [`FileSystem`] over an SFTP subsystem channel

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use russh_sftp::client::error::Error as RusshSftpError;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::SftpError;
use super::fs::{FileSystem, FsKind};
use super::path_utils::{
    is_absolute_remote_path, join_remote_path, remote_file_name, remote_parent, shell_quote,
};
use super::types::{FileInfo, FileType, Ownership};
use crate::ssh::{exec_on, HandleController, SshError};

/// Subsystem stream that cancels `ended` once the server stops answering
struct WatchedStream<S> {
    inner: S,
    ended: CancellationToken,
}

impl<S: AsyncRead + Unpin> AsyncRead for WatchedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let has_room = buf.remaining() > 0;
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        match &poll {
            Poll::Ready(Ok(())) if has_room && buf.filled().len() == before => {
                debug!("SFTP subsystem reached end of stream");
                self.ended.cancel();
            }
            Poll::Ready(Err(e)) => {
                debug!("SFTP subsystem read failed: {}", e);
                self.ended.cancel();
            }
            _ => {}
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WatchedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S> Drop for WatchedStream<S> {
    fn drop(&mut self) {
        self.ended.cancel();
    }
}

pub struct SftpFileSystem {
    sftp: RusshSftpSession,
    /// Used for operations SFTP cannot express (chown by name)
    controller: HandleController,
    ended: CancellationToken,
}

impl SftpFileSystem {
    /// Start the SFTP protocol over an open subsystem channel
    pub async fn open<S>(stream: S, controller: HandleController) -> Result<Self, SshError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ended = CancellationToken::new();
        let watched = WatchedStream {
            inner: stream,
            ended: ended.clone(),
        };
        let sftp = RusshSftpSession::new(watched)
            .await
            .map_err(|e| SshError::ChannelError(format!("SFTP init failed: {}", e)))?;
        Ok(Self {
            sftp,
            controller,
            ended,
        })
    }

    fn check_path(path: &str) -> Result<(), SftpError> {
        if is_absolute_remote_path(path) {
            Ok(())
        } else {
            Err(SftpError::InvalidPath(format!("{} is not an absolute remote path", path)))
        }
    }

    fn to_file_info(name: String, path: String, attrs: &FileAttributes) -> FileInfo {
        let file_type = if attrs.is_symlink() {
            FileType::Symlink
        } else if attrs.is_dir() {
            FileType::Directory
        } else if attrs.is_regular() {
            FileType::File
        } else {
            FileType::Unknown
        };

        FileInfo {
            name,
            path,
            file_type,
            size: attrs.size.unwrap_or(0),
            modified: attrs.mtime.map(i64::from).unwrap_or(0),
            permissions: attrs.permissions.map(|p| p & 0o7777).unwrap_or(0),
            uid: attrs.uid,
            gid: attrs.gid,
        }
    }
}

fn map_sftp_error(err: RusshSftpError, path: &str) -> SftpError {
    let err_str = err.to_string();
    if err_str.contains("No such file") || err_str.contains("not found") {
        SftpError::FileNotFound(path.to_string())
    } else if err_str.contains("Permission denied") {
        SftpError::PermissionDenied(path.to_string())
    } else {
        SftpError::ProtocolError(format!("{}: {}", path, err_str))
    }
}

#[async_trait]
impl FileSystem for SftpFileSystem {
    fn kind(&self) -> FsKind {
        FsKind::Remote
    }

    fn join(&self, base: &str, name: &str) -> String {
        join_remote_path(base, name)
    }

    fn parent(&self, path: &str) -> Option<String> {
        remote_parent(path)
    }

    fn file_name<'a>(&self, path: &'a str) -> Option<&'a str> {
        remote_file_name(path)
    }

    async fn home_dir(&self) -> Result<String, SftpError> {
        self.sftp
            .canonicalize(".")
            .await
            .map_err(|e| map_sftp_error(e, "."))
    }

    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        self.sftp
            .canonicalize(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        Self::check_path(path)?;
        debug!("Listing remote directory: {}", path);

        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let full_path = join_remote_path(path, &name);
            entries.push(Self::to_file_info(name, full_path, &entry.metadata()));
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        Self::check_path(path)?;
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        let name = remote_file_name(path).unwrap_or("/").to_string();
        Ok(Self::to_file_info(name, path.to_string(), &attrs))
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo, SftpError> {
        Self::check_path(path)?;
        let attrs = self
            .sftp
            .symlink_metadata(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        let name = remote_file_name(path).unwrap_or("/").to_string();
        Ok(Self::to_file_info(name, path.to_string(), &attrs))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        Self::check_path(path)?;
        info!("Creating remote directory: {}", path);
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        Self::check_path(path)?;
        info!("Deleting remote file: {}", path);
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        Self::check_path(path)?;
        info!("Deleting remote directory: {}", path);
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        Self::check_path(from)?;
        Self::check_path(to)?;
        info!("Renaming {} to {}", from, to);
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_sftp_error(e, from))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        Self::check_path(path)?;
        let mut file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content).await?;
        debug!("Read {} bytes from {}", content.len(), path);
        Ok(content)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), SftpError> {
        Self::check_path(path)?;
        let mut file = self
            .sftp
            .open_with_flags(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        file.write_all(data).await?;
        file.flush().await?;
        file.shutdown().await?;
        debug!("Wrote {} bytes to {}", data.len(), path);
        Ok(())
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        Self::check_path(path)?;
        info!("chmod {:o} {}", mode & 0o7777, path);
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode & 0o7777);
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn set_owner(&self, path: &str, owner: &Ownership) -> Result<(), SftpError> {
        Self::check_path(path)?;
        info!("chown {} {}", owner.chown_spec(), path);
        match owner {
            Ownership::Ids { uid, gid } => {
                let current = self
                    .sftp
                    .metadata(path)
                    .await
                    .map_err(|e| map_sftp_error(e, path))?;
                let mut attrs = FileAttributes::empty();
                attrs.uid = Some(*uid);
                // setstat carries uid and gid together
                attrs.gid = gid.or(current.gid);
                self.sftp
                    .set_metadata(path, attrs)
                    .await
                    .map_err(|e| map_sftp_error(e, path))
            }
            Ownership::Names { .. } => {
                let command = format!(
                    "chown -- {} {}",
                    shell_quote(&owner.chown_spec()),
                    shell_quote(path)
                );
                exec_on(&self.controller, &command).await?.check(&command)?;
                Ok(())
            }
        }
    }

    async fn closed(&self) {
        self.ended.cancelled().await
    }
}
