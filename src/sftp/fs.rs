//! File system abstraction shared by remote and local panes
//!
//! Both panes of the file browser speak [`FileSystem`], which is what lets a
//! copy go remote to local, local to remote, remote to remote or local to local
//! through one code path.

use std::fmt;

use async_trait::async_trait;
use tracing::debug;

use super::error::SftpError;
use super::types::{constants::MAX_RECURSIVE_ENTRIES, FileInfo, ListFilter, Ownership};

/// Which side a file system lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Local,
    Remote,
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsKind::Local => write!(f, "local"),
            FsKind::Remote => write!(f, "remote"),
        }
    }
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    fn kind(&self) -> FsKind;

    fn join(&self, base: &str, name: &str) -> String;

    fn parent(&self, path: &str) -> Option<String>;

    fn file_name<'a>(&self, path: &'a str) -> Option<&'a str>;

    /// Starting directory for a new pane
    async fn home_dir(&self) -> Result<String, SftpError>;

    async fn canonicalize(&self, path: &str) -> Result<String, SftpError>;

    /// Raw entries of `path`, unfiltered and unsorted
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError>;

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError>;

    /// Like [`FileSystem::stat`] but reports a symlink itself instead of its target
    async fn lstat(&self, path: &str) -> Result<FileInfo, SftpError> {
        self.stat(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, SftpError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(SftpError::FileNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;

    /// Create an empty file; fails if `path` already exists
    async fn create_file(&self, path: &str) -> Result<(), SftpError> {
        if self.exists(path).await? {
            return Err(SftpError::AlreadyExists(path.to_string()));
        }
        self.write_file(path, &[]).await
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;

    /// Remove an empty directory
    async fn remove_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError>;

    /// Create or truncate `path` and write `data`
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), SftpError>;

    /// Set permission bits (e.g. 0o644)
    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError>;

    async fn set_owner(&self, path: &str, owner: &Ownership) -> Result<(), SftpError>;

    /// Resolves once the file system can no longer be used.
    ///
    /// A local disk never goes away.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// Filtered, sorted listing of `path`.
pub async fn list_dir(
    fs: &dyn FileSystem,
    path: &str,
    filter: &ListFilter,
) -> Result<Vec<FileInfo>, SftpError> {
    let entries = fs.read_dir(path).await?;
    debug!("Listed {} raw entries in {} {}", entries.len(), fs.kind(), path);
    Ok(filter.apply(entries))
}

/// Delete a file, or a directory with everything below it.
///
/// Symlinks are removed as links and never followed. Returns the number of
/// entries removed.
pub async fn remove_all(fs: &dyn FileSystem, path: &str) -> Result<u64, SftpError> {
    let info = fs.lstat(path).await?;
    if !info.is_dir() {
        fs.remove_file(path).await?;
        return Ok(1);
    }
    let mut budget = MAX_RECURSIVE_ENTRIES;
    remove_all_inner(fs, path, &mut budget).await
}

async fn remove_all_inner(
    fs: &dyn FileSystem,
    path: &str,
    budget: &mut usize,
) -> Result<u64, SftpError> {
    let mut removed = 0u64;
    for entry in fs.read_dir(path).await? {
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        *budget = budget.checked_sub(1).ok_or_else(|| {
            SftpError::ProtocolError(format!("too many entries below {}", path))
        })?;
        if entry.is_dir() {
            removed += Box::pin(remove_all_inner(fs, &entry.path, budget)).await?;
        } else {
            fs.remove_file(&entry.path).await?;
            removed += 1;
        }
    }
    fs.remove_dir(path).await?;
    Ok(removed + 1)
}
