//! [`FileSystem`] over the local disk

use std::fs::Metadata;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tracing::{debug, info};

use super::error::SftpError;
use super::fs::{FileSystem, FsKind};
use super::path_utils::{is_absolute_local_path, join_local_path, local_file_name, local_parent};
use super::types::{FileInfo, FileType, Ownership};

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }

    fn check_path(path: &str) -> Result<(), SftpError> {
        if is_absolute_local_path(path) {
            Ok(())
        } else {
            Err(SftpError::InvalidPath(format!("{} is not an absolute local path", path)))
        }
    }

    fn to_file_info(name: String, path: String, metadata: &Metadata) -> FileInfo {
        let file_type = if metadata.file_type().is_symlink() {
            FileType::Symlink
        } else if metadata.is_dir() {
            FileType::Directory
        } else if metadata.is_file() {
            FileType::File
        } else {
            FileType::Unknown
        };

        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        #[cfg(unix)]
        let (permissions, uid, gid) = {
            use std::os::unix::fs::{MetadataExt, PermissionsExt};
            (
                metadata.permissions().mode() & 0o7777,
                Some(metadata.uid()),
                Some(metadata.gid()),
            )
        };
        #[cfg(not(unix))]
        let (permissions, uid, gid) = {
            let mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
            (mode, None, None)
        };

        FileInfo {
            name,
            path,
            file_type,
            size: metadata.len(),
            modified,
            permissions,
            uid,
            gid,
        }
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn kind(&self) -> FsKind {
        FsKind::Local
    }

    fn join(&self, base: &str, name: &str) -> String {
        join_local_path(base, name)
    }

    fn parent(&self, path: &str) -> Option<String> {
        local_parent(path)
    }

    fn file_name<'a>(&self, path: &'a str) -> Option<&'a str> {
        local_file_name(path)
    }

    async fn home_dir(&self) -> Result<String, SftpError> {
        dirs::home_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| SftpError::InvalidPath("cannot determine home directory".to_string()))
    }

    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        tokio::fs::canonicalize(path)
            .await
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|e| SftpError::from_io(e, path))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        Self::check_path(path)?;
        debug!("Listing local directory: {}", path);

        let mut read_dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| SftpError::from_io(e, path))?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| SftpError::from_io(e, path))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let full_path = entry.path().to_string_lossy().into_owned();
            let link = match tokio::fs::symlink_metadata(&full_path).await {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping unreadable entry {}: {}", full_path, e);
                    continue;
                }
            };
            if !link.file_type().is_symlink() {
                entries.push(Self::to_file_info(name, full_path, &link));
                continue;
            }
            // Links stay links; size and mode come from the target when it resolves
            let mut info = match tokio::fs::metadata(&full_path).await {
                Ok(target) => Self::to_file_info(name, full_path, &target),
                Err(_) => Self::to_file_info(name, full_path, &link),
            };
            info.file_type = FileType::Symlink;
            entries.push(info);
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        Self::check_path(path)?;
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| SftpError::from_io(e, path))?;
        let name = local_file_name(path).unwrap_or(path).to_string();
        Ok(Self::to_file_info(name, path.to_string(), &metadata))
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo, SftpError> {
        Self::check_path(path)?;
        let metadata = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| SftpError::from_io(e, path))?;
        let name = local_file_name(path).unwrap_or(path).to_string();
        Ok(Self::to_file_info(name, path.to_string(), &metadata))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        Self::check_path(path)?;
        info!("Creating local directory: {}", path);
        tokio::fs::create_dir(path)
            .await
            .map_err(|e| SftpError::from_io(e, path))
    }

    async fn create_file(&self, path: &str) -> Result<(), SftpError> {
        Self::check_path(path)?;
        info!("Creating local file: {}", path);
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map(|_| ())
            .map_err(|e| SftpError::from_io(e, path))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        Self::check_path(path)?;
        info!("Deleting local file: {}", path);
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| SftpError::from_io(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        Self::check_path(path)?;
        info!("Deleting local directory: {}", path);
        tokio::fs::remove_dir(path)
            .await
            .map_err(|e| SftpError::from_io(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        Self::check_path(from)?;
        Self::check_path(to)?;
        info!("Renaming {} to {}", from, to);
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| SftpError::from_io(e, from))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        Self::check_path(path)?;
        tokio::fs::read(path)
            .await
            .map_err(|e| SftpError::from_io(e, path))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), SftpError> {
        Self::check_path(path)?;
        tokio::fs::write(path, data)
            .await
            .map_err(|e| SftpError::from_io(e, path))
    }

    #[cfg(unix)]
    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        use std::os::unix::fs::PermissionsExt;
        Self::check_path(path)?;
        info!("chmod {:o} {}", mode & 0o7777, path);
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(|e| SftpError::from_io(e, path))
    }

    #[cfg(not(unix))]
    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        Self::check_path(path)?;
        let mut permissions = tokio::fs::metadata(path)
            .await
            .map_err(|e| SftpError::from_io(e, path))?
            .permissions();
        permissions.set_readonly(mode & 0o222 == 0);
        tokio::fs::set_permissions(path, permissions)
            .await
            .map_err(|e| SftpError::from_io(e, path))
    }

    async fn set_owner(&self, path: &str, owner: &Ownership) -> Result<(), SftpError> {
        Self::check_path(path)?;
        let spec = owner.chown_spec();
        info!("chown {} {}", spec, path);
        let output = tokio::process::Command::new("chown")
            .arg("--")
            .arg(&spec)
            .arg(path)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SftpError::CommandFailed(format!(
                "chown {} {} failed: {}",
                spec,
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}
