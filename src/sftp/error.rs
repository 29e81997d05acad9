//! SFTP error types

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("SFTP subsystem not available: {0}")]
    SubsystemNotAvailable(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Not connected")]
    NotConnected,
}

impl SftpError {
    pub(crate) fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SftpError::FileNotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
            std::io::ErrorKind::AlreadyExists => SftpError::AlreadyExists(path.to_string()),
            _ => SftpError::IoError(err),
        }
    }
}

impl From<SshError> for SftpError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::RemoteOperationFailed(msg) => SftpError::CommandFailed(msg),
            other => SftpError::ProtocolError(other.to_string()),
        }
    }
}

impl From<SftpError> for SshError {
    fn from(err: SftpError) -> Self {
        SshError::RemoteOperationFailed(err.to_string())
    }
}
