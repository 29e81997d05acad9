//! SFTP file management module
//!
//! Provides remote and local file browsing, and copies between the two.

pub mod error;
pub mod fs;
mod local;
pub mod path_utils;
mod remote;
pub mod session;
pub mod transfer;
pub mod types;

pub use error::SftpError;
pub use fs::{list_dir, remove_all, FileSystem, FsKind};
pub use local::LocalFileSystem;
pub use remote::SftpFileSystem;
pub use session::{FilePane, LocalPane, SftpSession};
pub use transfer::{copy_as, copy_entry, duplicate_name, CopyOutcome};
pub use types::*;
