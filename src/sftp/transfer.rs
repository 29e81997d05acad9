//! Copying entries between file systems
//!
//! A copy reads through one [`FileSystem`] and writes through another, so the
//! same code covers remote to local, local to remote, remote to remote and
//! local to local.

use tracing::{debug, info};

use super::error::SftpError;
use super::fs::{remove_all, FileSystem, FsKind};
use super::types::FileType;
use super::types::constants::MAX_RECURSIVE_ENTRIES;
use crate::prompt::Prompter;

pub const OVERWRITE_OPTIONS: [&str; 2] = ["Overwrite", "Cancel"];

/// Result of [`copy_entry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied { destination: String, entries: u64 },
    /// The user declined to overwrite an existing entry
    Skipped,
}

/// Copy `src_path` (file or directory tree) into `dst_dir`.
///
/// When the destination name is taken the user is asked before anything is
/// written; declining leaves the destination untouched.
pub async fn copy_entry(
    src: &dyn FileSystem,
    src_path: &str,
    dst: &dyn FileSystem,
    dst_dir: &str,
    prompter: &dyn Prompter,
) -> Result<CopyOutcome, SftpError> {
    let name = src
        .file_name(src_path)
        .ok_or_else(|| SftpError::InvalidPath(format!("{} has no file name", src_path)))?
        .to_string();
    let destination = dst.join(dst_dir, &name);
    copy_as(src, src_path, dst, &destination, prompter).await
}

/// Copy `src_path` to the exact path `destination`.
pub async fn copy_as(
    src: &dyn FileSystem,
    src_path: &str,
    dst: &dyn FileSystem,
    destination: &str,
    prompter: &dyn Prompter,
) -> Result<CopyOutcome, SftpError> {
    let source = src.stat(src_path).await?;

    if same_file_system(src, dst) {
        let resolved_src = src.canonicalize(src_path).await?;
        let resolved_dst = resolve_destination(dst, destination).await;
        if is_same_or_nested(src_path, destination) || is_same_or_nested(&resolved_src, &resolved_dst)
        {
            return Err(SftpError::InvalidPath(format!(
                "cannot copy {} into itself",
                src_path
            )));
        }
    }

    if dst.exists(destination).await? {
        let name = dst.file_name(destination).unwrap_or(destination);
        let dir = dst.parent(destination).unwrap_or_default();
        let message = format!("{} already exists in {}. Overwrite it?", name, dir);
        if prompter.ask_choice(&message, &OVERWRITE_OPTIONS).await != Some(0) {
            info!("Copy of {} skipped: {} exists", src_path, destination);
            return Ok(CopyOutcome::Skipped);
        }
        let existing = dst.stat(destination).await?;
        if existing.is_dir() != source.is_dir() {
            remove_all(dst, destination).await?;
        }
    }

    info!(
        "Copying {} {} to {} {}",
        src.kind(),
        src_path,
        dst.kind(),
        destination
    );
    let mut budget = MAX_RECURSIVE_ENTRIES;
    let entries = copy_tree(src, src_path, source.is_dir(), dst, destination, &mut budget).await?;
    Ok(CopyOutcome::Copied {
        destination: destination.to_string(),
        entries,
    })
}

async fn copy_tree(
    src: &dyn FileSystem,
    src_path: &str,
    is_dir: bool,
    dst: &dyn FileSystem,
    dst_path: &str,
    budget: &mut usize,
) -> Result<u64, SftpError> {
    *budget = budget
        .checked_sub(1)
        .ok_or_else(|| SftpError::ProtocolError(format!("too many entries below {}", src_path)))?;

    if !is_dir {
        let data = src.read_file(src_path).await?;
        dst.write_file(dst_path, &data).await?;
        debug!("Copied {} bytes to {}", data.len(), dst_path);
        return Ok(1);
    }

    // Listed before the destination exists so the copy never sees its own output
    let children = src.read_dir(src_path).await?;
    if !dst.exists(dst_path).await? {
        dst.create_dir(dst_path).await?;
    }
    let mut copied = 1u64;
    for entry in children {
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        let is_dir = match entry.file_type {
            FileType::Symlink => match src.stat(&entry.path).await {
                Ok(target) if target.is_dir() => {
                    debug!("Not following directory link {}", entry.path);
                    continue;
                }
                Ok(_) => false,
                Err(e) => {
                    debug!("Skipping dangling link {}: {}", entry.path, e);
                    continue;
                }
            },
            _ => entry.is_dir(),
        };
        let target = dst.join(dst_path, &entry.name);
        copied += Box::pin(copy_tree(src, &entry.path, is_dir, dst, &target, budget)).await?;
    }
    Ok(copied)
}

/// Both sides reach the same files: one object, or the local disk twice
fn same_file_system(src: &dyn FileSystem, dst: &dyn FileSystem) -> bool {
    std::ptr::addr_eq(src, dst) || (src.kind() == FsKind::Local && dst.kind() == FsKind::Local)
}

/// Canonical form of a path that may not exist yet
async fn resolve_destination(fs: &dyn FileSystem, path: &str) -> String {
    if let Ok(resolved) = fs.canonicalize(path).await {
        return resolved;
    }
    let parent = fs.parent(path);
    match (parent, fs.file_name(path)) {
        (Some(parent), Some(name)) => match fs.canonicalize(&parent).await {
            Ok(resolved) => fs.join(&resolved, name),
            Err(_) => path.to_string(),
        },
        _ => path.to_string(),
    }
}

fn is_same_or_nested(src_path: &str, destination: &str) -> bool {
    let src = src_path.trim_end_matches(['/', '\\']);
    destination == src
        || destination
            .strip_prefix(src)
            .is_some_and(|rest| rest.starts_with(['/', '\\']))
}

/// First free "<stem> copy[ N].<ext>" name in `dir`.
pub async fn duplicate_name(fs: &dyn FileSystem, dir: &str, name: &str) -> Result<String, SftpError> {
    let (stem, ext) = split_extension(name);
    for n in 1..=MAX_RECURSIVE_ENTRIES {
        let candidate = match n {
            1 => format!("{} copy{}", stem, ext),
            _ => format!("{} copy {}{}", stem, n, ext),
        };
        if !fs.exists(&fs.join(dir, &candidate)).await? {
            return Ok(candidate);
        }
    }
    Err(SftpError::AlreadyExists(format!("no free duplicate name for {}", name)))
}

/// Split off the extension; dotfiles and extensionless names keep it empty
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}
