//! SFTP data types

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// File entry information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (not full path)
    pub name: String,
    /// Full path
    pub path: String,
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// Last modified time (Unix timestamp)
    pub modified: i64,
    /// Permission bits, e.g. 0o755
    pub permissions: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Permissions as an octal string, e.g. "755"
    pub fn permissions_octal(&self) -> String {
        format!("{:o}", self.permissions & 0o7777)
    }
}

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Filter for directory listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    /// Show hidden files (starting with .)
    #[serde(default)]
    pub show_hidden: bool,
    /// File name pattern to match (glob-style)
    pub pattern: Option<String>,
}

impl ListFilter {
    pub fn show_all() -> Self {
        Self {
            show_hidden: true,
            pattern: None,
        }
    }

    /// Drop filtered entries and sort the rest for display.
    ///
    /// An invalid glob pattern filters nothing.
    pub fn apply(&self, mut entries: Vec<FileInfo>) -> Vec<FileInfo> {
        entries.retain(|e| e.name != "." && e.name != "..");
        if !self.show_hidden {
            entries.retain(|e| !e.name.starts_with('.'));
        }
        if let Some(pattern) = self.pattern.as_deref().filter(|p| !p.is_empty()) {
            match glob::Pattern::new(pattern) {
                Ok(glob_pattern) => entries.retain(|e| e.is_dir() || glob_pattern.matches(&e.name)),
                Err(e) => tracing::debug!("Ignoring invalid listing pattern {:?}: {}", pattern, e),
            }
        }
        sort_entries(&mut entries);
        entries
    }
}

/// Directories first, then case-insensitive by name
pub fn sort_entries(entries: &mut [FileInfo]) {
    entries.sort_by(compare_entries);
}

fn compare_entries(a: &FileInfo, b: &FileInfo) -> Ordering {
    b.is_dir()
        .cmp(&a.is_dir())
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
}

/// New owner for a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Ownership {
    /// Numeric ids, applied with setstat
    Ids { uid: u32, gid: Option<u32> },
    /// User (and optional group) names, resolved by the host
    Names { user: String, group: Option<String> },
}

impl Ownership {
    /// `user[:group]` argument for chown
    pub fn chown_spec(&self) -> String {
        match self {
            Ownership::Ids { uid, gid: Some(gid) } => format!("{}:{}", uid, gid),
            Ownership::Ids { uid, gid: None } => uid.to_string(),
            Ownership::Names {
                user,
                group: Some(group),
            } => format!("{}:{}", user, group),
            Ownership::Names { user, group: None } => user.clone(),
        }
    }
}

/// Constants for SFTP operations
pub mod constants {
    /// Upper bound on entries walked by one recursive copy or delete
    pub const MAX_RECURSIVE_ENTRIES: usize = 100_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, file_type: FileType) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            path: format!("/d/{}", name),
            file_type,
            size: 0,
            modified: 0,
            permissions: 0o644,
            uid: None,
            gid: None,
        }
    }

    fn names(entries: &[FileInfo]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_directories_first_then_case_insensitive() {
        let entries = vec![
            entry("b.log", FileType::File),
            entry("Zeta", FileType::Directory),
            entry("A.txt", FileType::File),
            entry("alpha", FileType::Directory),
            entry("a.txt", FileType::File),
        ];
        let sorted = ListFilter::show_all().apply(entries);
        assert_eq!(names(&sorted), vec!["alpha", "Zeta", "A.txt", "a.txt", "b.log"]);
    }

    #[test]
    fn test_hidden_and_pattern_filter() {
        let entries = vec![
            entry(".profile", FileType::File),
            entry("messages.log", FileType::File),
            entry("boot.txt", FileType::File),
            entry("logs", FileType::Directory),
            entry("..", FileType::Directory),
        ];
        let filter = ListFilter {
            show_hidden: false,
            pattern: Some("*.log".to_string()),
        };
        assert_eq!(names(&filter.apply(entries)), vec!["logs", "messages.log"]);
    }

    #[test]
    fn test_chown_spec() {
        assert_eq!(Ownership::Ids { uid: 0, gid: Some(0) }.chown_spec(), "0:0");
        assert_eq!(
            Ownership::Names {
                user: "www".to_string(),
                group: None
            }
            .chown_spec(),
            "www"
        );
    }
}
