//! Path helpers for both sides of a file pane
//!
//! Remote SFTP paths always use `/`. Local paths go through `std::path` so
//! Windows drive letters and UNC prefixes keep working.

use std::path::{Path, PathBuf};

/// Check if a local path is absolute.
///
/// Accepts Unix paths, Windows drive letters (`C:\`, `D:/`) and UNC paths
/// (`\\server\share`, `\\?\C:\long`) regardless of the host OS.
pub fn is_absolute_local_path(path: &str) -> bool {
    if Path::new(path).is_absolute() || path.starts_with('/') {
        return true;
    }

    let bytes = path.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
    {
        return true;
    }

    path.starts_with("\\\\") || path.starts_with("//")
}

/// Remote SFTP paths are absolute iff they start with `/`, even on Windows servers.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

pub fn join_local_path(base: &str, component: &str) -> String {
    let mut path = PathBuf::from(base);
    path.push(component);
    path.to_string_lossy().into_owned()
}

pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Parent of a remote path; `None` for `/` and for bare names.
pub fn remote_parent(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(trimmed[..idx].to_string()),
        None => None,
    }
}

pub fn remote_file_name(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}

pub fn local_parent(path: &str) -> Option<String> {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
}

pub fn local_file_name(path: &str) -> Option<&str> {
    Path::new(path).file_name().and_then(|n| n.to_str())
}

/// Quote an argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_absolute_local_path() {
        assert!(is_absolute_local_path("/home/user"));
        assert!(is_absolute_local_path("C:\\Users"));
        assert!(is_absolute_local_path("d:/data"));
        assert!(is_absolute_local_path("\\\\?\\C:\\long\\path"));
        assert!(is_absolute_local_path("//server/share"));

        assert!(!is_absolute_local_path("relative/path"));
        assert!(!is_absolute_local_path("./current"));
    }

    #[test]
    fn test_is_absolute_remote_path() {
        assert!(is_absolute_remote_path("/"));
        assert!(!is_absolute_remote_path("var/log"));
        assert!(!is_absolute_remote_path("C:\\Windows"));
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/home/", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/", "home"), "/home");
    }

    #[test]
    fn test_remote_parent_and_name() {
        assert_eq!(remote_parent("/var/log/messages").as_deref(), Some("/var/log"));
        assert_eq!(remote_parent("/var/").as_deref(), Some("/"));
        assert_eq!(remote_parent("/"), None);
        assert_eq!(remote_file_name("/var/log/messages"), Some("messages"));
        assert_eq!(remote_file_name("/var/log/"), Some("log"));
        assert_eq!(remote_file_name("/"), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
    }
}
