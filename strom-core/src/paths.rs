//! Path algebra over folder-relative, slash-separated names.

use crate::error::{Result, SyncError};

/// True when `parent` is an ancestor directory of `path`. The empty string is
/// the folder root and parents every non-empty path.
pub fn is_parent(path: &str, parent: &str) -> bool {
    if parent.is_empty() {
        return !path.is_empty();
    }
    match path.strip_prefix(parent) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// The parent of a relative path, or the empty string for top-level names.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Clean a user-supplied relative path: collapse `.` and `..`, drop empty
/// segments and trailing slashes. Paths that would escape the folder root are
/// rejected.
pub fn canonicalize(path: &str) -> Result<String> {
    let trimmed = path.trim_start_matches('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in trimmed.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(SyncError::InvalidPath(format!(
                        "{path:?} escapes the folder root"
                    )));
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}
