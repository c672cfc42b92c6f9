//! Namespace path helpers.
//!
//! Paths on the wire are absolute, slash-delimited and case-sensitive, with
//! the shared root spelled `/`. Every path entering the server or the client
//! cache goes through [`normalize`] first.

use crate::error::{FsError, Result};

/// The root of the namespace.
pub const ROOT: &str = "/";

/// Normalize a namespace path.
///
/// Adds the leading slash, collapses repeated separators and strips a
/// trailing one. `.`/`..` components, empty names and NUL bytes are
/// rejected so a path can never escape the shared root.
pub fn normalize(path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(FsError::InvalidPath(path.to_string()));
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for component in path.split('/') {
        match component {
            "" => continue,
            "." | ".." => return Err(FsError::InvalidPath(path.to_string())),
            name => {
                normalized.push('/');
                normalized.push_str(name);
            }
        }
    }

    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Parent of a normalized path, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(i) => Some(&path[..i]),
        None => Some(ROOT),
    }
}

/// Final component of a normalized path (empty for the root).
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Join a normalized directory path and a single child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Whether `path` is `ancestor` itself or lies underneath it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT || path == ancestor {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Re-root `path` from under `from` to under `to`.
///
/// Callers must check [`is_within`] first.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        return to.to_string();
    }
    let suffix = &path[from.len()..];
    if to == ROOT {
        suffix.to_string()
    } else {
        format!("{}{}", to, suffix)
    }
}

/// Validate a single directory entry name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(FsError::InvalidPath(name.to_string()));
    }
    Ok(())
}
