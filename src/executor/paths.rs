//! Path containment for file and process tools.
//!
//! Every path a tool touches goes through [`contain`]: expand `~`, join
//! relative paths onto the executor's working directory, resolve `..` and
//! symlinks to a canonical absolute path, then require one of the allowed
//! directories as a prefix. Traversal like `../../etc/passwd` fails the
//! prefix check, not a pattern blacklist.

use std::path::{Component, Path, PathBuf};

/// Resolve `.` and `..` components without touching the filesystem.
///
/// `..` at the root is dropped; prefix/root components are kept.
pub(crate) fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    // already at the root; nothing above it
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalise as much of the path as exists.
///
/// The deepest existing ancestor is resolved through the filesystem
/// (following symlinks); non-existent trailing components are appended
/// as-is. Input must already be absolute and lexically normalised.
pub(crate) fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }

    let mut out = existing.canonicalize().unwrap_or(existing);
    for name in tail.iter().rev() {
        out.push(name);
    }
    out
}

/// Apply the containment algorithm to a raw path string.
///
/// # Arguments
/// * `raw` - Path as supplied by the model or a plan step.
/// * `working_dir` - Base for relative paths; already canonical.
/// * `allowed` - Canonicalised allowed directories.
///
/// # Returns
/// The canonical absolute path, or the fixed rejection message.
pub(crate) fn contain(
    raw: &str,
    working_dir: &Path,
    allowed: &[PathBuf],
) -> Result<PathBuf, String> {
    let expanded = shellexpand::tilde(raw).into_owned();
    let candidate = PathBuf::from(expanded);

    let absolute = if candidate.is_absolute() {
        candidate
    } else {
        working_dir.join(candidate)
    };

    let canonical = canonicalize_lenient(&normalize_lexically(&absolute));

    if allowed.iter().any(|dir| canonical.starts_with(dir)) {
        Ok(canonical)
    } else {
        Err("not in allowed directories".to_string())
    }
}
