//! Validation of peer-supplied relative paths.
//!
//! Every name that arrives over the wire is hostile until proven otherwise:
//! it must stay inside the destination root after normalisation, must not
//! smuggle the local separator inside a component, and must not silently
//! change meaning on filesystems that drop trailing dots. A violation is a
//! [`SecurityError`]; the offending entry stays in the file list so index
//! numbering remains aligned with the peer, but it is never opened.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// A peer-supplied path that must not be used.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Absolute paths are never accepted from the wire.
    #[error("absolute path from peer: {0:?}")]
    AbsolutePath(String),

    /// `..` traversal that leaves the destination root.
    #[error("path escapes the destination root: {0:?}")]
    EscapesRoot(String),

    /// A component contains the platform's separator or a NUL byte.
    #[error("path component carries a reserved character: {0:?}")]
    ReservedCharacter(String),

    /// The name would lose information on this platform (trailing dots or
    /// spaces are dropped by some filesystems).
    #[error("path component would not resolve losslessly: {0:?}")]
    LossyComponent(String),

    /// The name does not decode under the session charset and cannot be
    /// preserved.
    #[error("path name is not representable in the session charset")]
    Unrepresentable,
}

/// Normalises `name` and resolves it under `root`.
///
/// `.` components collapse; `..` pops a previously accepted component and
/// fails when there is nothing left to pop. The returned path is always a
/// strict extension of `root` (or `root` itself for the `.` argument).
pub fn resolve_under_root(root: &Path, name: &str) -> Result<PathBuf, SecurityError> {
    if name.starts_with('/') {
        return Err(SecurityError::AbsolutePath(name.to_owned()));
    }

    let mut accepted: Vec<&str> = Vec::new();
    for component in name.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if accepted.pop().is_none() {
                    return Err(SecurityError::EscapesRoot(name.to_owned()));
                }
            }
            _ => {
                validate_component(component, name)?;
                accepted.push(component);
            }
        }
    }

    let mut resolved = root.to_path_buf();
    for component in accepted {
        resolved.push(component);
    }
    debug_assert!(resolved.starts_with(root));
    Ok(resolved)
}

fn validate_component(component: &str, full: &str) -> Result<(), SecurityError> {
    if component.contains('\0') {
        return Err(SecurityError::ReservedCharacter(full.to_owned()));
    }
    if component.contains(local_separator()) {
        return Err(SecurityError::ReservedCharacter(full.to_owned()));
    }
    if !preserves_trailing_dots() && (component.ends_with('.') || component.ends_with(' ')) {
        return Err(SecurityError::LossyComponent(full.to_owned()));
    }
    Ok(())
}

const fn local_separator() -> char {
    if cfg!(windows) { '\\' } else { '/' }
}

const fn preserves_trailing_dots() -> bool {
    !cfg!(windows)
}
