//! The file-list entry type and its total order.

use std::cmp::Ordering;
use std::path::PathBuf;

use metadata::{FileAttrs, FileType};
use thiserror::Error;

/// Rejected entry construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FileInfoError {
    /// Empty path names are never valid.
    #[error("empty path name")]
    EmptyName,

    /// Names must be relative and must not end in a separator.
    #[error("path name {0:?} starts or ends with '/'")]
    EdgeSeparator(String),

    /// The literal `.` names a directory argument and nothing else.
    #[error("path name \".\" used for a non-directory")]
    DotNonDirectory,

    /// Kind payload disagrees with the attribute type bits.
    #[error("entry detail does not match file type {0:?}")]
    DetailMismatch(FileType),
}

/// Per-kind payload of an entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileDetail {
    /// Regular file, directory, fifo, or socket.
    Plain,
    /// Symbolic link and its target, as raw bytes in the peer's charset.
    Symlink {
        /// Link target bytes.
        target: Vec<u8>,
    },
    /// Block or character device.
    Device {
        /// Major device number.
        major: u32,
        /// Minor device number.
        minor: u32,
    },
    /// Additional name for an already-listed inode. Bookkeeping only; the
    /// engine does not materialise hard links.
    Hardlink {
        /// Path bytes of the entry this one links to.
        target: Vec<u8>,
    },
}

/// Immutable metadata for one filesystem entry.
///
/// The raw name bytes are authoritative; the decoded string is present only
/// when the session charset can represent the name, and its absence marks
/// the entry untransferrable. Entries that own a local filesystem view also
/// carry a resolved absolute path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileInfo {
    name_bytes: Vec<u8>,
    name: Option<String>,
    attrs: FileAttrs,
    detail: FileDetail,
    local_path: Option<PathBuf>,
}

impl FileInfo {
    /// Builds an entry, enforcing the name invariants.
    pub fn new(
        name_bytes: Vec<u8>,
        name: Option<String>,
        attrs: FileAttrs,
        detail: FileDetail,
    ) -> Result<Self, FileInfoError> {
        if name_bytes.is_empty() {
            return Err(FileInfoError::EmptyName);
        }
        if name_bytes.first() == Some(&b'/') || name_bytes.last() == Some(&b'/') {
            return Err(FileInfoError::EdgeSeparator(
                String::from_utf8_lossy(&name_bytes).into_owned(),
            ));
        }
        if name_bytes == b"." && !attrs.is_directory() {
            return Err(FileInfoError::DotNonDirectory);
        }
        let type_matches = match &detail {
            FileDetail::Plain => !attrs.is_symlink() && !attrs.file_type().is_device(),
            FileDetail::Symlink { .. } => attrs.is_symlink(),
            FileDetail::Device { .. } => attrs.file_type().is_device(),
            FileDetail::Hardlink { .. } => true,
        };
        if !type_matches {
            return Err(FileInfoError::DetailMismatch(attrs.file_type()));
        }

        Ok(Self {
            name_bytes,
            name,
            attrs,
            detail,
            local_path: None,
        })
    }

    /// Attaches the resolved local path, making the entry locatable.
    #[must_use]
    pub fn with_local_path(mut self, path: PathBuf) -> Self {
        self.local_path = Some(path);
        self
    }

    /// Raw name bytes in the peer's charset.
    #[inline]
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        &self.name_bytes
    }

    /// Decoded name; `None` marks the entry untransferrable.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Attribute record.
    #[inline]
    #[must_use]
    pub const fn attrs(&self) -> &FileAttrs {
        &self.attrs
    }

    /// Kind payload.
    #[must_use]
    pub const fn detail(&self) -> &FileDetail {
        &self.detail
    }

    /// Resolved local path, when this side owns a filesystem view.
    #[must_use]
    pub fn local_path(&self) -> Option<&std::path::Path> {
        self.local_path.as_deref()
    }

    /// File type shorthand.
    #[inline]
    #[must_use]
    pub const fn file_type(&self) -> FileType {
        self.attrs.file_type()
    }

    /// Returns `true` for directories.
    #[inline]
    #[must_use]
    pub const fn is_directory(&self) -> bool {
        self.attrs.is_directory()
    }

    /// Returns `true` for the literal `.` directory argument.
    #[must_use]
    pub fn is_dot_dir(&self) -> bool {
        self.name_bytes == b"."
    }

    /// Symlink target bytes, when this is a symlink.
    #[must_use]
    pub fn symlink_target(&self) -> Option<&[u8]> {
        match &self.detail {
            FileDetail::Symlink { target } => Some(target),
            _ => None,
        }
    }

    /// Path bytes of the first-listed name this entry hard-links to.
    #[must_use]
    pub fn hardlink_target(&self) -> Option<&[u8]> {
        match &self.detail {
            FileDetail::Hardlink { target } => Some(target),
            _ => None,
        }
    }

    /// Bytes this entry contributes to the transfer total: regular file and
    /// symlink sizes count, everything else is metadata-only.
    #[must_use]
    pub fn transfer_size(&self) -> u64 {
        match self.file_type() {
            FileType::Regular => self.attrs.size,
            FileType::Symlink => self.symlink_target().map_or(0, |t| t.len() as u64),
            _ => 0,
        }
    }

    /// Total order used on both sides of the wire.
    ///
    /// `.` sorts first; files sort before directories; otherwise names
    /// compare bytewise with directories carrying a virtual trailing `/`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        compare_names(
            &self.name_bytes,
            self.is_directory(),
            &other.name_bytes,
            other.is_directory(),
        )
    }
}

/// Name comparison backing [`FileInfo::compare`].
#[must_use]
pub(crate) fn compare_names(a: &[u8], a_dir: bool, b: &[u8], b_dir: bool) -> Ordering {
    let a_dot = a == b".";
    let b_dot = b == b".";
    match (a_dot, b_dot) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }
    match (a_dir, b_dir) {
        (false, true) => return Ordering::Less,
        (true, false) => return Ordering::Greater,
        _ => {}
    }

    if a_dir {
        // Directory-to-directory: compare as if both names ended in '/'.
        let shared = a.len().min(b.len());
        match a[..shared].cmp(&b[..shared]) {
            Ordering::Equal => {}
            other => return other,
        }
        match a.len().cmp(&b.len()) {
            Ordering::Equal => Ordering::Equal,
            Ordering::Less => b'/'.cmp(&b[shared]),
            Ordering::Greater => a[shared].cmp(&b'/'),
        }
    } else {
        a.cmp(b)
    }
}
