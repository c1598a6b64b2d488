#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Portable file attributes and the filesystem back-end.
//!
//! [`FileAttrs`] is the wire-facing attribute record: type, permission bits,
//! size, modification time, and ownership, independent of any platform
//! representation. [`Filesystem`] is the contract the transfer engine holds
//! against the local machine; [`LocalFilesystem`] implements it with `std`,
//! `filetime`, and (on Unix) `nix`. The engine threads a `&dyn Filesystem`
//! through its constructors instead of touching process-wide state, so tests
//! and alternative back-ends slot in without global configuration.

mod attrs;
mod fs;

pub use attrs::{FileAttrs, FileType, Group, User};
pub use fs::{FsError, Filesystem, LocalFilesystem};
