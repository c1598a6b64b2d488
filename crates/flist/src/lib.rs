#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! File-list handling for the wiresync engine.
//!
//! A transfer is driven by an ordered, integer-indexed list of file metadata
//! entries. This crate owns that model end to end:
//!
//! - [`FileInfo`]: one entry: raw name bytes in the peer's charset, the
//!   decoded name when it survives the session codec, attributes, and the
//!   per-kind payload (symlink target, device numbers, hard-link target).
//! - [`Filelist`] / [`Segment`]: the index-addressed bookkeeping, including
//!   the stub directories that incremental recursion expands on demand.
//! - [`codec`]: the incremental wire encoder/decoder with its one-entry
//!   delta cache.
//! - [`path`]: validation of peer-supplied relative paths against the
//!   destination root.
//!
//! Entries are sorted by [`FileInfo::compare`]; both peers apply the same
//! order, which is what makes bare integer indices meaningful across the
//! wire.

pub mod codec;
mod info;
pub mod path;
mod segment;

pub use codec::{CodecOptions, DecodedEntry, FlistDecoder, FlistEncoder};
pub use info::{FileDetail, FileInfo, FileInfoError};
pub use path::SecurityError;
pub use segment::{Filelist, FilelistError, Segment, SegmentBuilder};

/// Longest relative path accepted from the wire, in bytes.
pub const MAX_PATH_NAME_LENGTH: usize = 4096;
