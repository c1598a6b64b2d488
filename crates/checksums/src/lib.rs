#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Checksums for the delta-transfer engine.
//!
//! Three layers live here, matching the matcher's needs exactly:
//!
//! - [`RollingChecksum`]: the weak Adler-style checksum that slides over a
//!   file in O(1) per byte and selects candidate blocks.
//! - [`strong`]: the strong digests (seeded MD5 for blocks, unseeded MD5 for
//!   whole files, XXH64 as the negotiable alternative) that confirm a
//!   candidate actually matches.
//! - [`sums`]: the per-file signature: header bounds, chunk layout
//!   heuristic, and the insertion-ordered multimap the sender probes while
//!   scanning.

pub mod rolling;
pub mod strong;
pub mod sums;

pub use rolling::RollingChecksum;
pub use strong::{Md5, StrongDigest, Xxh64};
pub use sums::{SumChunk, SumHeader, SumHeaderError, SumTable};
