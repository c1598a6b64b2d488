#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `protocol` implements the byte-level substrate of the rsync version 30
//! wire protocol: little-endian framed channels with input prefetching, the
//! tagged message envelope that multiplexes out-of-band diagnostics onto the
//! data stream, the variable-length integer and file-index codecs, the
//! `@RSYNCD` session handshake, and the strict filename charset codec.
//!
//! # Design
//!
//! The crate is deliberately transport-agnostic: everything is generic over
//! [`std::io::Read`] / [`std::io::Write`]. Higher layers (the file-list codec
//! and the transfer roles) speak through the [`channel::ChannelRead`] and
//! [`channel::ChannelWrite`] traits so the same code paths serve both the
//! demultiplexed session stream and plain byte buffers in tests.
//!
//! # Invariants
//!
//! - All integer primitives on the wire are little-endian.
//! - A multiplexed tag is `((code + MPLEX_BASE) << 24) | payload_len` with
//!   `payload_len` confined to 24 bits.
//! - Varint round-trips hold for every non-negative 64-bit value and every
//!   minimum width in `1..=8`.

pub mod channel;
pub mod charset;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod varint;

pub use channel::{ChannelRead, ChannelWrite};
pub use charset::TextCodec;
pub use envelope::{MessageCode, MessageHeader, MAX_PAYLOAD_LENGTH, MPLEX_BASE};
pub use error::{ChannelError, ProtocolError};
pub use handshake::ProtocolVersion;

/// File index sentinel: the current phase or segment is complete.
pub const INDEX_DONE: i32 = -1;

/// File index sentinel: the incremental file list has ended.
pub const INDEX_EOF: i32 = -2;

/// Base offset for stub-directory expansion requests. A peer asking for
/// directory `d` to be expanded transmits `INDEX_OFFSET - d`.
pub const INDEX_OFFSET: i32 = -101;
