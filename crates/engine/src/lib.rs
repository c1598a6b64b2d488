#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `engine` drives a protocol-30 delta transfer end to end. One peer runs
//! the [`sender`]; the other runs the receiving pair, a [`generator`]
//! producing block-checksum requests and a [`receiver`] applying the
//! sender's replies, as two workers sharing one duplex connection.
//!
//! # Design
//!
//! The send side is single-threaded: a loop that answers index/checksum
//! requests with matched-block tokens and literal data. The receive side
//! splits across two threads supervised by [`session::run_receiver`]: the
//! generator owns the outbound half of the connection (requests, `DONE`
//! phase markers), the receiver owns the inbound half (file-list segments,
//! delta tokens, out-of-band messages). They cooperate through a bounded
//! job queue and a shared [`flist::Filelist`] behind a mutex.
//!
//! # Errors
//!
//! [`EngineError`] is the session-level taxonomy: peer protocol violations,
//! path-safety rejections, local I/O, configuration, internal invariant
//! breaks, and cooperative interruption. Per-file failures do not surface
//! here; they are reported to the peer and accumulated as or-combined
//! [`IoErrorBits`] in the session [`Statistics`].

pub mod config;
pub mod error;
pub mod generator;
pub mod item;
pub mod messages;
pub mod phase;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;

pub use config::{FilterMode, SessionConfig};
pub use error::{ConfigError, EngineError, IoErrorBits};
pub use phase::TransferPhase;
pub use session::{run_receiver, run_sender};
pub use stats::Statistics;

/// Hard cap on a literal burst in the delta stream.
pub const LITERAL_BURST: usize = 8 * 1024;
