//! Session-level error taxonomy and the or-combined I/O error word.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use thiserror::Error;

use protocol::error::{ChannelError, ProtocolError};

/// Rejected session configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configured charset failed validation.
    #[error(transparent)]
    Charset(#[from] protocol::charset::CharsetError),

    /// Any other inconsistent option combination.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal session failure, by kind.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The peer violated framing, bounds, ordering, or versioning.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer attempted to reach outside the allowed root.
    #[error("security error: {0}")]
    Security(#[from] flist::SecurityError),

    /// Transport or local file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Filesystem back-end failure outside the per-file recovery paths.
    #[error("filesystem error: {0}")]
    Fs(#[from] metadata::FsError),

    /// The session was misconfigured.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An internal invariant broke; never reported to the peer.
    #[error("internal error: {0}")]
    Internal(String),

    /// Cooperative cancellation.
    #[error("interrupted")]
    Interrupted,
}

impl From<ChannelError> for EngineError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Io(io) => Self::Io(io),
            ChannelError::Protocol(protocol) => Self::Protocol(protocol),
        }
    }
}

impl From<flist::FilelistError> for EngineError {
    fn from(err: flist::FilelistError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<checksums::SumHeaderError> for EngineError {
    fn from(err: checksums::SumHeaderError) -> Self {
        Self::Protocol(ProtocolError::BadSumHeader(err.0))
    }
}

/// Or-combined I/O error word carried in `MSG_IO_ERROR` payloads and in the
/// session statistics. The process exit status mirrors this bit pattern.
#[derive(Clone, Debug, Default)]
pub struct IoErrorBits(Arc<AtomicI32>);

impl IoErrorBits {
    /// A local file could not be read or written.
    pub const GENERAL: i32 = 1;
    /// A source file vanished between listing and transfer.
    pub const VANISHED: i32 = 2;
    /// A file failed verification after the retry.
    pub const TRANSFER: i32 = 4;

    /// Creates a clean error word.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ors `bits` into the word.
    pub fn record(&self, bits: i32) {
        self.0.fetch_or(bits, Ordering::Relaxed);
    }

    /// Current bit pattern.
    #[must_use]
    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns `true` while no error bit has been recorded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.get() == 0
    }
}
