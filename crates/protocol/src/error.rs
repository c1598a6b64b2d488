//! Error types shared by the wire-protocol layers.

use std::io;

use thiserror::Error;

/// A violation of the wire protocol by the remote peer.
///
/// Protocol errors are always fatal to the session: once framing, bounds,
/// ordering, or versioning have been broken there is no way to resynchronise
/// with the peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A multiplexed header's tag byte was below the multiplex base.
    #[error("multiplexed header contained invalid tag byte {0}")]
    InvalidTag(u8),

    /// A multiplexed header named a message code this implementation does
    /// not recognise.
    #[error("unknown multiplexed message code: {0}")]
    UnknownMessageCode(u8),

    /// A frame payload exceeded the 24-bit length field.
    #[error("multiplexed payload length {0} exceeds the 24-bit limit")]
    OversizedPayload(u32),

    /// A fixed-width control payload arrived with the wrong length.
    #[error("{code} payload must be exactly {expected} bytes, received {actual}")]
    BadControlPayload {
        /// Upstream message identifier, e.g. `MSG_IO_ERROR`.
        code: &'static str,
        /// Required payload length.
        expected: usize,
        /// Length the peer actually sent.
        actual: usize,
    },

    /// A variable-length integer extended past the representable range.
    #[error("variable-length integer overflows 64 bits (header {header:#04x}, min {min_bytes})")]
    VarintOverflow {
        /// Header byte that announced the oversized extension.
        header: u8,
        /// Minimum byte count the field was declared with.
        min_bytes: usize,
    },

    /// A decoded value was negative where the protocol requires a
    /// non-negative quantity.
    #[error("negative {field} on the wire: {value}")]
    NegativeValue {
        /// Field being decoded.
        field: &'static str,
        /// Offending value.
        value: i64,
    },

    /// A file index arrived in a context where it is not allowed.
    #[error("file index {index} is not valid here: {context}")]
    UnexpectedIndex {
        /// Index received from the peer.
        index: i32,
        /// Why the index is rejected.
        context: &'static str,
    },

    /// The peer advertised an older protocol version than we speak.
    #[error("peer protocol version {peer} is older than local version {local}")]
    VersionMismatch {
        /// Version the peer advertised.
        peer: crate::handshake::ProtocolVersion,
        /// Version this implementation speaks.
        local: crate::handshake::ProtocolVersion,
    },

    /// The `@RSYNCD` greeting line could not be parsed.
    #[error("malformed handshake line: {0:?}")]
    MalformedGreeting(String),

    /// A text payload did not decode under the session charset.
    #[error("message payload is not valid in the session charset")]
    UndecodableText,

    /// The checksum header carried out-of-range fields.
    #[error("checksum header out of range: {0}")]
    BadSumHeader(String),

    /// Catch-all for structural violations detected by higher layers.
    #[error("protocol violation: {0}")]
    Violation(String),
}

/// Failure of a channel operation: either the underlying transport failed or
/// the peer violated the protocol.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Transport-level read or write failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The peer broke the wire protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ChannelError {
    /// Returns `true` when the failure was a peer protocol violation rather
    /// than a local transport error.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Convenience constructor for an unexpected end of stream.
    #[must_use]
    pub fn unexpected_eof(context: &str) -> Self {
        Self::Io(io::Error::new(io::ErrorKind::UnexpectedEof, context.to_owned()))
    }
}
