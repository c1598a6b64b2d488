//! Tagged message envelope for the multiplexed session stream.
//!
//! After the handshake every byte group on the wire is preceded by a 32-bit
//! little-endian tag combining a message code and a 24-bit payload length:
//!
//! ```text
//! tag = ((code + MPLEX_BASE) << 24) | (payload_len & 0x00FF_FFFF)
//! ```
//!
//! `DATA` frames carry protocol payload and are transparent to the caller;
//! every other code is an out-of-band diagnostic or control message that the
//! demultiplexer hands to a message handler as it arrives.
//!
//! # Upstream Reference
//!
//! - `io.c` - `mplex_write()` / `read_a_msg()` - tag layout
//! - `rsync.h` - `MPLEX_BASE`, `enum msgcode` - code values

use crate::error::ProtocolError;

/// Offset added to every message code before it is packed into a tag.
pub const MPLEX_BASE: u8 = 7;

/// Encoded size of a multiplexed header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload a single frame can carry (24-bit length field).
pub const MAX_PAYLOAD_LENGTH: u32 = 0x00FF_FFFF;

/// Mask isolating the payload length from a raw tag.
pub const PAYLOAD_MASK: u32 = MAX_PAYLOAD_LENGTH;

/// Message codes understood by the engine.
///
/// The numeric values are upstream rsync's `MSG_*` identifiers; codes the
/// core never exchanges (compression control, statistics forwarding) are
/// intentionally absent and arrive as [`ProtocolError::UnknownMessageCode`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum MessageCode {
    /// In-band protocol payload.
    Data = 0,
    /// Non-fatal per-file transfer error.
    ErrorXfer = 1,
    /// Informational text for the user.
    Info = 2,
    /// Fatal error text.
    Error = 3,
    /// Warning text.
    Warning = 4,
    /// Log-only text (never shown to an interactive user).
    Log = 6,
    /// Four-byte or-combined I/O error word.
    IoError = 22,
    /// Four-byte file index the sender refuses to transfer.
    NoSend = 102,
}

impl MessageCode {
    /// All codes, sorted by numeric value.
    #[must_use]
    pub const fn all() -> &'static [MessageCode] {
        &[
            MessageCode::Data,
            MessageCode::ErrorXfer,
            MessageCode::Info,
            MessageCode::Error,
            MessageCode::Warning,
            MessageCode::Log,
            MessageCode::IoError,
            MessageCode::NoSend,
        ]
    }

    /// Returns the raw wire value of this code.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Looks up a code by its raw wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::ErrorXfer),
            2 => Some(Self::Info),
            3 => Some(Self::Error),
            4 => Some(Self::Warning),
            6 => Some(Self::Log),
            22 => Some(Self::IoError),
            102 => Some(Self::NoSend),
            _ => None,
        }
    }

    /// Upstream identifier, used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Data => "MSG_DATA",
            Self::ErrorXfer => "MSG_ERROR_XFER",
            Self::Info => "MSG_INFO",
            Self::Error => "MSG_ERROR",
            Self::Warning => "MSG_WARNING",
            Self::Log => "MSG_LOG",
            Self::IoError => "MSG_IO_ERROR",
            Self::NoSend => "MSG_NO_SEND",
        }
    }

    /// Returns `true` for codes whose payload is opaque text in the session
    /// charset.
    #[must_use]
    pub const fn is_text(self) -> bool {
        matches!(
            self,
            Self::ErrorXfer | Self::Info | Self::Error | Self::Warning | Self::Log
        )
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Self::from_u8(value).ok_or(ProtocolError::UnknownMessageCode(value))
    }
}

impl From<MessageCode> for u8 {
    fn from(code: MessageCode) -> Self {
        code.as_u8()
    }
}

/// A decoded multiplexed frame header: message code plus payload length.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    code: MessageCode,
    payload_len: u32,
}

impl MessageHeader {
    /// Builds a header, rejecting payloads that overflow the 24-bit length
    /// field.
    pub const fn new(code: MessageCode, payload_len: u32) -> Result<Self, ProtocolError> {
        if payload_len > MAX_PAYLOAD_LENGTH {
            return Err(ProtocolError::OversizedPayload(payload_len));
        }
        Ok(Self { code, payload_len })
    }

    /// Message code carried by the frame.
    #[inline]
    #[must_use]
    pub const fn code(self) -> MessageCode {
        self.code
    }

    /// Payload length in bytes.
    #[inline]
    #[must_use]
    pub const fn payload_len(self) -> u32 {
        self.payload_len
    }

    /// Payload length as a `usize`.
    #[inline]
    #[must_use]
    pub const fn payload_len_usize(self) -> usize {
        self.payload_len as usize
    }

    /// Packs the header into its raw 32-bit tag.
    #[must_use]
    pub const fn encode_raw(self) -> u32 {
        ((self.code.as_u8() as u32 + MPLEX_BASE as u32) << 24) | self.payload_len
    }

    /// Encodes the header into its 4-byte little-endian wire form.
    #[must_use]
    pub const fn encode(self) -> [u8; HEADER_LEN] {
        self.encode_raw().to_le_bytes()
    }

    /// Unpacks a raw 32-bit tag.
    ///
    /// The payload length is masked to 24 bits; the tag byte must be at
    /// least [`MPLEX_BASE`] and name a known code.
    pub const fn from_raw(raw: u32) -> Result<Self, ProtocolError> {
        let tag = (raw >> 24) as u8;
        if tag < MPLEX_BASE {
            return Err(ProtocolError::InvalidTag(tag));
        }
        let code = match MessageCode::from_u8(tag - MPLEX_BASE) {
            Some(code) => code,
            None => return Err(ProtocolError::UnknownMessageCode(tag - MPLEX_BASE)),
        };
        Ok(Self {
            code,
            payload_len: raw & PAYLOAD_MASK,
        })
    }

    /// Decodes a header from its little-endian wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match <[u8; HEADER_LEN]>::try_from(bytes) {
            Ok(raw) => Self::from_raw(u32::from_le_bytes(raw)),
            Err(_) => Err(ProtocolError::Violation(format!(
                "truncated multiplexed header: {} bytes",
                bytes.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_for_all_codes_and_sample_lengths() {
        const PAYLOAD_SAMPLES: [u32; 3] = [0, 1, MAX_PAYLOAD_LENGTH];

        for &code in MessageCode::all() {
            for &len in &PAYLOAD_SAMPLES {
                let header = MessageHeader::new(code, len).expect("constructible header");
                let decoded = MessageHeader::decode(&header.encode()).expect("decode succeeds");
                assert_eq!(decoded.code(), code);
                assert_eq!(decoded.payload_len(), len);
            }
        }
    }

    #[test]
    fn new_rejects_oversized_payloads() {
        let err = MessageHeader::new(MessageCode::Info, MAX_PAYLOAD_LENGTH + 1).unwrap_err();
        assert_eq!(err, ProtocolError::OversizedPayload(MAX_PAYLOAD_LENGTH + 1));
    }

    #[test]
    fn from_raw_rejects_tag_without_base_offset() {
        let raw = (u32::from(MPLEX_BASE - 1) << 24) | 1;
        let err = MessageHeader::from_raw(raw).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidTag(MPLEX_BASE - 1));
    }

    #[test]
    fn from_raw_rejects_unknown_codes() {
        let raw = (u32::from(MPLEX_BASE) + 0x40) << 24;
        let err = MessageHeader::from_raw(raw).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownMessageCode(0x40));
    }

    #[test]
    fn encode_uses_little_endian_layout() {
        let payload_len = 0x00A1_B2C3;
        let header = MessageHeader::new(MessageCode::Info, payload_len).expect("header");
        let expected =
            ((u32::from(MPLEX_BASE) + u32::from(MessageCode::Info.as_u8())) << 24) | payload_len;
        assert_eq!(header.encode(), expected.to_le_bytes());
    }

    #[test]
    fn decode_masks_payload_length_to_24_bits() {
        let tag = (u32::from(MPLEX_BASE) + u32::from(MessageCode::Data.as_u8())) << 24;
        let header = MessageHeader::from_raw(tag | MAX_PAYLOAD_LENGTH).expect("max payload");
        assert_eq!(header.payload_len(), MAX_PAYLOAD_LENGTH);
    }

    #[test]
    fn message_code_round_trips_through_try_from() {
        for &code in MessageCode::all() {
            let decoded = MessageCode::try_from(code.as_u8()).expect("known code");
            assert_eq!(decoded, code);
        }
    }

    #[test]
    fn message_code_rejects_unknown_values() {
        assert_eq!(MessageCode::from_u8(11), None);
        assert!(MessageCode::try_from(0xFF).is_err());
    }

    #[test]
    fn text_classification_covers_diagnostic_codes() {
        assert!(MessageCode::Info.is_text());
        assert!(MessageCode::ErrorXfer.is_text());
        assert!(!MessageCode::Data.is_text());
        assert!(!MessageCode::IoError.is_text());
        assert!(!MessageCode::NoSend.is_text());
    }
}
