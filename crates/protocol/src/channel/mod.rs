//! Framed duplex byte channels.
//!
//! The transfer roles and the file-list codec speak through the
//! [`ChannelRead`] / [`ChannelWrite`] traits rather than `std::io` directly:
//! integer primitives are little-endian, the `char` unit is the protocol's
//! 16-bit flag word, and reads are served from a prefetch buffer so that
//! small fields never hit the transport one byte at a time.
//!
//! Concrete implementations:
//!
//! - [`PrefetchReader`] buffers a raw transport for the untagged handshake
//!   phase.
//! - [`TaggedWriter`] / [`SharedWriter`] frame outbound bytes into `DATA`
//!   envelopes and inject out-of-band messages.
//! - [`Demux`] strips inbound envelopes, dispatching non-data frames to a
//!   [`MessageHandler`] and coupling reads to the shared writer so a blocked
//!   read flushes pending output first.
//!
//! Plain `&[u8]` and `Vec<u8>` implement the traits for codec tests and for
//! staging wire fragments in memory.

mod demux;
mod reader;
mod writer;

pub use demux::Demux;
pub use reader::PrefetchReader;
pub use writer::{SharedWriter, TaggedWriter};

use crate::envelope::MessageCode;
use crate::error::{ChannelError, ProtocolError};

/// Reading half of a protocol channel.
pub trait ChannelRead {
    /// Fills `buf` completely or fails.
    fn get_bytes(&mut self, buf: &mut [u8]) -> Result<(), ChannelError>;

    /// Number of bytes already buffered locally; reading this many bytes is
    /// guaranteed not to block.
    fn available(&self) -> usize;

    /// Reads one byte.
    fn get_byte(&mut self) -> Result<u8, ChannelError> {
        let mut buf = [0u8; 1];
        self.get_bytes(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads the protocol's 16-bit flag unit, little-endian.
    fn get_char(&mut self) -> Result<u16, ChannelError> {
        let mut buf = [0u8; 2];
        self.get_bytes(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a 32-bit little-endian integer.
    fn get_int(&mut self) -> Result<i32, ChannelError> {
        let mut buf = [0u8; 4];
        self.get_bytes(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Reads a 64-bit little-endian integer.
    fn get_long(&mut self) -> Result<i64, ChannelError> {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Discards exactly `n` bytes.
    fn skip(&mut self, mut n: usize) -> Result<(), ChannelError> {
        let mut scratch = [0u8; 256];
        while n > 0 {
            let take = n.min(scratch.len());
            self.get_bytes(&mut scratch[..take])?;
            n -= take;
        }
        Ok(())
    }
}

/// Writing half of a protocol channel.
pub trait ChannelWrite {
    /// Appends raw bytes to the outbound stream.
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError>;

    /// Pushes buffered output to the transport.
    fn flush(&mut self) -> Result<(), ChannelError>;

    /// Writes one byte.
    fn put_byte(&mut self, value: u8) -> Result<(), ChannelError> {
        self.put_bytes(&[value])
    }

    /// Writes the protocol's 16-bit flag unit, little-endian.
    fn put_char(&mut self, value: u16) -> Result<(), ChannelError> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes a 32-bit little-endian integer.
    fn put_int(&mut self, value: i32) -> Result<(), ChannelError> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes a 64-bit little-endian integer.
    fn put_long(&mut self, value: i64) -> Result<(), ChannelError> {
        self.put_bytes(&value.to_le_bytes())
    }
}

/// An out-of-band message lifted off the multiplexed stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OobMessage {
    /// Diagnostic text in the peer's charset, undecoded.
    Text {
        /// Which diagnostic stream the text belongs to.
        code: MessageCode,
        /// Raw payload bytes.
        bytes: Vec<u8>,
    },
    /// Or-combined I/O error word reported by the peer.
    IoError(i32),
    /// File index the sender declines to transfer.
    NoSend(i32),
}

/// Receives out-of-band messages as the demultiplexer encounters them.
///
/// The handler runs synchronously on the reading thread, between data
/// frames; it must not attempt to read from the same channel.
pub trait MessageHandler {
    /// Processes one message.
    fn handle(&mut self, message: OobMessage) -> Result<(), ChannelError>;
}

/// Discards every message; useful for tests and the untagged sender side of
/// unit fixtures.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardMessages;

impl MessageHandler for DiscardMessages {
    fn handle(&mut self, _message: OobMessage) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Decodes a control payload into an [`OobMessage`], enforcing the 4-byte
/// length of the integer-valued codes.
pub(crate) fn decode_oob(code: MessageCode, bytes: Vec<u8>) -> Result<OobMessage, ProtocolError> {
    match code {
        MessageCode::IoError | MessageCode::NoSend => {
            let raw: [u8; 4] = match bytes.as_slice().try_into() {
                Ok(raw) => raw,
                Err(_) => {
                    return Err(ProtocolError::BadControlPayload {
                        code: code.name(),
                        expected: 4,
                        actual: bytes.len(),
                    });
                }
            };
            let value = i32::from_le_bytes(raw);
            Ok(match code {
                MessageCode::IoError => OobMessage::IoError(value),
                _ => OobMessage::NoSend(value),
            })
        }
        _ => Ok(OobMessage::Text { code, bytes }),
    }
}

impl ChannelRead for &[u8] {
    fn get_bytes(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        if self.len() < buf.len() {
            return Err(ChannelError::unexpected_eof("short read from byte slice"));
        }
        let (head, tail) = self.split_at(buf.len());
        buf.copy_from_slice(head);
        *self = tail;
        Ok(())
    }

    fn available(&self) -> usize {
        self.len()
    }
}

impl ChannelWrite for Vec<u8> {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}
