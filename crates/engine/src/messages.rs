//! Out-of-band message handling for both roles.

use std::sync::{Arc, Mutex, PoisonError};

use protocol::channel::{MessageHandler, OobMessage};
use protocol::error::ChannelError;
use protocol::{MessageCode, TextCodec};
use tracing::{error, info, warn};

use crate::error::IoErrorBits;

/// Handler wired into each role's demultiplexer.
///
/// Text diagnostics surface through `tracing` at a level matching their
/// code; integer control messages update shared session state. The handler
/// runs on the reading thread between data frames, so it only touches
/// lock-cheap shared state.
#[derive(Clone, Debug)]
pub struct SessionMessages {
    codec: TextCodec,
    errors: IoErrorBits,
    no_send: Arc<Mutex<Vec<i32>>>,
}

impl SessionMessages {
    /// Creates a handler feeding the given error word.
    #[must_use]
    pub fn new(codec: TextCodec, errors: IoErrorBits) -> Self {
        Self {
            codec,
            errors,
            no_send: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Drains the indices the peer refused to send.
    #[must_use]
    pub fn take_no_send(&self) -> Vec<i32> {
        std::mem::take(
            &mut *self
                .no_send
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn text(&self, bytes: &[u8]) -> Result<String, ChannelError> {
        self.codec
            .decode(bytes)
            .ok_or_else(|| protocol::ProtocolError::UndecodableText.into())
    }
}

impl MessageHandler for SessionMessages {
    fn handle(&mut self, message: OobMessage) -> Result<(), ChannelError> {
        match message {
            OobMessage::Text { code, bytes } => {
                let text = self.text(&bytes)?;
                match code {
                    MessageCode::Error => error!(peer = true, "{text}"),
                    MessageCode::ErrorXfer => {
                        self.errors.record(IoErrorBits::TRANSFER);
                        error!(peer = true, "{text}");
                    }
                    MessageCode::Warning => warn!(peer = true, "{text}"),
                    _ => info!(peer = true, "{text}"),
                }
            }
            OobMessage::IoError(bits) => {
                self.errors.record(bits);
                warn!(bits, "peer reported I/O errors");
            }
            OobMessage::NoSend(index) => {
                self.errors.record(IoErrorBits::TRANSFER);
                self.no_send
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(index);
                warn!(index, "peer refused to send file");
            }
        }
        Ok(())
    }
}
