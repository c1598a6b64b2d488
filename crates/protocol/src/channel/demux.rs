//! Inbound frame demultiplexer.

use std::io::{Read, Write};

use tracing::trace;

use crate::envelope::{MessageCode, MessageHeader};
use crate::error::ChannelError;

use super::{decode_oob, ChannelRead, MessageHandler, PrefetchReader, SharedWriter};

/// Reading side of a multiplexed session stream.
///
/// `DATA` frames are transparent: callers read protocol payload as a plain
/// byte stream. Any other frame is decoded and handed to the message handler
/// before reading resumes. Before the first blocking transport read of a
/// field, the shared writer is flushed if it holds pending output; this
/// breaks the deadlock where both peers hold buffered requests while waiting
/// for input.
#[derive(Debug)]
pub struct Demux<R, W, H> {
    reader: PrefetchReader<R>,
    writer: SharedWriter<W>,
    handler: H,
    data_remaining: usize,
    data_consumed: u64,
}

impl<R: Read, W: Write, H: MessageHandler> Demux<R, W, H> {
    /// Couples the reading half of a transport to the session's shared
    /// writer and message handler.
    pub fn new(reader: R, writer: SharedWriter<W>, handler: H) -> Self {
        Self::from_reader(PrefetchReader::new(reader), writer, handler)
    }

    /// Like [`Demux::new`], but adopts an existing prefetch buffer so bytes
    /// read ahead during the handshake are not lost.
    pub fn from_reader(reader: PrefetchReader<R>, writer: SharedWriter<W>, handler: H) -> Self {
        Self {
            reader,
            writer,
            handler,
            data_remaining: 0,
            data_consumed: 0,
        }
    }

    /// Borrows the message handler.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Total data-frame payload bytes served to the caller so far.
    #[must_use]
    pub const fn data_consumed(&self) -> u64 {
        self.data_consumed
    }

    fn read_raw(&mut self, out: &mut [u8]) -> Result<(), ChannelError> {
        if self.reader.buffered() == 0 {
            self.writer.flush_if_dirty()?;
        }
        self.reader.read_exact_buf(out).map_err(ChannelError::from)
    }

    /// Skips tags until positioned inside a non-empty `DATA` frame,
    /// dispatching out-of-band frames along the way.
    fn advance_frame(&mut self) -> Result<(), ChannelError> {
        loop {
            let mut raw = [0u8; 4];
            self.read_raw(&mut raw)?;
            let header = MessageHeader::from_raw(u32::from_le_bytes(raw))?;

            if header.code() == MessageCode::Data {
                if header.payload_len() == 0 {
                    // Zero-length data frames are keep-alives.
                    continue;
                }
                self.data_remaining = header.payload_len_usize();
                return Ok(());
            }

            trace!(code = %header.code(), len = header.payload_len(), "out-of-band frame");
            let mut payload = vec![0u8; header.payload_len_usize()];
            self.read_raw(&mut payload)?;
            let message = decode_oob(header.code(), payload)?;
            self.handler.handle(message)?;
        }
    }
}

impl<R: Read, W: Write, H: MessageHandler> ChannelRead for Demux<R, W, H> {
    fn get_bytes(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.data_remaining == 0 {
                self.advance_frame()?;
            }
            let take = (buf.len() - filled).min(self.data_remaining);
            self.read_raw(&mut buf[filled..filled + take])?;
            self.data_remaining -= take;
            self.data_consumed += take as u64;
            filled += take;
        }
        Ok(())
    }

    fn available(&self) -> usize {
        self.reader.buffered()
    }
}
