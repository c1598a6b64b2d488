//! Tagged output framing.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::envelope::{MessageCode, MessageHeader, MAX_PAYLOAD_LENGTH};
use crate::error::ChannelError;

use super::ChannelWrite;

/// Writer that frames outbound bytes into `DATA` envelopes.
///
/// Protocol payload accumulates in a pending buffer and is emitted as one
/// frame per flush (or earlier, when the buffer reaches the frame
/// threshold). Out-of-band messages cut the pending data off into its own
/// frame first so byte order on the wire matches call order.
#[derive(Debug)]
pub struct TaggedWriter<W> {
    inner: W,
    pending: Vec<u8>,
    threshold: usize,
}

impl<W: Write> TaggedWriter<W> {
    /// Frame emission threshold for buffered payload.
    pub const DEFAULT_THRESHOLD: usize = 8 * 1024;

    /// Wraps a transport.
    pub fn new(inner: W) -> Self {
        Self::with_threshold(inner, Self::DEFAULT_THRESHOLD)
    }

    /// Wraps a transport with an explicit frame threshold.
    pub fn with_threshold(inner: W, threshold: usize) -> Self {
        let threshold = threshold.clamp(1, MAX_PAYLOAD_LENGTH as usize);
        Self {
            inner,
            pending: Vec::with_capacity(threshold),
            threshold,
        }
    }

    /// Bytes waiting to be framed.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn emit_pending(&mut self) -> Result<(), ChannelError> {
        while !self.pending.is_empty() {
            let take = self.pending.len().min(MAX_PAYLOAD_LENGTH as usize);
            let header = MessageHeader::new(MessageCode::Data, take as u32)?;
            self.inner.write_all(&header.encode())?;
            self.inner.write_all(&self.pending[..take])?;
            self.pending.drain(..take);
        }
        Ok(())
    }

    /// Sends an out-of-band message ahead of any future data, flushing the
    /// transport so diagnostics are not held hostage by buffering.
    pub fn send_message(&mut self, code: MessageCode, payload: &[u8]) -> Result<(), ChannelError> {
        self.emit_pending()?;
        let header = MessageHeader::new(code, payload.len() as u32)?;
        self.inner.write_all(&header.encode())?;
        self.inner.write_all(payload)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Consumes the writer, flushing everything buffered.
    pub fn into_inner(mut self) -> Result<W, ChannelError> {
        self.emit_pending()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> ChannelWrite for TaggedWriter<W> {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() >= self.threshold {
            self.emit_pending()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ChannelError> {
        self.emit_pending()?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Cloneable handle to a [`TaggedWriter`] shared between the generator and
/// receiver workers.
///
/// The writer's pending buffer is the outbound byte queue of the receiving
/// side; the mutex serialises the two producers, and the demultiplexer uses
/// [`SharedWriter::flush_if_dirty`] to break read/write deadlocks.
#[derive(Debug)]
pub struct SharedWriter<W>(Arc<Mutex<TaggedWriter<W>>>);

impl<W> Clone for SharedWriter<W> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<W: Write> SharedWriter<W> {
    /// Wraps a transport in a shared tagged writer.
    pub fn new(inner: W) -> Self {
        Self(Arc::new(Mutex::new(TaggedWriter::new(inner))))
    }

    fn lock(&self) -> MutexGuard<'_, TaggedWriter<W>> {
        // A worker that panicked while holding the lock has already doomed
        // the session; the supervisor surfaces its error. The buffer itself
        // is still structurally sound, so continue and let shutdown proceed.
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sends an out-of-band message.
    pub fn send_message(&self, code: MessageCode, payload: &[u8]) -> Result<(), ChannelError> {
        self.lock().send_message(code, payload)
    }

    /// Flushes only when payload is actually pending, so a reader probing
    /// for deadlock avoidance does not cause empty transport writes.
    pub fn flush_if_dirty(&self) -> Result<(), ChannelError> {
        let mut writer = self.lock();
        if writer.pending_len() > 0 {
            writer.flush()?;
        }
        Ok(())
    }
}

impl<W: Write> ChannelWrite for SharedWriter<W> {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.lock().put_bytes(bytes)
    }

    fn flush(&mut self) -> Result<(), ChannelError> {
        self.lock().flush()
    }
}
