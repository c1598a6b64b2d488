//! Prefetching input buffer.

use std::io::{self, Read};

use crate::error::ChannelError;

use super::ChannelRead;

/// Buffered reader with a compacting prefetch window.
///
/// Reads pull at least the requested amount from the transport; once bytes
/// are buffered, small reads are served without touching the transport
/// again. Requests larger than the buffer bypass it entirely.
#[derive(Debug)]
pub struct PrefetchReader<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl<R: Read> PrefetchReader<R> {
    /// Default prefetch window size.
    pub const DEFAULT_CAPACITY: usize = 8 * 1024;

    /// Wraps `inner` with the default window.
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, Self::DEFAULT_CAPACITY)
    }

    /// Wraps `inner` with an explicit window size.
    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            buf: vec![0u8; capacity.max(64)],
            start: 0,
            end: 0,
        }
    }

    /// Bytes currently buffered.
    #[inline]
    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// View of the buffered bytes.
    #[must_use]
    pub fn buffered_slice(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Marks `n` buffered bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered());
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Performs one transport read into the window, compacting first when
    /// the tail has no room. Returns the number of bytes gained; zero means
    /// end of stream.
    pub fn fill_some(&mut self) -> io::Result<usize> {
        if self.end == self.buf.len() {
            if self.start == 0 {
                // Window is full; the caller should have consumed something.
                return Ok(0);
            }
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let n = self.inner.read(&mut self.buf[self.end..])?;
        self.end += n;
        Ok(n)
    }

    /// Serves `out` from the window, reading the transport as needed. Large
    /// tails are read straight into `out`.
    pub fn read_exact_buf(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let buffered = self.buffered();
            if buffered > 0 {
                let take = buffered.min(out.len() - filled);
                out[filled..filled + take].copy_from_slice(&self.buf[self.start..self.start + take]);
                self.consume(take);
                filled += take;
                continue;
            }

            let remaining = out.len() - filled;
            if remaining >= self.buf.len() {
                self.inner.read_exact(&mut out[filled..])?;
                return Ok(());
            }
            if self.fill_some()? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("transport closed with {remaining} bytes outstanding"),
                ));
            }
        }
        Ok(())
    }

    /// Consumes the reader, returning the transport.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> ChannelRead for PrefetchReader<R> {
    fn get_bytes(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        self.read_exact_buf(buf).map_err(ChannelError::from)
    }

    fn available(&self) -> usize {
        self.buffered()
    }
}
