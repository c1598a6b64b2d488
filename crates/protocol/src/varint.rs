//! Variable-length integer and file-index codecs.
//!
//! Two encodings share this module. The *varlong* encoding carries sizes,
//! timestamps, and ids: a field declared with minimum width `m` occupies
//! between `m` and 9 bytes, the first byte acting as a header whose count of
//! leading one bits announces how many extension bytes follow and whose
//! remaining low bits hold the most significant value byte when it fits.
//! The *index* encoding carries file-list indices as deltas against the
//! previously transmitted index, with a one-byte fast path and `0xFE`/`0xFF`
//! escape prefixes for wide or negative values.
//!
//! # Upstream Reference
//!
//! - `io.c` - `write_varlong()` / `read_varlong()` - header-byte layout
//! - `io.c` - `write_ndx()` / `read_ndx()` - delta index packing

use crate::channel::{ChannelRead, ChannelWrite};
use crate::error::{ChannelError, ProtocolError};
use crate::INDEX_DONE;

/// Widest wire form of a varlong: header byte plus eight value bytes.
pub const MAX_VARLONG_LEN: usize = 9;

/// Encodes `value` with the given minimum byte count (`1..=8`).
///
/// Only non-negative values are representable; callers hold that invariant
/// and a violation is reported as a protocol-layer defect rather than
/// silently wrapping.
pub fn write_varlong<W: ChannelWrite + ?Sized>(
    writer: &mut W,
    value: i64,
    min_bytes: usize,
) -> Result<(), ChannelError> {
    debug_assert!((1..=8).contains(&min_bytes));
    if value < 0 {
        return Err(ProtocolError::NegativeValue {
            field: "varlong",
            value,
        }
        .into());
    }

    let raw = value.to_le_bytes();
    let mut cnt = 8;
    while cnt > min_bytes && raw[cnt - 1] == 0 {
        cnt -= 1;
    }

    let ext = cnt - min_bytes;
    let bit = 1u8 << (7 - ext);
    let top = raw[cnt - 1];

    let mut out = [0u8; MAX_VARLONG_LEN];
    let total;
    if top >= bit {
        // The top byte collides with the extension prefix: spill it into an
        // extra wire byte and let the header carry the prefix alone.
        out[0] = !(bit - 1);
        out[1..=cnt].copy_from_slice(&raw[..cnt]);
        total = cnt + 1;
    } else {
        out[0] = if ext > 0 {
            top | !((bit << 1).wrapping_sub(1))
        } else {
            top
        };
        out[1..cnt].copy_from_slice(&raw[..cnt - 1]);
        total = cnt;
    }

    writer.put_bytes(&out[..total])
}

/// Decodes a varlong declared with the given minimum byte count.
pub fn read_varlong<R: ChannelRead + ?Sized>(
    reader: &mut R,
    min_bytes: usize,
) -> Result<i64, ChannelError> {
    debug_assert!((1..=8).contains(&min_bytes));

    let mut head = [0u8; 8];
    reader.get_bytes(&mut head[..min_bytes])?;
    let header = head[0];

    let ext = header.leading_ones() as usize;
    if min_bytes + ext > MAX_VARLONG_LEN {
        return Err(ProtocolError::VarintOverflow { header, min_bytes }.into());
    }

    let mut value = [0u8; MAX_VARLONG_LEN];
    value[..min_bytes - 1].copy_from_slice(&head[1..min_bytes]);
    if ext > 0 {
        reader.get_bytes(&mut value[min_bytes - 1..min_bytes - 1 + ext])?;
    }

    let residual = if ext >= 8 { 0 } else { header & (0xFF >> ext) };
    value[min_bytes - 1 + ext] = residual;

    if value[8] != 0 || value[7] & 0x80 != 0 {
        return Err(ProtocolError::VarintOverflow { header, min_bytes }.into());
    }

    let mut fixed = [0u8; 8];
    fixed.copy_from_slice(&value[..8]);
    Ok(i64::from_le_bytes(fixed))
}

/// Encodes a 32-bit quantity with the single-byte minimum width.
pub fn write_varint<W: ChannelWrite + ?Sized>(
    writer: &mut W,
    value: i32,
) -> Result<(), ChannelError> {
    write_varlong(writer, i64::from(value), 1)
}

/// Decodes a 32-bit quantity encoded by [`write_varint`].
pub fn read_varint<R: ChannelRead + ?Sized>(reader: &mut R) -> Result<i32, ChannelError> {
    let value = read_varlong(reader, 1)?;
    i32::try_from(value).map_err(|_| {
        ProtocolError::Violation(format!("varint {value} exceeds the 32-bit range")).into()
    })
}

/// Stateful encoder for file-list indices.
///
/// Each direction of a session owns one encoder; the deltas are computed
/// against the previous index sent in that direction, with separate bases for
/// positive and negative values.
#[derive(Debug)]
pub struct IndexEncoder {
    prev_positive: i32,
    prev_negative: i32,
}

impl Default for IndexEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexEncoder {
    /// Creates an encoder with the protocol's initial bases.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prev_positive: -1,
            prev_negative: 1,
        }
    }

    /// Writes one index.
    ///
    /// [`INDEX_DONE`] is a bare zero byte and does not disturb the bases.
    pub fn write_index<W: ChannelWrite + ?Sized>(
        &mut self,
        writer: &mut W,
        index: i32,
    ) -> Result<(), ChannelError> {
        if index == INDEX_DONE {
            return writer.put_byte(0);
        }

        let magnitude;
        let diff;
        if index >= 0 {
            diff = index - self.prev_positive;
            self.prev_positive = index;
            magnitude = index;
        } else {
            writer.put_byte(0xFF)?;
            magnitude = -index;
            diff = magnitude - self.prev_negative;
            self.prev_negative = magnitude;
        }

        if (1..0xFE).contains(&diff) {
            writer.put_byte(diff as u8)
        } else if !(0..=0x7FFF).contains(&diff) {
            // Wide delta: transmit the absolute index with a marker bit.
            writer.put_byte(0xFE)?;
            writer.put_byte(((magnitude >> 24) as u8) | 0x80)?;
            writer.put_byte(magnitude as u8)?;
            writer.put_byte((magnitude >> 8) as u8)?;
            writer.put_byte((magnitude >> 16) as u8)
        } else {
            writer.put_byte(0xFE)?;
            writer.put_byte((diff >> 8) as u8)?;
            writer.put_byte(diff as u8)
        }
    }
}

/// Stateful decoder matching [`IndexEncoder`].
#[derive(Debug)]
pub struct IndexDecoder {
    prev_positive: i32,
    prev_negative: i32,
}

impl Default for IndexDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexDecoder {
    /// Creates a decoder with the protocol's initial bases.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prev_positive: -1,
            prev_negative: 1,
        }
    }

    /// Reads one index.
    pub fn read_index<R: ChannelRead + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<i32, ChannelError> {
        let mut lead = reader.get_byte()?;
        let negative = lead == 0xFF;
        if negative {
            lead = reader.get_byte()?;
        } else if lead == 0 {
            return Ok(INDEX_DONE);
        }

        let prev = if negative {
            self.prev_negative
        } else {
            self.prev_positive
        };

        let magnitude = if lead == 0xFE {
            let hi = reader.get_byte()?;
            if hi & 0x80 != 0 {
                let b0 = reader.get_byte()?;
                let b1 = reader.get_byte()?;
                let b2 = reader.get_byte()?;
                i32::from(b0)
                    | (i32::from(b1) << 8)
                    | (i32::from(b2) << 16)
                    | (i32::from(hi & 0x7F) << 24)
            } else {
                let lo = reader.get_byte()?;
                let diff = (i32::from(hi) << 8) | i32::from(lo);
                checked_delta(prev, diff)?
            }
        } else {
            checked_delta(prev, i32::from(lead))?
        };

        if negative {
            self.prev_negative = magnitude;
            Ok(-magnitude)
        } else {
            self.prev_positive = magnitude;
            Ok(magnitude)
        }
    }
}

fn checked_delta(prev: i32, diff: i32) -> Result<i32, ChannelError> {
    prev.checked_add(diff).ok_or_else(|| {
        ProtocolError::Violation("file index delta overflows 32 bits".to_owned()).into()
    })
}
