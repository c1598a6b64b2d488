//! Per-file block signatures: header, layout heuristic, and lookup table.
//!
//! The generator describes its replica as `chunk_count` blocks of
//! `block_length` bytes (the final block is `remainder` bytes when nonzero),
//! each carrying a rolling checksum and a truncated strong digest. The
//! sender loads those rows into a [`SumTable`] and probes it with the
//! rolling value of its sliding window.
//!
//! # Upstream Reference
//!
//! - `generator.c` - `sum_sizes_sqroot()` - block/digest sizing
//! - `match.c` - `build_hash_table()` / `hash_search()` - candidate lookup

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Largest negotiable block length (2^17).
pub const MAX_BLOCK_LENGTH: u32 = 1 << 17;

/// Smallest block length the heuristic will pick.
pub const MIN_BLOCK_LENGTH: u32 = 700;

/// Width of a full strong digest.
pub const MAX_DIGEST_LENGTH: usize = 16;

/// Narrowest digest the protocol permits on the wire.
pub const MIN_DIGEST_LENGTH: usize = 2;

/// Bias term in the adaptive digest-length formula.
const BLOCKSUM_BIAS: u32 = 10;

/// Out-of-range checksum header field; a fatal peer violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("checksum header out of range: {0}")]
pub struct SumHeaderError(pub String);

/// The four-field signature header exchanged before chunk rows.
///
/// Wire order is `chunk_count`, `block_length`, `digest_length`,
/// `remainder`, each a 32-bit little-endian integer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SumHeader {
    chunk_count: u32,
    block_length: u32,
    digest_length: u32,
    remainder: u32,
}

impl SumHeader {
    /// Signature of a file with no usable replica: everything zero.
    pub const EMPTY: Self = Self {
        chunk_count: 0,
        block_length: 0,
        digest_length: 0,
        remainder: 0,
    };

    /// Validates and builds a header.
    pub fn new(
        chunk_count: u32,
        block_length: u32,
        digest_length: u32,
        remainder: u32,
    ) -> Result<Self, SumHeaderError> {
        if block_length > MAX_BLOCK_LENGTH {
            return Err(SumHeaderError(format!(
                "block length {block_length} exceeds {MAX_BLOCK_LENGTH}"
            )));
        }
        if block_length == 0 && chunk_count != 0 {
            return Err(SumHeaderError(format!(
                "{chunk_count} chunks with zero block length"
            )));
        }
        if remainder > block_length {
            return Err(SumHeaderError(format!(
                "remainder {remainder} exceeds block length {block_length}"
            )));
        }
        if digest_length as usize > MAX_DIGEST_LENGTH {
            return Err(SumHeaderError(format!(
                "digest length {digest_length} exceeds {MAX_DIGEST_LENGTH}"
            )));
        }
        Ok(Self {
            chunk_count,
            block_length,
            digest_length,
            remainder,
        })
    }

    /// Chooses the layout for a replica of `file_size` bytes.
    ///
    /// Block length grows roughly with the square root of the file, rounded
    /// down to a multiple of 8 and clamped to
    /// [`MIN_BLOCK_LENGTH`]..=[`MAX_BLOCK_LENGTH`]; the digest width adapts
    /// so that the collision probability stays bounded as files grow.
    #[must_use]
    pub fn for_file_size(file_size: u64) -> Self {
        if file_size == 0 {
            return Self::EMPTY;
        }

        let block_length = if file_size <= u64::from(MIN_BLOCK_LENGTH) * u64::from(MIN_BLOCK_LENGTH)
        {
            MIN_BLOCK_LENGTH
        } else {
            // Highest power of two whose square is below the size, then OR in
            // lower bits while the square stays below, stopping at 8.
            let mut c: u64 = 1;
            let mut l = file_size;
            loop {
                l >>= 2;
                if l == 0 {
                    break;
                }
                c <<= 1;
            }
            if c >= u64::from(MAX_BLOCK_LENGTH) {
                MAX_BLOCK_LENGTH
            } else {
                let mut blength: u64 = 0;
                while c >= 8 {
                    blength |= c;
                    if file_size < blength * blength {
                        blength &= !c;
                    }
                    c >>= 1;
                }
                (blength as u32).clamp(MIN_BLOCK_LENGTH, MAX_BLOCK_LENGTH)
            }
        };

        let digest_length = {
            let mut bits = BLOCKSUM_BIAS;
            let mut l = file_size;
            while l >> 1 != 0 {
                bits += 2;
                l >>= 1;
            }
            let mut c = block_length;
            while c >> 1 != 0 && bits > 0 {
                bits -= 1;
                c >>= 1;
            }
            // One spare bit, minus the 32 the rolling checksum covers,
            // rounded up to whole bytes.
            let bytes = (i64::from(bits) + 1 - 32 + 7) / 8;
            bytes.clamp(MIN_DIGEST_LENGTH as i64, MAX_DIGEST_LENGTH as i64) as u32
        };

        let remainder = (file_size % u64::from(block_length)) as u32;
        let chunk_count = file_size.div_ceil(u64::from(block_length)) as u32;

        Self {
            chunk_count,
            block_length,
            digest_length,
            remainder,
        }
    }

    /// Number of chunks described.
    #[inline]
    #[must_use]
    pub const fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Nominal block length in bytes; zero means "no replica".
    #[inline]
    #[must_use]
    pub const fn block_length(&self) -> u32 {
        self.block_length
    }

    /// Truncated strong digest width in bytes.
    #[inline]
    #[must_use]
    pub const fn digest_length(&self) -> usize {
        self.digest_length as usize
    }

    /// Length of the final chunk when it is short, else zero.
    #[inline]
    #[must_use]
    pub const fn remainder(&self) -> u32 {
        self.remainder
    }

    /// Length of chunk `index`.
    #[must_use]
    pub const fn chunk_length(&self, index: u32) -> u32 {
        if index + 1 == self.chunk_count && self.remainder != 0 {
            self.remainder
        } else {
            self.block_length
        }
    }

    /// Total size of the replica the header describes.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        if self.chunk_count == 0 {
            return 0;
        }
        u64::from(self.chunk_count - 1) * u64::from(self.block_length)
            + u64::from(self.chunk_length(self.chunk_count - 1))
    }
}

/// One signature row: a chunk's position, length, and digests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SumChunk {
    /// Chunk position within the replica.
    pub index: u32,
    /// Chunk length in bytes.
    pub length: u32,
    /// Rolling checksum of the chunk.
    pub rolling: u32,
    digest: [u8; MAX_DIGEST_LENGTH],
    digest_len: u8,
}

impl SumChunk {
    /// Truncated strong digest of the chunk.
    #[must_use]
    pub fn digest(&self) -> &[u8] {
        &self.digest[..self.digest_len as usize]
    }

    /// Byte offset of the chunk within the replica.
    #[must_use]
    pub const fn offset(&self, header: &SumHeader) -> u64 {
        self.index as u64 * header.block_length as u64
    }
}

/// Signature table: chunk rows indexed by rolling checksum.
///
/// Rows with equal rolling values keep insertion order (equivalently, chunk
/// order), so candidate selection is deterministic.
#[derive(Debug)]
pub struct SumTable {
    header: SumHeader,
    chunks: Vec<SumChunk>,
    by_rolling: FxHashMap<u32, Vec<u32>>,
}

impl SumTable {
    /// Creates an empty table for the given header.
    #[must_use]
    pub fn new(header: SumHeader) -> Self {
        Self {
            header,
            chunks: Vec::with_capacity(header.chunk_count() as usize),
            by_rolling: FxHashMap::default(),
        }
    }

    /// Header the table was built from.
    #[must_use]
    pub const fn header(&self) -> &SumHeader {
        &self.header
    }

    /// Appends the next chunk row. Rows arrive in chunk order; the length is
    /// derived from the header.
    ///
    /// Oversized digests are truncated to the header's width; short ones are
    /// a caller bug upstream of this table and are zero-padded.
    pub fn push(&mut self, rolling: u32, digest: &[u8]) {
        let index = self.chunks.len() as u32;
        debug_assert!(index < self.header.chunk_count());

        let mut row_digest = [0u8; MAX_DIGEST_LENGTH];
        let len = digest.len().min(self.header.digest_length());
        row_digest[..len].copy_from_slice(&digest[..len]);

        self.chunks.push(SumChunk {
            index,
            length: self.header.chunk_length(index),
            rolling,
            digest: row_digest,
            digest_len: self.header.digest_length() as u8,
        });
        self.by_rolling.entry(rolling).or_default().push(index);
    }

    /// Number of rows loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` when no rows are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk row by position.
    #[must_use]
    pub fn chunk(&self, index: u32) -> Option<&SumChunk> {
        self.chunks.get(index as usize)
    }

    /// Candidates whose rolling checksum and length match the window,
    /// ordered for deterministic tie-breaking: the first candidate at or
    /// after `preferred` comes first, then the rest in ascending order,
    /// wrapping around.
    ///
    /// Preferring the chunk after the previous match makes contiguous runs
    /// of matches line up, which keeps the emitted token stream compact.
    pub fn candidates(
        &self,
        rolling: u32,
        window_len: u32,
        preferred: u32,
    ) -> impl Iterator<Item = &SumChunk> + '_ {
        let indices = self.by_rolling.get(&rolling).map_or(&[][..], Vec::as_slice);
        let pivot = indices.partition_point(|&index| index < preferred);
        indices[pivot..]
            .iter()
            .chain(&indices[..pivot])
            .map(|&index| &self.chunks[index as usize])
            .filter(move |chunk| chunk.length == window_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_rejects_out_of_range_fields() {
        assert!(SumHeader::new(1, MAX_BLOCK_LENGTH + 1, 16, 0).is_err());
        assert!(SumHeader::new(3, 0, 16, 0).is_err());
        assert!(SumHeader::new(2, 1024, 16, 1025).is_err());
        assert!(SumHeader::new(2, 1024, 17, 0).is_err());
    }

    #[test]
    fn empty_header_describes_no_replica() {
        let header = SumHeader::EMPTY;
        assert_eq!(header.chunk_count(), 0);
        assert_eq!(header.block_length(), 0);
        assert_eq!(header.file_size(), 0);
    }

    #[test]
    fn layout_uses_minimum_block_for_small_files() {
        let header = SumHeader::for_file_size(100 * 1024);
        assert_eq!(header.block_length(), MIN_BLOCK_LENGTH);
        assert_eq!(header.digest_length(), MIN_DIGEST_LENGTH);
    }

    #[test]
    fn layout_tracks_square_root_for_large_files() {
        let size: u64 = 1 << 30;
        let header = SumHeader::for_file_size(size);
        let block = u64::from(header.block_length());
        assert_eq!(block % 8, 0, "block length is a multiple of 8");
        assert!(block * block <= size * 4, "block not far above sqrt");
        assert!(size <= block * block * 4, "block not far below sqrt");
        assert!(header.digest_length() > MIN_DIGEST_LENGTH);
    }

    #[test]
    fn layout_clamps_at_the_protocol_maximum() {
        let header = SumHeader::for_file_size(1 << 45);
        assert_eq!(header.block_length(), MAX_BLOCK_LENGTH);
        assert!(header.digest_length() >= 6, "digest widens with the file");
    }

    #[test]
    fn layout_accounts_for_every_byte() {
        for size in [1u64, 699, 700, 701, 4096, 490_001, 1 << 24] {
            let header = SumHeader::for_file_size(size);
            assert_eq!(header.file_size(), size, "size {size}");
            let expected_remainder = (size % u64::from(header.block_length())) as u32;
            assert_eq!(header.remainder(), expected_remainder, "size {size}");
        }
    }

    #[test]
    fn final_short_chunk_length_comes_from_the_remainder() {
        let header = SumHeader::new(3, 1024, 16, 100).expect("valid header");
        assert_eq!(header.chunk_length(0), 1024);
        assert_eq!(header.chunk_length(1), 1024);
        assert_eq!(header.chunk_length(2), 100);
    }

    fn table_with_rollings(rollings: &[u32]) -> SumTable {
        let header =
            SumHeader::new(rollings.len() as u32, 1024, 4, 0).expect("valid header");
        let mut table = SumTable::new(header);
        for (i, &rolling) in rollings.iter().enumerate() {
            table.push(rolling, &[i as u8; 4]);
        }
        table
    }

    #[test]
    fn candidates_filter_by_rolling_and_length() {
        let table = table_with_rollings(&[7, 9, 7, 7]);
        let hits: Vec<u32> = table.candidates(7, 1024, 0).map(|c| c.index).collect();
        assert_eq!(hits, vec![0, 2, 3]);
        assert!(table.candidates(8, 1024, 0).next().is_none());
        assert!(table.candidates(7, 512, 0).next().is_none());
    }

    #[test]
    fn candidates_start_at_the_preferred_index_and_wrap() {
        let table = table_with_rollings(&[7, 7, 7, 7]);
        let hits: Vec<u32> = table.candidates(7, 1024, 2).map(|c| c.index).collect();
        assert_eq!(hits, vec![2, 3, 0, 1]);
    }

    #[test]
    fn chunk_offsets_use_the_nominal_block_length() {
        let header = SumHeader::new(3, 1024, 4, 100).expect("valid header");
        let mut table = SumTable::new(header);
        for i in 0..3 {
            table.push(i, &[0u8; 4]);
        }
        let last = table.chunk(2).expect("chunk present");
        assert_eq!(last.offset(&header), 2048);
        assert_eq!(last.length, 100);
    }
}
