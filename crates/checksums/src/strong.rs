//! Strong digests used to confirm candidate block matches.
//!
//! The block digest seeds the hash with the session's checksum seed so a
//! hostile peer cannot precompute collisions across sessions; following the
//! protocol-30 wire format, the seed bytes are appended *after* the window
//! bytes. The whole-file transfer digest is unseeded.

use digest::Digest;

/// Trait implemented by the strong checksum algorithms.
///
/// Callers feed data incrementally via [`Self::update`] and obtain the final
/// digest through [`Self::finalize`]; [`DIGEST_LEN`](Self::DIGEST_LEN)
/// exposes the byte width so buffers can be sized without algorithm-specific
/// knowledge.
pub trait StrongDigest: Sized {
    /// Digest output type.
    type Digest: AsRef<[u8]> + Copy;

    /// Length of the final digest in bytes.
    const DIGEST_LEN: usize;

    /// Creates a hasher with an empty state.
    fn new() -> Self;

    /// Feeds additional bytes into the digest state.
    fn update(&mut self, data: &[u8]);

    /// Finalises the digest.
    fn finalize(self) -> Self::Digest;

    /// Hashes `data` in a single call.
    fn digest(data: &[u8]) -> Self::Digest {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

/// Streaming MD5, the protocol-30 strong checksum.
#[derive(Clone, Debug)]
pub struct Md5 {
    inner: md5::Md5,
}

impl Default for Md5 {
    fn default() -> Self {
        Self::new()
    }
}

impl Md5 {
    /// Creates a hasher with an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: md5::Md5::new() }
    }

    /// Feeds additional bytes into the digest state.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalises the digest and returns the 128-bit output.
    #[must_use]
    pub fn finalize(self) -> [u8; 16] {
        self.inner.finalize().into()
    }

    /// One-shot digest of `data`.
    #[must_use]
    pub fn digest(data: &[u8]) -> [u8; 16] {
        <Self as StrongDigest>::digest(data)
    }
}

impl StrongDigest for Md5 {
    type Digest = [u8; 16];
    const DIGEST_LEN: usize = 16;

    fn new() -> Self {
        Md5::new()
    }

    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finalize(self) -> Self::Digest {
        self.inner.finalize().into()
    }
}

/// Streaming XXH64, the fast non-cryptographic alternative.
#[derive(Clone)]
pub struct Xxh64 {
    inner: xxhash_rust::xxh64::Xxh64,
}

impl Default for Xxh64 {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Xxh64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xxh64").finish_non_exhaustive()
    }
}

impl Xxh64 {
    /// Creates a hasher with an empty state and zero seed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: xxhash_rust::xxh64::Xxh64::new(0),
        }
    }

    /// Feeds additional bytes into the digest state.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalises the digest; the wire form is little-endian.
    #[must_use]
    pub fn finalize(self) -> [u8; 8] {
        self.inner.digest().to_le_bytes()
    }
}

impl StrongDigest for Xxh64 {
    type Digest = [u8; 8];
    const DIGEST_LEN: usize = 8;

    fn new() -> Self {
        Self::default()
    }

    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finalize(self) -> Self::Digest {
        self.inner.digest().to_le_bytes()
    }
}

/// Computes the seeded block digest of `window`.
///
/// Truncation to the negotiated length happens at the comparison site; the
/// full 16 bytes are returned here.
#[must_use]
pub fn seeded_block_digest(window: &[u8], seed: i32) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(window);
    if seed != 0 {
        hasher.update(&seed.to_le_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_hex(bytes: &[u8]) -> String {
        use std::fmt::Write as _;

        let mut out = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            write!(&mut out, "{byte:02x}").expect("write! to String cannot fail");
        }
        out
    }

    #[test]
    fn md5_streaming_matches_rfc_vectors() {
        let vectors = [
            (b"".as_slice(), "d41d8cd98f00b204e9800998ecf8427e"),
            (b"a".as_slice(), "0cc175b9c0f1b6a831c399e269772661"),
            (b"abc".as_slice(), "900150983cd24fb0d6963f7d28e17f72"),
            (
                b"message digest".as_slice(),
                "f96b697d7cb7938d525a2f31aaf161d0",
            ),
        ];

        for (input, expected) in vectors {
            assert_eq!(to_hex(&Md5::digest(input)), expected);
        }
    }

    #[test]
    fn split_update_matches_one_shot() {
        let mut split = Md5::new();
        split.update(b"mess");
        split.update(b"age digest");
        assert_eq!(split.finalize(), Md5::digest(b"message digest"));
    }

    #[test]
    fn seed_bytes_follow_the_window() {
        let window = b"some block";
        let seed: i32 = 0x1234_5678;

        let mut explicit = Md5::new();
        explicit.update(window);
        explicit.update(&seed.to_le_bytes());

        assert_eq!(seeded_block_digest(window, seed), explicit.finalize());
    }

    #[test]
    fn zero_seed_leaves_the_digest_unseeded() {
        assert_eq!(seeded_block_digest(b"data", 0), Md5::digest(b"data"));
    }

    #[test]
    fn different_seeds_produce_different_digests() {
        assert_ne!(
            seeded_block_digest(b"data", 1),
            seeded_block_digest(b"data", 2)
        );
    }

    #[test]
    fn xxh64_is_eight_bytes_little_endian() {
        let mut hasher = Xxh64::new();
        hasher.update(b"data");
        let bytes = hasher.finalize();
        assert_eq!(
            u64::from_le_bytes(bytes),
            xxhash_rust::xxh64::xxh64(b"data", 0)
        );
    }
}
