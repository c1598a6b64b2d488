//! Rolling checksum for weak block matching.
//!
//! Maintains the two 16-bit component sums of rsync's `rsum`: `s1` is the
//! plain byte sum, `s2` the sum of prefix sums. Both update in O(1) when the
//! window slides one byte, which is what makes scanning every offset of a
//! file affordable.
//!
//! # Upstream Reference
//!
//! - `checksum.c` - `get_checksum1()` - block computation
//! - `match.c` - `hash_search()` - sliding-window usage

/// Weak rolling checksum over a byte window.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    len: usize,
}

impl RollingChecksum {
    /// Creates a checksum with zeroed state.
    #[must_use]
    pub const fn new() -> Self {
        Self { s1: 0, s2: 0, len: 0 }
    }

    /// Computes the checksum of `block` in one call.
    #[must_use]
    pub fn of(block: &[u8]) -> Self {
        let mut sum = Self::new();
        sum.update(block);
        sum
    }

    /// Resets to the initial state.
    pub const fn reset(&mut self) {
        self.s1 = 0;
        self.s2 = 0;
        self.len = 0;
    }

    /// Number of bytes in the current window.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when no bytes have been observed.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Feeds additional bytes into the window.
    #[inline]
    pub fn update(&mut self, chunk: &[u8]) {
        let mut s1 = self.s1;
        let mut s2 = self.s2;

        let mut iter = chunk.chunks_exact(4);
        for block in &mut iter {
            s1 = s1.wrapping_add(u32::from(block[0]));
            s2 = s2.wrapping_add(s1);
            s1 = s1.wrapping_add(u32::from(block[1]));
            s2 = s2.wrapping_add(s1);
            s1 = s1.wrapping_add(u32::from(block[2]));
            s2 = s2.wrapping_add(s1);
            s1 = s1.wrapping_add(u32::from(block[3]));
            s2 = s2.wrapping_add(s1);
        }
        for &byte in iter.remainder() {
            s1 = s1.wrapping_add(u32::from(byte));
            s2 = s2.wrapping_add(s1);
        }

        self.s1 = s1 & 0xffff;
        self.s2 = s2 & 0xffff;
        self.len += chunk.len();
    }

    /// Clears the state and recomputes over `block`.
    pub fn update_from_block(&mut self, block: &[u8]) {
        self.reset();
        self.update(block);
    }

    /// Slides the window one byte: `outgoing` leaves the front, `incoming`
    /// enters the back. The window length is unchanged.
    ///
    /// Calling this on an empty window is a matcher bug; the debug assertion
    /// catches it in tests and the release behavior is a harmless no-op sum.
    #[inline]
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        debug_assert!(self.len > 0, "rolled an empty window");
        let window_len = self.len as u32;
        let out = u32::from(outgoing);
        let inn = u32::from(incoming);

        let s1 = self.s1.wrapping_sub(out).wrapping_add(inn) & 0xffff;
        let s2 = self
            .s2
            .wrapping_sub(window_len.wrapping_mul(out))
            .wrapping_add(s1)
            & 0xffff;
        self.s1 = s1;
        self.s2 = s2;
    }

    /// Removes the front byte without admitting a new one, shrinking the
    /// window by one. Used while draining the tail of a file, where the
    /// window can no longer stay full.
    #[inline]
    pub fn shrink(&mut self, outgoing: u8) {
        debug_assert!(self.len > 0, "shrank an empty window");
        let window_len = self.len as u32;
        let out = u32::from(outgoing);
        self.s1 = self.s1.wrapping_sub(out) & 0xffff;
        self.s2 = self.s2.wrapping_sub(window_len.wrapping_mul(out)) & 0xffff;
        self.len -= 1;
    }

    /// Packed 32-bit representation `(s2 << 16) | s1`, the wire and table
    /// format.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> u32 {
        (self.s2 << 16) | self.s1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn incremental_update_matches_one_shot() {
        let mut split = RollingChecksum::new();
        split.update(b"Hello, ");
        split.update(b"wiresync!");
        assert_eq!(split.value(), RollingChecksum::of(b"Hello, wiresync!").value());
    }

    #[test]
    fn roll_matches_fresh_computation() {
        let data = b"ABCDEFGH";
        let mut rolling = RollingChecksum::of(&data[0..4]);
        for start in 1..=4 {
            rolling.roll(data[start - 1], data[start + 3]);
            assert_eq!(
                rolling.value(),
                RollingChecksum::of(&data[start..start + 4]).value(),
                "window at offset {start}"
            );
        }
    }

    #[test]
    fn shrink_matches_fresh_computation_of_the_tail() {
        let data = b"trailing window";
        let mut rolling = RollingChecksum::of(data);
        for start in 1..data.len() {
            rolling.shrink(data[start - 1]);
            assert_eq!(
                rolling.value(),
                RollingChecksum::of(&data[start..]).value(),
                "tail at offset {start}"
            );
            assert_eq!(rolling.len(), data.len() - start);
        }
    }

    #[test]
    fn empty_window_has_zero_value() {
        assert_eq!(RollingChecksum::new().value(), 0);
        assert!(RollingChecksum::new().is_empty());
    }

    #[test]
    fn value_packs_components_into_upper_and_lower_halves() {
        let sum = RollingChecksum::of(&[1, 2, 3]);
        // s1 = 6, s2 = 1 + 3 + 6 = 10
        assert_eq!(sum.value() & 0xffff, 6);
        assert_eq!(sum.value() >> 16, 10);
    }

    proptest! {
        #[test]
        fn rolling_across_a_buffer_matches_block_recomputation(
            data in proptest::collection::vec(any::<u8>(), 32..256),
            window in 4usize..16,
        ) {
            let mut rolling = RollingChecksum::of(&data[..window]);
            for start in 1..data.len() - window {
                rolling.roll(data[start - 1], data[start + window - 1]);
                prop_assert_eq!(
                    rolling.value(),
                    RollingChecksum::of(&data[start..start + window]).value()
                );
            }
        }
    }
}
