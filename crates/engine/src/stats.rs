//! Session statistics record.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Counters reported to the caller when a session ends.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    /// Entries installed into the file list.
    pub num_files: u64,
    /// Files whose content was reconstructed and installed.
    pub num_transferred_files: u64,
    /// Sum of regular-file and symlink sizes in the file list.
    pub total_file_size: u64,
    /// Bytes that crossed the wire as literal data.
    pub total_literal_size: u64,
    /// Bytes reproduced from replica blocks instead of the wire.
    pub total_matched_size: u64,
    /// Wire bytes spent on file-list segments.
    pub total_file_list_size: u64,
    /// Segments installed, including the initial one.
    pub expanded_segments: u64,
    /// Or-combined I/O error word; nonzero means partial transfer.
    pub io_errors: i32,
}

impl Statistics {
    /// Returns `true` when the session completed without error bits.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.io_errors == 0
    }

    /// Process exit status mirroring the error word.
    #[must_use]
    pub const fn exit_status(&self) -> i32 {
        self.io_errors
    }
}

/// Statistics shared between the two receive-side workers.
#[derive(Clone, Debug, Default)]
pub struct SharedStatistics(Arc<Mutex<Statistics>>);

impl SharedStatistics {
    /// Creates zeroed shared counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `apply` against the counters.
    pub fn update(&self, apply: impl FnOnce(&mut Statistics)) {
        apply(&mut self.lock());
    }

    /// Snapshot of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> Statistics {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Statistics> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_tracks_the_error_word() {
        let mut stats = Statistics::default();
        assert!(stats.is_success());
        assert_eq!(stats.exit_status(), 0);
        stats.io_errors = 5;
        assert!(!stats.is_success());
        assert_eq!(stats.exit_status(), 5);
    }

    #[test]
    fn shared_counters_are_visible_across_clones() {
        let shared = SharedStatistics::new();
        let clone = shared.clone();
        clone.update(|s| s.num_files += 3);
        assert_eq!(shared.snapshot().num_files, 3);
    }
}
