//! Segment and file-list bookkeeping.
//!
//! Indices are global and monotonic: each segment consumes one index for the
//! directory it expands plus one per member file. Both peers derive the same
//! numbering from the same sorted entries, so a bare index addresses the
//! same file on either end of the wire.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::info::FileInfo;

/// Bookkeeping violations.
///
/// These indicate that the peer referenced state we never produced; the
/// engine treats them as fatal internal errors rather than recoverable
/// protocol noise.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilelistError {
    /// A stub-directory index that is not pending expansion.
    #[error("no stub directory pending at index {0}")]
    UnknownStub(i32),

    /// An expansion request arrived while not in recursive mode.
    #[error("stub expansion requested in non-recursive mode")]
    NotRecursive,
}

/// Collects the sorted members of one segment before installation.
#[derive(Debug, Default)]
pub struct SegmentBuilder {
    directory: Option<Arc<FileInfo>>,
    files: Vec<Arc<FileInfo>>,
}

impl SegmentBuilder {
    /// Starts a builder for the children of `directory`; `None` for the
    /// implicit top segment.
    #[must_use]
    pub fn new(directory: Option<Arc<FileInfo>>) -> Self {
        Self {
            directory,
            files: Vec::new(),
        }
    }

    /// Adds one entry.
    pub fn add(&mut self, info: FileInfo) {
        self.files.push(Arc::new(info));
    }

    /// Adds an already-shared entry.
    pub fn add_shared(&mut self, info: Arc<FileInfo>) {
        self.files.push(info);
    }

    /// Number of entries collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` when no entries were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn sort_and_prune(&mut self) {
        self.files.sort_by(|a, b| a.compare(b));
        self.files.dedup_by(|next, prev| {
            let duplicate = next.name_bytes() == prev.name_bytes();
            if duplicate {
                warn!(
                    name = %String::from_utf8_lossy(next.name_bytes()),
                    "duplicate file-list entry pruned"
                );
            }
            duplicate
        });
    }
}

/// One contiguous, index-addressed group of entries.
///
/// The segment owns the half-open index range `(dir_index, end_index]`;
/// members are removed as the transfer processes them and the segment is
/// finished once empty.
#[derive(Debug)]
pub struct Segment {
    dir_index: i32,
    end_index: i32,
    directory: Option<Arc<FileInfo>>,
    members: BTreeMap<i32, Arc<FileInfo>>,
    total_file_size: u64,
}

impl Segment {
    /// Index of the directory this segment expands.
    #[inline]
    #[must_use]
    pub const fn dir_index(&self) -> i32 {
        self.dir_index
    }

    /// Last index belonging to this segment.
    #[inline]
    #[must_use]
    pub const fn end_index(&self) -> i32 {
        self.end_index
    }

    /// The expanded directory entry, absent for the top segment.
    #[must_use]
    pub fn directory(&self) -> Option<&Arc<FileInfo>> {
        self.directory.as_ref()
    }

    /// Returns `true` when `index` falls in this segment's range.
    #[must_use]
    pub const fn covers(&self, index: i32) -> bool {
        index > self.dir_index && index <= self.end_index
    }

    /// Member lookup; `None` once processed or pruned.
    #[must_use]
    pub fn get(&self, index: i32) -> Option<&Arc<FileInfo>> {
        self.members.get(&index)
    }

    /// Removes and returns a member, marking it processed.
    pub fn remove(&mut self, index: i32) -> Option<Arc<FileInfo>> {
        self.members.remove(&index)
    }

    /// Remaining members in index order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &Arc<FileInfo>)> {
        self.members.iter().map(|(&index, info)| (index, info))
    }

    /// Indices still unprocessed.
    #[must_use]
    pub fn pending(&self) -> Vec<i32> {
        self.members.keys().copied().collect()
    }

    /// Returns `true` once every member has been processed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.members.is_empty()
    }

    /// Sum of the transfer sizes of regular files and symlinks installed in
    /// this segment.
    #[inline]
    #[must_use]
    pub const fn total_file_size(&self) -> u64 {
        self.total_file_size
    }
}

/// The ordered collection of segments plus pending stub directories.
#[derive(Debug)]
pub struct Filelist {
    recursive: bool,
    segments: Vec<Segment>,
    stubs: BTreeMap<i32, Arc<FileInfo>>,
    next_index: i32,
    expanded_segments: usize,
    total_file_size: u64,
    num_files: usize,
}

impl Filelist {
    /// Creates an empty list.
    #[must_use]
    pub fn new(recursive: bool) -> Self {
        Self {
            recursive,
            segments: Vec::new(),
            stubs: BTreeMap::new(),
            next_index: 0,
            expanded_segments: 0,
            total_file_size: 0,
            num_files: 0,
        }
    }

    /// Returns `true` when operating in recursive mode.
    #[inline]
    #[must_use]
    pub const fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Installs a builder's entries as a fresh segment and returns its index
    /// within [`Filelist::segments`].
    ///
    /// Assigns `dir_index` from the running counter, numbers the sorted
    /// members `dir_index + 1 ..= end_index`, and (in recursive mode) moves
    /// every non-`.` directory into the stub map to await expansion.
    pub fn new_segment(&mut self, mut builder: SegmentBuilder) -> usize {
        builder.sort_and_prune();

        let dir_index = self.next_index;
        let mut members = BTreeMap::new();
        let mut total_file_size = 0u64;

        for (offset, info) in builder.files.into_iter().enumerate() {
            let index = dir_index + 1 + offset as i32;
            total_file_size += info.transfer_size();
            if self.recursive && info.is_directory() && !info.is_dot_dir() {
                self.stubs.insert(index, Arc::clone(&info));
            }
            members.insert(index, info);
        }

        let end_index = dir_index + members.len() as i32;
        self.next_index = end_index + 1;
        self.num_files += members.len();
        self.total_file_size += total_file_size;
        self.expanded_segments += 1;

        self.segments.push(Segment {
            dir_index,
            end_index,
            directory: builder.directory,
            members,
            total_file_size,
        });
        self.segments.len() - 1
    }

    /// Segment containing `index`, located by binary search over the
    /// segments' directory indices, then a membership check.
    #[must_use]
    pub fn segment_with(&self, index: i32) -> Option<&Segment> {
        self.segment_position(index).map(|pos| &self.segments[pos])
    }

    /// Mutable variant of [`Filelist::segment_with`].
    pub fn segment_with_mut(&mut self, index: i32) -> Option<&mut Segment> {
        self.segment_position(index)
            .map(move |pos| &mut self.segments[pos])
    }

    fn segment_position(&self, index: i32) -> Option<usize> {
        let pos = self
            .segments
            .partition_point(|segment| segment.dir_index() < index);
        let candidate = pos.checked_sub(1)?;
        let segment = &self.segments[candidate];
        segment.covers(index).then_some(candidate)
    }

    /// All segments in installation order.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Removes and returns the stub pending at `index`.
    pub fn take_stub(&mut self, index: i32) -> Result<Arc<FileInfo>, FilelistError> {
        if !self.recursive {
            return Err(FilelistError::NotRecursive);
        }
        self.stubs
            .remove(&index)
            .ok_or(FilelistError::UnknownStub(index))
    }

    /// Lowest stub index still pending, if any.
    #[must_use]
    pub fn first_stub_index(&self) -> Option<i32> {
        self.stubs.keys().next().copied()
    }

    /// Returns `true` while stub directories await expansion.
    #[must_use]
    pub fn is_expandable(&self) -> bool {
        !self.stubs.is_empty()
    }

    /// Number of segments installed so far.
    #[inline]
    #[must_use]
    pub const fn expanded_segments(&self) -> usize {
        self.expanded_segments
    }

    /// Total transfer size over all installed segments.
    #[inline]
    #[must_use]
    pub const fn total_file_size(&self) -> u64 {
        self.total_file_size
    }

    /// Total entries installed over all segments.
    #[inline]
    #[must_use]
    pub const fn num_files(&self) -> usize {
        self.num_files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::FileDetail;
    use metadata::FileAttrs;

    fn entry(name: &str, dir: bool) -> FileInfo {
        let attrs = if dir {
            FileAttrs::directory(0o755, 1)
        } else {
            FileAttrs::regular(0o644, 10, 1)
        };
        FileInfo::new(
            name.as_bytes().to_vec(),
            Some(name.to_owned()),
            attrs,
            FileDetail::Plain,
        )
        .expect("valid entry")
    }

    fn build(names: &[(&str, bool)]) -> SegmentBuilder {
        let mut builder = SegmentBuilder::new(None);
        for &(name, dir) in names {
            builder.add(entry(name, dir));
        }
        builder
    }

    #[test]
    fn segment_indices_are_assigned_in_sorted_order() {
        let mut list = Filelist::new(true);
        let seg = list.new_segment(build(&[("zeta", false), ("alpha", false), ("sub", true)]));
        let segment = &list.segments()[seg];

        assert_eq!(segment.dir_index(), 0);
        assert_eq!(segment.end_index(), 3);
        // Files sort before directories.
        assert_eq!(segment.get(1).expect("member").name(), Some("alpha"));
        assert_eq!(segment.get(2).expect("member").name(), Some("zeta"));
        assert_eq!(segment.get(3).expect("member").name(), Some("sub"));
    }

    #[test]
    fn indices_stay_monotonic_across_segments() {
        let mut list = Filelist::new(true);
        list.new_segment(build(&[("a", false), ("d", true)]));
        let second = list.new_segment(build(&[("x", false)]));

        let segment = &list.segments()[second];
        assert_eq!(segment.dir_index(), 3);
        assert_eq!(segment.end_index(), 4);
        assert_eq!(list.num_files(), 3);
    }

    #[test]
    fn directories_become_stubs_in_recursive_mode() {
        let mut list = Filelist::new(true);
        list.new_segment(build(&[("file", false), ("dir", true)]));

        assert!(list.is_expandable());
        assert_eq!(list.first_stub_index(), Some(2));
        let stub = list.take_stub(2).expect("stub pending");
        assert_eq!(stub.name(), Some("dir"));
        assert!(!list.is_expandable());
    }

    #[test]
    fn non_recursive_lists_never_grow_stubs() {
        let mut list = Filelist::new(false);
        list.new_segment(build(&[("dir", true)]));
        assert!(!list.is_expandable());
        assert_eq!(list.take_stub(1).unwrap_err(), FilelistError::NotRecursive);
    }

    #[test]
    fn unknown_stub_lookups_fail() {
        let mut list = Filelist::new(true);
        list.new_segment(build(&[("dir", true)]));
        assert_eq!(list.take_stub(99).unwrap_err(), FilelistError::UnknownStub(99));
    }

    #[test]
    fn segment_lookup_uses_binary_search_and_membership() {
        let mut list = Filelist::new(true);
        list.new_segment(build(&[("a", false), ("b", false)]));
        list.new_segment(build(&[("c", false)]));

        assert_eq!(list.segment_with(1).expect("covered").dir_index(), 0);
        assert_eq!(list.segment_with(2).expect("covered").dir_index(), 0);
        assert_eq!(list.segment_with(4).expect("covered").dir_index(), 3);
        assert!(list.segment_with(0).is_none(), "dir slot is not a member");
        assert!(list.segment_with(3).is_none());
        assert!(list.segment_with(99).is_none());
        assert!(list.segment_with(-1).is_none());
    }

    #[test]
    fn duplicates_are_pruned() {
        let mut list = Filelist::new(false);
        let seg = list.new_segment(build(&[("same", false), ("same", false)]));
        assert_eq!(list.segments()[seg].pending().len(), 1);
    }

    #[test]
    fn segment_finishes_when_members_are_removed() {
        let mut list = Filelist::new(false);
        list.new_segment(build(&[("only", false)]));
        let segment = list.segment_with_mut(1).expect("covered");
        assert!(!segment.is_finished());
        assert!(segment.remove(1).is_some());
        assert!(segment.is_finished());
        assert!(segment.remove(1).is_none());
    }

    #[test]
    fn total_size_counts_files_only() {
        let mut list = Filelist::new(false);
        list.new_segment(build(&[("f1", false), ("f2", false), ("d", true)]));
        assert_eq!(list.total_file_size(), 20);
    }
}
