// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-block mutable metadata.

use crate::task::TaskAttemptId;

/// Mutable metadata for one block.
///
/// `BlockInfo` is value-like: direct field access is not thread-safe on its
/// own. Every mutation here is only ever invoked by
/// [`crate::BlockInfoManager`] while its single guard is held, and every
/// mutation that touches `reader_count` or `writer_task` re-asserts
/// invariants (1)-(3) from spec.md §3 before returning.
#[derive(Clone, Debug)]
pub struct BlockInfo<S> {
    storage_level: S,
    class_tag: String,
    tell_master: bool,
    size: u64,
    reader_count: usize,
    writer_task: TaskAttemptId,
}

impl<S> BlockInfo<S> {
    /// Create metadata for a block that has not yet been locked by anyone.
    pub fn new(storage_level: S, class_tag: impl Into<String>, tell_master: bool) -> BlockInfo<S> {
        BlockInfo {
            storage_level,
            class_tag: class_tag.into(),
            tell_master,
            size: 0,
            reader_count: 0,
            writer_task: TaskAttemptId::NO_WRITER,
        }
    }

    /// The storage level requested for this block, opaque to this crate.
    pub fn storage_level(&self) -> &S {
        &self.storage_level
    }

    /// The type tag recorded for this block, opaque to this crate.
    pub fn class_tag(&self) -> &str {
        &self.class_tag
    }

    /// Whether the owning `BlockManager` should tell the master about this
    /// block. Carried, never interpreted here.
    pub fn tell_master(&self) -> bool {
        self.tell_master
    }

    /// Size in bytes, as last reported by `set_size`.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current number of outstanding read locks on this block.
    pub fn reader_count(&self) -> usize {
        self.reader_count
    }

    /// The task currently holding the write lock, or
    /// [`TaskAttemptId::NO_WRITER`] if none does.
    pub fn writer_task(&self) -> TaskAttemptId {
        self.writer_task
    }

    /// Record the size of the materialized block. Size bookkeeping is
    /// orthogonal to the locking protocol; callers typically set this once,
    /// right after producing the block, while still holding the write lock.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    fn assert_invariants(&self) {
        // reader_count >= 0 is guaranteed by its usize type; invariants (2)
        // and (3) from spec.md §3 are the ones worth asserting here.
        assert!(
            self.reader_count == 0 || self.writer_task == TaskAttemptId::NO_WRITER,
            "block has {} readers while task {} holds the write lock",
            self.reader_count,
            self.writer_task
        );
        assert!(
            self.writer_task == TaskAttemptId::NO_WRITER || self.reader_count == 0,
            "block is write-locked by task {} but reports {} readers",
            self.writer_task,
            self.reader_count
        );
    }

    pub(crate) fn add_reader(&mut self) {
        self.reader_count = self
            .reader_count
            .checked_add(1)
            .expect("reader count overflowed");
        self.assert_invariants();
    }

    pub(crate) fn remove_reader(&mut self) {
        self.reader_count = self
            .reader_count
            .checked_sub(1)
            .expect("unlock on a block with no outstanding readers");
        self.assert_invariants();
    }

    pub(crate) fn remove_readers(&mut self, count: u64) {
        let count = usize::try_from(count).expect("reader multiplicity does not fit in usize");
        self.reader_count = self
            .reader_count
            .checked_sub(count)
            .expect("released more read locks than the block had outstanding");
        self.assert_invariants();
    }

    pub(crate) fn set_writer(&mut self, task: TaskAttemptId) {
        assert_eq!(
            self.writer_task,
            TaskAttemptId::NO_WRITER,
            "block already has writer {}",
            self.writer_task
        );
        assert_eq!(
            self.reader_count, 0,
            "cannot install a writer while {} readers are outstanding",
            self.reader_count
        );
        self.writer_task = task;
        self.assert_invariants();
    }

    pub(crate) fn clear_writer(&mut self) {
        self.writer_task = TaskAttemptId::NO_WRITER;
        self.assert_invariants();
    }

    pub(crate) fn reset(&mut self) {
        self.reader_count = 0;
        self.writer_task = TaskAttemptId::NO_WRITER;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_block_has_no_readers_or_writer() {
        let info = BlockInfo::new("memory", "MyClass", true);
        assert_eq!(info.reader_count(), 0);
        assert_eq!(info.writer_task(), TaskAttemptId::NO_WRITER);
        assert_eq!(info.class_tag(), "MyClass");
        assert!(info.tell_master());
    }

    #[test]
    fn add_and_remove_reader_round_trips() {
        let mut info = BlockInfo::new((), "T", false);
        info.add_reader();
        info.add_reader();
        assert_eq!(info.reader_count(), 2);
        info.remove_reader();
        assert_eq!(info.reader_count(), 1);
    }

    #[test]
    #[should_panic(expected = "no outstanding readers")]
    fn remove_reader_below_zero_panics() {
        let mut info = BlockInfo::new((), "T", false);
        info.remove_reader();
    }

    #[test]
    #[should_panic(expected = "already has writer")]
    fn set_writer_twice_panics() {
        let mut info = BlockInfo::new((), "T", false);
        info.set_writer(TaskAttemptId::new(1));
        info.set_writer(TaskAttemptId::new(2));
    }

    #[test]
    #[should_panic(expected = "readers are outstanding")]
    fn set_writer_with_readers_panics() {
        let mut info = BlockInfo::new((), "T", false);
        info.add_reader();
        info.set_writer(TaskAttemptId::new(1));
    }
}
