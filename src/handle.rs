// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A shared, live view onto one block's metadata.

use std::sync::{Arc, Mutex};

use crate::block_info::BlockInfo;
use crate::task::TaskAttemptId;

const POISONED: &str = "a BlockInfo mutex is only ever locked for the duration of one field access \
    or mutation and never while holding another lock, so it cannot be poisoned by a panicking holder \
    without that panic also aborting the process via an assertion failure elsewhere";

/// A handle to a block's metadata, returned by [`crate::BlockInfoManager`]
/// lock calls and by `get`.
///
/// Handles are shared: several holders of a read lock on the same block see
/// the same underlying `BlockInfo`, and it keeps mutating (its `size`, for
/// instance) after the handle was obtained. Per spec.md §5, callers must
/// treat the handle as a read-only, live view and never attempt to mutate
/// it directly — only the manager that produced it does that, under its own
/// guard.
#[derive(Clone)]
pub struct BlockInfoHandle<S> {
    inner: Arc<Mutex<BlockInfo<S>>>,
}

impl<S> BlockInfoHandle<S> {
    pub(crate) fn new(inner: Arc<Mutex<BlockInfo<S>>>) -> BlockInfoHandle<S> {
        BlockInfoHandle { inner }
    }

    pub(crate) fn raw(&self) -> &Arc<Mutex<BlockInfo<S>>> {
        &self.inner
    }

    /// Current number of outstanding read locks on this block.
    pub fn reader_count(&self) -> usize {
        self.inner.lock().expect(POISONED).reader_count()
    }

    /// The task currently holding the write lock, or `NO_WRITER`.
    pub fn writer_task(&self) -> TaskAttemptId {
        self.inner.lock().expect(POISONED).writer_task()
    }

    /// Size in bytes, as last reported by the writer.
    pub fn size(&self) -> u64 {
        self.inner.lock().expect(POISONED).size()
    }

    /// Whether the owning `BlockManager` should tell the master about this
    /// block.
    pub fn tell_master(&self) -> bool {
        self.inner.lock().expect(POISONED).tell_master()
    }

    /// The type tag recorded for this block.
    pub fn class_tag(&self) -> String {
        self.inner.lock().expect(POISONED).class_tag().to_owned()
    }

    /// Record the size of the materialized block.
    ///
    /// This is the one field a holder of this handle is expected to mutate
    /// directly: it is orthogonal to the lock/reader/writer bookkeeping the
    /// manager enforces, and matches how a producing task reports the size
    /// of a block it just wrote while still holding the write lock.
    pub fn set_size(&self, size: u64) {
        self.inner.lock().expect(POISONED).set_size(size);
    }
}

impl<S> BlockInfoHandle<S>
where
    S: Clone,
{
    /// The storage level requested for this block.
    pub fn storage_level(&self) -> S {
        self.inner.lock().expect(POISONED).storage_level().clone()
    }
}

impl<S> std::fmt::Debug for BlockInfoHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.inner.lock().expect(POISONED);
        f.debug_struct("BlockInfoHandle")
            .field("reader_count", &info.reader_count())
            .field("writer_task", &info.writer_task())
            .field("size", &info.size())
            .finish()
    }
}
