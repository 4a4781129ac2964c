// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The block-id -> BlockInfo table, the readers/writer locking protocol,
//! and task-scoped bulk release.
//!
//! This is the single serialization point described in spec.md §2: one
//! `Mutex` guards the block table and both task-holdings tables, and one
//! `Condvar` wakes every waiter whenever a state change could let one of
//! them make progress (spec.md §5 — broadcast wakeups only, no attempt to
//! target a specific waiter, the same choice `engine/structures/lock.rs`'s
//! `LockRecord::wake` makes for the teacher's own all-or-some lock).

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::{debug, trace, warn};

use crate::block_info::BlockInfo;
use crate::error::{Error, ErrorKind, Result};
use crate::handle::BlockInfoHandle;
use crate::task::{current_task_attempt_id, TaskAttemptId};

/// Bound satisfied by anything usable as a block identifier.
///
/// The manager never interprets a `BlockId` beyond equality and hashing
/// (spec.md §1), so this is a blanket impl rather than a trait callers must
/// implement by hand.
pub trait BlockId: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static {}

impl<T> BlockId for T where T: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static {}

const POISONED: &str = "the manager mutex is never held across a panic-prone operation, \
    only plain map/counter bookkeeping, so it cannot become poisoned";

struct ManagerState<B, S> {
    infos: HashMap<B, Arc<Mutex<BlockInfo<S>>>>,
    read_holdings: HashMap<TaskAttemptId, HashMap<B, u64>>,
    write_holdings: HashMap<TaskAttemptId, HashSet<B>>,
}

impl<B: BlockId, S> ManagerState<B, S> {
    fn fresh() -> ManagerState<B, S> {
        let mut read_holdings = HashMap::new();
        read_holdings.insert(TaskAttemptId::NON_TASK_WRITER, HashMap::new());
        ManagerState {
            infos: HashMap::new(),
            read_holdings,
            write_holdings: HashMap::new(),
        }
    }
}

/// Block metadata table plus readers/writer lock protocol for a single
/// storage layer instance.
///
/// `B` is the block id type; `S` is the (opaque) storage level type. See
/// spec.md §3 for the full data model and §4.3 for the protocol each method
/// below implements.
pub struct BlockInfoManager<B: BlockId, S> {
    state: Mutex<ManagerState<B, S>>,
    condvar: Condvar,
}

impl<B: BlockId, S> BlockInfoManager<B, S> {
    /// Create a manager with `NON_TASK_WRITER` registered and nothing else.
    pub fn new() -> BlockInfoManager<B, S> {
        BlockInfoManager {
            state: Mutex::new(ManagerState::fresh()),
            condvar: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState<B, S>> {
        self.state.lock().expect(POISONED)
    }

    /// Register a task attempt before it performs any lock operation.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AlreadyRegistered`] if `task` is already
    /// registered.
    pub fn register_task(&self, task: TaskAttemptId) -> Result<()> {
        let mut state = self.lock_state();
        if state.read_holdings.contains_key(&task) {
            return Err(ErrorKind::AlreadyRegistered(task).into());
        }
        state.read_holdings.insert(task, HashMap::new());
        trace!("registered task {task}");
        Ok(())
    }

    /// Acquire a read lock on `block_id`, waiting for the current writer to
    /// release it if `blocking` is true.
    ///
    /// Returns `None` immediately if the block does not exist, regardless
    /// of `blocking` — spec.md §4.3 only blocks on a writer being present,
    /// never on a missing entry.
    pub fn lock_for_reading(&self, block_id: &B, blocking: bool) -> Option<BlockInfoHandle<S>> {
        let task = current_task_attempt_id();
        let state = self.lock_state();
        let (_, handle) = self.lock_for_reading_locked(state, block_id, blocking, task);
        handle
    }

    fn lock_for_reading_locked<'a>(
        &'a self,
        mut state: MutexGuard<'a, ManagerState<B, S>>,
        block_id: &B,
        blocking: bool,
        task: TaskAttemptId,
    ) -> (
        MutexGuard<'a, ManagerState<B, S>>,
        Option<BlockInfoHandle<S>>,
    ) {
        loop {
            let Some(arc) = state.infos.get(block_id).cloned() else {
                trace!("lock_for_reading: {block_id:?} absent");
                return (state, None);
            };
            let is_free = arc.lock().expect(POISONED).writer_task() == TaskAttemptId::NO_WRITER;
            if is_free {
                arc.lock().expect(POISONED).add_reader();
                state
                    .read_holdings
                    .get_mut(&task)
                    .unwrap_or_else(|| panic!("task {task} must be registered before locking blocks"))
                    .entry(block_id.clone())
                    .and_modify(|count| *count += 1)
                    .or_insert(1);
                trace!("task {task} acquired read lock on {block_id:?}");
                return (state, Some(BlockInfoHandle::new(arc)));
            }
            if !blocking {
                trace!("lock_for_reading: {block_id:?} is write-locked, non-blocking caller backs off");
                return (state, None);
            }
            debug!("task {task} waiting to read {block_id:?}");
            state = self.condvar.wait(state).expect(POISONED);
        }
    }

    /// Acquire the write lock on `block_id`, waiting if `blocking` is true
    /// and it is currently read- or write-locked.
    ///
    /// Write acquisition is not re-entrant: a task that already holds the
    /// write lock on `block_id` must not call this again for the same
    /// block (spec.md §4.3); doing so deadlocks against itself exactly as
    /// any non-reentrant mutex would.
    pub fn lock_for_writing(&self, block_id: &B, blocking: bool) -> Option<BlockInfoHandle<S>> {
        let task = current_task_attempt_id();
        let state = self.lock_state();
        let (_, handle) = self.lock_for_writing_locked(state, block_id, blocking, task);
        handle
    }

    fn lock_for_writing_locked<'a>(
        &'a self,
        mut state: MutexGuard<'a, ManagerState<B, S>>,
        block_id: &B,
        blocking: bool,
        task: TaskAttemptId,
    ) -> (
        MutexGuard<'a, ManagerState<B, S>>,
        Option<BlockInfoHandle<S>>,
    ) {
        loop {
            let Some(arc) = state.infos.get(block_id).cloned() else {
                trace!("lock_for_writing: {block_id:?} absent");
                return (state, None);
            };
            let available = {
                let info = arc.lock().expect(POISONED);
                info.writer_task() == TaskAttemptId::NO_WRITER && info.reader_count() == 0
            };
            if available {
                arc.lock().expect(POISONED).set_writer(task);
                state
                    .write_holdings
                    .entry(task)
                    .or_default()
                    .insert(block_id.clone());
                trace!("task {task} acquired write lock on {block_id:?}");
                return (state, Some(BlockInfoHandle::new(arc)));
            }
            if !blocking {
                trace!("lock_for_writing: {block_id:?} unavailable, non-blocking caller backs off");
                return (state, None);
            }
            debug!("task {task} waiting to write {block_id:?}");
            state = self.condvar.wait(state).expect(POISONED);
        }
    }

    /// First-writer-wins creation: the first caller to reach this for a
    /// given `block_id` installs `new_info` and returns `true` holding the
    /// write lock; every later racer returns `false` holding a read lock on
    /// the winner's block instead (spec.md §4.3).
    pub fn lock_new_block_for_writing(&self, block_id: B, new_info: BlockInfo<S>) -> bool {
        let task = current_task_attempt_id();
        let state = self.lock_state();
        let (state, existing) = self.lock_for_reading_locked(state, &block_id, true, task);
        if existing.is_some() {
            trace!("task {task} lost the race to create {block_id:?}; now holds a read lock on it");
            return false;
        }
        let mut state = state;
        state
            .infos
            .insert(block_id.clone(), Arc::new(Mutex::new(new_info)));
        let (_, handle) = self.lock_for_writing_locked(state, &block_id, true, task);
        debug_assert!(
            handle.is_some(),
            "a block just inserted under the manager's own guard must be immediately writable"
        );
        debug!("task {task} won the race to create {block_id:?}");
        true
    }

    fn unlock_locked(
        &self,
        state: &mut MutexGuard<'_, ManagerState<B, S>>,
        block_id: &B,
        task: TaskAttemptId,
    ) -> Result<()> {
        let arc = state
            .infos
            .get(block_id)
            .cloned()
            .ok_or_else(|| Error::from(ErrorKind::NotFound(format!("{block_id:?}"))))?;
        let was_writer = {
            let mut info = arc.lock().expect(POISONED);
            let was_writer = info.writer_task() != TaskAttemptId::NO_WRITER;
            if was_writer {
                info.clear_writer();
            } else {
                info.remove_reader();
            }
            was_writer
        };
        if was_writer {
            if let Some(set) = state.write_holdings.get_mut(&task) {
                set.remove(block_id);
            }
        } else if let Some(counts) = state.read_holdings.get_mut(&task) {
            match counts.get_mut(block_id) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    counts.remove(block_id);
                }
                None => {}
            }
        }
        trace!("task {task} released its lock on {block_id:?}");
        self.condvar.notify_all();
        Ok(())
    }

    /// Release whichever lock the calling task holds on `block_id` — the
    /// write lock if it holds one, otherwise one read-lock multiplicity.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] if `block_id` has no entry.
    pub fn unlock(&self, block_id: &B) -> Result<()> {
        let task = current_task_attempt_id();
        let mut state = self.lock_state();
        self.unlock_locked(&mut state, block_id, task)
    }

    /// Atomically transition from holding the write lock on `block_id` to
    /// holding exactly one read reference on it.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] or [`ErrorKind::NotOwned`] under the
    /// same conditions as [`BlockInfoManager::assert_block_is_locked_for_writing`].
    pub fn downgrade_lock(&self, block_id: &B) -> Result<()> {
        let task = current_task_attempt_id();
        let mut state = self.lock_state();
        self.assert_block_is_locked_for_writing_locked(&state, block_id, task)?;
        self.unlock_locked(&mut state, block_id, task)?;
        let (_, handle) = self.lock_for_reading_locked(state, block_id, false, task);
        debug_assert!(
            handle.is_some(),
            "no other task can slip in between unlock and re-lock inside the manager's guard"
        );
        trace!("task {task} downgraded its write lock on {block_id:?} to a read lock");
        Ok(())
    }

    fn assert_block_is_locked_for_writing_locked(
        &self,
        state: &MutexGuard<'_, ManagerState<B, S>>,
        block_id: &B,
        task: TaskAttemptId,
    ) -> Result<BlockInfoHandle<S>> {
        let arc = state
            .infos
            .get(block_id)
            .cloned()
            .ok_or_else(|| Error::from(ErrorKind::NotFound(format!("{block_id:?}"))))?;
        let writer = arc.lock().expect(POISONED).writer_task();
        if writer != task {
            return Err(ErrorKind::NotOwned {
                block: format!("{block_id:?}"),
                holder: writer,
                caller: task,
            }
            .into());
        }
        Ok(BlockInfoHandle::new(arc))
    }

    /// Fail unless the calling task currently holds the write lock on
    /// `block_id`, otherwise return a handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] if the block does not exist, or
    /// [`ErrorKind::NotOwned`] if some other task (or no task) holds the
    /// write lock.
    pub fn assert_block_is_locked_for_writing(&self, block_id: &B) -> Result<BlockInfoHandle<S>> {
        let task = current_task_attempt_id();
        let state = self.lock_state();
        self.assert_block_is_locked_for_writing_locked(&state, block_id, task)
    }

    /// Look up `block_id` without acquiring a lock on it. Intended for
    /// read-only status queries only; the returned handle must not be
    /// mutated by the caller (spec.md §4.3).
    pub fn get(&self, block_id: &B) -> Option<BlockInfoHandle<S>> {
        self.lock_state()
            .infos
            .get(block_id)
            .cloned()
            .map(BlockInfoHandle::new)
    }

    /// Unwind every lock `task` holds, unregistering it in the process.
    ///
    /// Returns every block whose pin count changed, once each, for the
    /// caller to consider for eviction. Idempotent: calling this again for
    /// a task with nothing left registered simply returns an empty list.
    pub fn release_all_locks_for_task(&self, task: TaskAttemptId) -> Vec<B> {
        let mut state = self.lock_state();
        let mut released = Vec::new();

        if let Some(write_set) = state.write_holdings.remove(&task) {
            for block_id in write_set {
                if let Some(arc) = state.infos.get(&block_id) {
                    let mut info = arc.lock().expect(POISONED);
                    if info.writer_task() == task {
                        info.clear_writer();
                    }
                }
                released.push(block_id);
            }
        }

        if let Some(read_counts) = state.read_holdings.remove(&task) {
            for (block_id, count) in read_counts {
                if let Some(arc) = state.infos.get(&block_id) {
                    arc.lock().expect(POISONED).remove_readers(count);
                }
                released.push(block_id);
            }
        }

        debug!(
            "released {} block(s) held by task {task}, which is now unregistered",
            released.len()
        );
        self.condvar.notify_all();
        released
    }

    /// Remove `block_id` from the table entirely.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] or [`ErrorKind::NotOwned`] under the
    /// same conditions as [`BlockInfoManager::assert_block_is_locked_for_writing`].
    pub fn remove_block(&self, block_id: &B) -> Result<()> {
        let task = current_task_attempt_id();
        let mut state = self.lock_state();
        self.assert_block_is_locked_for_writing_locked(&state, block_id, task)?;
        if let Some(arc) = state.infos.remove(block_id) {
            arc.lock().expect(POISONED).reset();
        }
        if let Some(set) = state.write_holdings.get_mut(&task) {
            set.remove(block_id);
        }
        trace!("task {task} removed block {block_id:?}");
        self.condvar.notify_all();
        Ok(())
    }

    /// Reset every block's counts, drop every task registration, and wake
    /// all waiters. Intended for shutdown only.
    ///
    /// After `clear`, `NON_TASK_WRITER` is no longer registered (see
    /// SPEC_FULL.md §9's resolution of spec.md's open question): construct
    /// a fresh `BlockInfoManager` rather than reusing this one.
    pub fn clear(&self) {
        let mut state = self.lock_state();
        for arc in state.infos.values() {
            arc.lock().expect(POISONED).reset();
        }
        state.infos.clear();
        state.read_holdings.clear();
        state.write_holdings.clear();
        warn!("block info manager cleared; no tasks remain registered");
        self.condvar.notify_all();
    }

    /// Number of blocks currently tracked.
    pub fn size(&self) -> usize {
        self.lock_state().infos.len()
    }

    /// Snapshot of every tracked block and its (live) handle.
    pub fn entries(&self) -> Vec<(B, BlockInfoHandle<S>)> {
        self.lock_state()
            .infos
            .iter()
            .map(|(id, arc)| (id.clone(), BlockInfoHandle::new(Arc::clone(arc))))
            .collect()
    }

    /// Total entries across the block table and every task's read/write
    /// holdings, for diagnostic memory accounting.
    pub fn get_number_of_map_entries(&self) -> usize {
        let state = self.lock_state();
        let read_entries: usize = state.read_holdings.values().map(HashMap::len).sum();
        let write_entries: usize = state.write_holdings.values().map(HashSet::len).sum();
        state.infos.len()
            + state.read_holdings.len()
            + read_entries
            + state.write_holdings.len()
            + write_entries
    }
}

impl<B: BlockId, S> Default for BlockInfoManager<B, S> {
    fn default() -> BlockInfoManager<B, S> {
        BlockInfoManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskAttemptIdScope;
    use assert_matches::assert_matches;

    fn task(id: i64) -> TaskAttemptId {
        TaskAttemptId::new(id)
    }

    #[test]
    fn fresh_write_then_read() {
        let mgr: BlockInfoManager<&str, &str> = BlockInfoManager::new();
        mgr.register_task(task(1)).unwrap();
        mgr.register_task(task(2)).unwrap();

        let _t1 = TaskAttemptIdScope::enter(task(1));
        assert!(mgr.lock_new_block_for_writing("b", BlockInfo::new("memory", "T", false)));
        drop(_t1);

        {
            let _t2 = TaskAttemptIdScope::enter(task(2));
            assert!(mgr.lock_for_reading(&"b", false).is_none());
        }

        let _t1 = TaskAttemptIdScope::enter(task(1));
        mgr.unlock(&"b").unwrap();
        drop(_t1);

        let _t2 = TaskAttemptIdScope::enter(task(2));
        let handle = mgr.lock_for_reading(&"b", false).expect("writer released");
        assert_eq!(handle.reader_count(), 1);
    }

    #[test]
    fn reentrant_read_then_release_all() {
        let mgr: BlockInfoManager<&str, ()> = BlockInfoManager::new();
        mgr.register_task(task(1)).unwrap();
        let _t1 = TaskAttemptIdScope::enter(task(1));
        assert!(mgr.lock_new_block_for_writing("b", BlockInfo::new((), "T", false)));
        mgr.unlock(&"b").unwrap();

        mgr.lock_for_reading(&"b", false).unwrap();
        let handle = mgr.lock_for_reading(&"b", false).unwrap();
        assert_eq!(handle.reader_count(), 2);

        mgr.unlock(&"b").unwrap();
        assert_eq!(mgr.get(&"b").unwrap().reader_count(), 1);

        let released = mgr.release_all_locks_for_task(task(1));
        assert_eq!(released, vec!["b"]);
        assert_eq!(mgr.get(&"b").unwrap().reader_count(), 0);
    }

    #[test]
    fn downgrade_publishes_for_readers_and_blocks_writers() {
        let mgr: BlockInfoManager<&str, ()> = BlockInfoManager::new();
        for id in [1, 2, 3] {
            mgr.register_task(task(id)).unwrap();
        }

        let _t1 = TaskAttemptIdScope::enter(task(1));
        assert!(mgr.lock_new_block_for_writing("b", BlockInfo::new((), "T", false)));
        mgr.downgrade_lock(&"b").unwrap();
        drop(_t1);

        let _t2 = TaskAttemptIdScope::enter(task(2));
        assert!(mgr.lock_for_reading(&"b", false).is_some());
        drop(_t2);

        let _t3 = TaskAttemptIdScope::enter(task(3));
        assert!(mgr.lock_for_writing(&"b", false).is_none());
    }

    #[test]
    fn remove_requires_write_lock() {
        let mgr: BlockInfoManager<&str, ()> = BlockInfoManager::new();
        mgr.register_task(task(1)).unwrap();
        let _t1 = TaskAttemptIdScope::enter(task(1));
        assert!(mgr.lock_new_block_for_writing("b", BlockInfo::new((), "T", false)));
        mgr.downgrade_lock(&"b").unwrap();

        assert_matches!(
            mgr.remove_block(&"b").unwrap_err().kind(),
            ErrorKind::NotOwned { .. }
        );

        mgr.unlock(&"b").unwrap();
        mgr.lock_for_writing(&"b", true);
        mgr.remove_block(&"b").unwrap();
        assert!(mgr.get(&"b").is_none());
    }

    #[test]
    fn register_task_twice_errors() {
        let mgr: BlockInfoManager<&str, ()> = BlockInfoManager::new();
        mgr.register_task(task(1)).unwrap();
        assert_matches!(
            mgr.register_task(task(1)).unwrap_err().kind(),
            ErrorKind::AlreadyRegistered(_)
        );
    }

    #[test]
    fn unlock_unknown_block_errors() {
        let mgr: BlockInfoManager<&str, ()> = BlockInfoManager::new();
        assert_matches!(mgr.unlock(&"missing").unwrap_err().kind(), ErrorKind::NotFound(_));
    }

    #[test]
    fn clear_unregisters_non_task_writer() {
        let mgr: BlockInfoManager<&str, ()> = BlockInfoManager::new();
        assert!(mgr.lock_new_block_for_writing("b", BlockInfo::new((), "T", false)));
        mgr.clear();
        assert_eq!(mgr.size(), 0);
        assert_matches!(
            mgr.unlock(&"b").unwrap_err().kind(),
            ErrorKind::NotFound(_)
        );
    }
}
