// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Task attempt identity and the ambient mechanism for discovering it.
//!
//! The manager needs to know, for every public call, which task attempt is
//! making it. The host runtime is expected to set this once per worker
//! thread before running task code; this module stores that value in a
//! thread-local cell, the "preemptive runtime" option spec.md §9 calls out.

use std::cell::Cell;
use std::fmt;

/// Identifies one execution attempt of a computation unit.
///
/// Two values are reserved and can never be assigned to a real task attempt:
/// [`TaskAttemptId::NO_WRITER`] marks a block with no current writer, and
/// [`TaskAttemptId::NON_TASK_WRITER`] stands in for driver/setup/shutdown
/// threads that are not running inside any task attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TaskAttemptId(i64);

impl TaskAttemptId {
    /// Sentinel written into `BlockInfo::writer_task` when no task holds the
    /// write lock on a block.
    pub const NO_WRITER: TaskAttemptId = TaskAttemptId(-1);

    /// Sentinel used for callers with no active task attempt (the driver
    /// thread, setup code, tests).
    pub const NON_TASK_WRITER: TaskAttemptId = TaskAttemptId(-1024);

    /// Wrap a real, non-negative task attempt id.
    ///
    /// # Panics
    ///
    /// Panics if `id` collides with either reserved sentinel. Real task
    /// attempt ids are non-negative by convention, but the check only
    /// guards against the two specific reserved values, not all negatives,
    /// to match the letter of spec.md §3's sentinel encoding.
    pub fn new(id: i64) -> TaskAttemptId {
        assert!(
            id != Self::NO_WRITER.0 && id != Self::NON_TASK_WRITER.0,
            "task attempt id {id} collides with a reserved sentinel"
        );
        TaskAttemptId(id)
    }

    pub(crate) fn is_real(self) -> bool {
        self != Self::NO_WRITER && self != Self::NON_TASK_WRITER
    }
}

impl fmt::Display for TaskAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NO_WRITER => write!(f, "<no writer>"),
            Self::NON_TASK_WRITER => write!(f, "<non-task>"),
            TaskAttemptId(id) => write!(f, "{id}"),
        }
    }
}

thread_local! {
    static CURRENT_TASK_ATTEMPT_ID: Cell<TaskAttemptId> = const { Cell::new(TaskAttemptId::NON_TASK_WRITER) };
}

/// Returns the task attempt id ambient on the calling thread, or
/// [`TaskAttemptId::NON_TASK_WRITER`] if none has been entered.
pub fn current_task_attempt_id() -> TaskAttemptId {
    CURRENT_TASK_ATTEMPT_ID.with(Cell::get)
}

/// RAII guard that makes `id` the ambient task attempt id for the calling
/// thread for as long as it is alive, restoring the previous value on drop.
///
/// A host runtime calls [`TaskAttemptIdScope::enter`] once on a worker
/// thread before running a task attempt's code, and drops the returned
/// guard when the task attempt finishes (successfully or not) so the thread
/// reverts to whatever ambient id it had before — `NON_TASK_WRITER` at the
/// top level, or an outer scope's id if task attempts are ever nested.
#[must_use = "the ambient task attempt id reverts as soon as this guard is dropped"]
pub struct TaskAttemptIdScope {
    previous: TaskAttemptId,
}

impl TaskAttemptIdScope {
    /// Enter `id` as the ambient task attempt id on the calling thread.
    pub fn enter(id: TaskAttemptId) -> TaskAttemptIdScope {
        let previous = current_task_attempt_id();
        CURRENT_TASK_ATTEMPT_ID.with(|cell| cell.set(id));
        TaskAttemptIdScope { previous }
    }
}

impl Drop for TaskAttemptIdScope {
    fn drop(&mut self) {
        CURRENT_TASK_ATTEMPT_ID.with(|cell| cell.set(self.previous));
    }
}
