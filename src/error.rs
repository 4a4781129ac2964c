// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error types reported by the block-info manager.
//!
//! Invariant violations (negative counts, reader/writer coexistence,
//! over-release) are programmer errors and are not represented here at all:
//! they fail loudly via `assert!`/`debug_assert!` at the point of detection,
//! per spec.md §7.

use std::error::Error as StdError;
use std::fmt;

use crate::task::TaskAttemptId;

/// What went wrong servicing a manager call.
#[derive(Debug)]
pub enum ErrorKind {
    /// `register_task` was called twice for the same task attempt id.
    AlreadyRegistered(TaskAttemptId),
    /// A block id was referenced that has no entry in the manager.
    NotFound(String),
    /// A write-protected operation was invoked by a task that does not hold
    /// the write lock on the block.
    NotOwned {
        block: String,
        holder: TaskAttemptId,
        caller: TaskAttemptId,
    },
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::AlreadyRegistered(task) => {
                write!(f, "task attempt {task} is already registered")
            }
            ErrorKind::NotFound(block) => write!(f, "no block info for block {block}"),
            ErrorKind::NotOwned {
                block,
                holder,
                caller,
            } => write!(
                f,
                "block {block} is write-locked by task {holder}, not by the calling task {caller}"
            ),
        }
    }
}

/// An error reported by a [`crate::BlockInfoManager`] call.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// The specific kind of failure.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl StdError for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error { kind }
    }
}

/// Convenience alias for the `Result` type this crate's fallible operations
/// return.
pub type Result<T> = std::result::Result<T, Error>;
