// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A block metadata table and readers/writer locking protocol for a
//! concurrent in-memory/disk storage layer.
//!
//! This crate tracks, per block id, who currently holds its read or write
//! lock, resolves the race between concurrent first-writers of a new block,
//! and bulk-releases everything a task attempt holds when that attempt
//! completes or fails. It does not store bytes, serialize values, talk to a
//! remote master, or replicate anything — those are a storage layer's other
//! collaborators, built on top of the table this crate maintains.
//!
//! See [`BlockInfoManager`] for the entry point.

#[macro_use]
extern crate log;

mod block_info;
mod error;
mod handle;
mod manager;
mod task;

pub use block_info::BlockInfo;
pub use error::{Error, ErrorKind, Result};
pub use handle::BlockInfoHandle;
pub use manager::{BlockId, BlockInfoManager};
pub use task::{current_task_attempt_id, TaskAttemptId, TaskAttemptIdScope};
