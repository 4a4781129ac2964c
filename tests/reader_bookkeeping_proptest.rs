// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Property test for the reader bookkeeping invariant from spec.md §8: at
//! any point, a block's `reader_count` equals the sum, across every
//! registered task, of that task's per-block read multiplicity.

use blockmgr::{BlockInfo, BlockInfoManager, TaskAttemptId, TaskAttemptIdScope};
use proptest::prelude::*;

mod common;

const TASK_COUNT: i64 = 4;

#[derive(Clone, Copy, Debug)]
enum Op {
    Lock(i64),
    Unlock(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..TASK_COUNT).prop_map(Op::Lock),
        (0..TASK_COUNT).prop_map(Op::Unlock),
    ]
}

proptest! {
    #[test]
    fn reader_count_matches_per_task_multiplicities(ops in prop::collection::vec(op_strategy(), 0..200)) {
        common::init_logger();
        let mgr: BlockInfoManager<&str, ()> = BlockInfoManager::new();
        for id in 0..TASK_COUNT {
            mgr.register_task(TaskAttemptId::new(id)).unwrap();
        }
        assert!(mgr.lock_new_block_for_writing("b", BlockInfo::new((), "T", false)));
        mgr.downgrade_lock(&"b").unwrap();

        let mut expected = [0u64; TASK_COUNT as usize];

        for op in ops {
            match op {
                Op::Lock(id) => {
                    let _scope = TaskAttemptIdScope::enter(TaskAttemptId::new(id));
                    if mgr.lock_for_reading(&"b", false).is_some() {
                        expected[id as usize] += 1;
                    }
                }
                Op::Unlock(id) => {
                    if expected[id as usize] > 0 {
                        let _scope = TaskAttemptIdScope::enter(TaskAttemptId::new(id));
                        mgr.unlock(&"b").unwrap();
                        expected[id as usize] -= 1;
                    }
                }
            }
            let total: u64 = expected.iter().sum();
            prop_assert_eq!(mgr.get(&"b").unwrap().reader_count() as u64, total);
        }

        for id in 0..TASK_COUNT {
            for _ in 0..expected[id as usize] {
                let _scope = TaskAttemptIdScope::enter(TaskAttemptId::new(id));
                mgr.unlock(&"b").unwrap();
            }
        }
    }
}
