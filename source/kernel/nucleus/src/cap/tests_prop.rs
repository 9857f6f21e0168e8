// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for capability-id allocation
//! OWNERS: @kernel-cap-team
//! NOTE: Tests only; no kernel logic. Checks the allocator against a set model.
//!
//! TEST_SCOPE:
//!   - Allocated ids are unique, non-zero and at or above the placement window
//!   - alloc() always returns the lowest free id above the window
//!   - used() tracks outstanding ids across arbitrary alloc/free interleavings
//!
//! TEST_SCENARIOS:
//!   - alloc_free_matches_model(): random op sequences agree with a BTreeSet model
//!   - ranges_never_overlap(): alloc_range runs are disjoint and fully inside capacity

use super::{CapId, CapIdAllocator, CapIdError};
use proptest::prelude::*;
use std::collections::BTreeSet;

const CAPACITY: usize = 128;
const WINDOW: usize = 10;

#[derive(Debug, Clone)]
enum Op {
    Alloc,
    Free(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![3 => Just(Op::Alloc), 2 => any::<usize>().prop_map(Op::Free)]
}

proptest! {
    #[test]
    fn alloc_free_matches_model(ops in proptest::collection::vec(arb_op(), 1..400)) {
        let mut ids = CapIdAllocator::new(CAPACITY, WINDOW);
        let mut held: Vec<CapId> = Vec::new();
        let mut model: BTreeSet<usize> = BTreeSet::new();

        for op in ops {
            match op {
                Op::Alloc => {
                    let expected = (WINDOW..CAPACITY).find(|id| !model.contains(id));
                    match ids.alloc() {
                        Ok(cap) => {
                            let id = cap.sel().as_index();
                            prop_assert_eq!(Some(id), expected);
                            prop_assert!(id >= WINDOW && id != 0);
                            prop_assert!(model.insert(id));
                            held.push(cap);
                        }
                        Err(err) => {
                            prop_assert_eq!(err, CapIdError::Exhausted);
                            prop_assert!(expected.is_none());
                        }
                    }
                }
                Op::Free(pick) => {
                    if held.is_empty() {
                        continue;
                    }
                    let cap = held.swap_remove(pick % held.len());
                    prop_assert!(model.remove(&cap.sel().as_index()));
                    ids.free(cap);
                }
            }
            prop_assert_eq!(ids.used(), model.len());
        }

        for cap in held {
            ids.free(cap);
        }
        prop_assert_eq!(ids.used(), 0);
    }

    #[test]
    fn ranges_never_overlap(sizes in proptest::collection::vec(1usize..9, 1..40)) {
        let mut ids = CapIdAllocator::new(CAPACITY, WINDOW);
        let mut covered: BTreeSet<usize> = BTreeSet::new();
        let mut ranges = Vec::new();

        for size in sizes {
            match ids.alloc_range(size) {
                Ok(range) => {
                    let base = range.base().as_index();
                    prop_assert!(base >= WINDOW);
                    prop_assert!(base + range.len() <= CAPACITY);
                    for id in base..base + range.len() {
                        prop_assert!(covered.insert(id), "id {} handed out twice", id);
                    }
                    ranges.push(range);
                }
                Err(err) => prop_assert_eq!(err, CapIdError::Exhausted),
            }
        }

        for range in ranges {
            ids.free_range(range);
        }
        prop_assert_eq!(ids.used(), 0);
    }
}
