// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU fixed-priority scheduler with round-robin within a priority
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (new/insert/insert_and_check/remove/update_occupant/yield_occupation/account),
//!             SchedEntity, Priority
//! DEPENDS_ON: alloc::collections::VecDeque
//! INVARIANTS: The idle handle never enters a ready queue; an entity is in at most one
//!             queue; the occupant is the head of the highest non-empty queue, or idle

extern crate alloc;

#[cfg(test)]
mod tests_prop;

use alloc::collections::VecDeque;
use core::{array, fmt, marker::PhantomData};

/// Fixed scheduling priority, higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(127);
    /// Number of distinct priority levels.
    pub const LEVELS: usize = Self::MAX.0 as usize + 1;

    /// Clamps `raw` into `[MIN, MAX]`.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        if raw > Self::MAX.0 as u32 {
            Self::MAX
        } else {
            Self(raw as u8)
        }
    }

    #[inline]
    pub const fn as_raw(self) -> u8 {
        self.0
    }

    #[inline]
    const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A schedulable participant as the scheduler sees it.
///
/// The handle identifies the owning object; the priority is fixed for the
/// entity's lifetime.
#[derive(Debug)]
pub struct SchedEntity<H> {
    handle: H,
    priority: Priority,
    enqueued: bool,
}

impl<H: Copy> SchedEntity<H> {
    pub const fn new(handle: H, priority: Priority) -> Self {
        Self { handle, priority, enqueued: false }
    }

    pub fn handle(&self) -> H {
        self.handle
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_enqueued(&self) -> bool {
        self.enqueued
    }
}

/// Per-CPU scheduler.
///
/// ## Send/Sync Safety
///
/// `Scheduler` is `!Send` and `!Sync`: each CPU owns exactly one and only that
/// CPU's kernel path touches it. Cross-CPU wakeups go through the owning CPU.
pub struct Scheduler<H> {
    queues: [VecDeque<H>; Priority::LEVELS],
    idle: H,
    occupant: Option<(H, Priority)>,
    yield_pending: bool,
    ready: usize,
    timeslice: u32,
    slice_left: u32,
    // CPU-local contract: never crosses thread boundaries.
    _not_send_sync: PhantomData<*mut ()>,
}
static_assertions::assert_not_impl_any!(Scheduler<u32>: Send, Sync);

impl<H: Copy + Eq + fmt::Debug> Scheduler<H> {
    /// Creates a scheduler whose fallback is `idle`, charging `timeslice`
    /// ticks per slice.
    pub fn new(idle: H, timeslice: u32) -> Self {
        Self {
            queues: array::from_fn(|_| VecDeque::new()),
            idle,
            occupant: None,
            yield_pending: false,
            ready: 0,
            timeslice: timeslice.max(1),
            slice_left: timeslice.max(1),
            _not_send_sync: PhantomData,
        }
    }

    pub fn idle(&self) -> H {
        self.idle
    }

    /// Makes `entity` ready.
    ///
    /// # Panics
    /// If `entity` is the idle handle or already enqueued.
    pub fn insert(&mut self, entity: &mut SchedEntity<H>) {
        assert!(entity.handle != self.idle, "idle entity {:?} must not be enqueued", self.idle);
        assert!(!entity.enqueued, "entity {:?} inserted twice", entity.handle);
        self.queues[entity.priority.as_index()].push_back(entity.handle);
        entity.enqueued = true;
        self.ready += 1;
    }

    /// Inserts `entity` and reports whether it should preempt the occupant.
    ///
    /// True if the CPU is idle or `entity` has strictly higher priority.
    pub fn insert_and_check(&mut self, entity: &mut SchedEntity<H>) -> bool {
        self.insert(entity);
        match self.occupant {
            None => true,
            Some((_, current)) => entity.priority > current,
        }
    }

    /// Takes `entity` out of its ready queue.
    ///
    /// # Panics
    /// If `entity` is not enqueued here.
    pub fn remove(&mut self, entity: &mut SchedEntity<H>) {
        assert!(entity.enqueued, "entity {:?} removed while not enqueued", entity.handle);
        let queue = &mut self.queues[entity.priority.as_index()];
        let Some(pos) = queue.iter().position(|h| *h == entity.handle) else {
            panic!("entity {:?} missing from priority {} queue", entity.handle, entity.priority);
        };
        queue.remove(pos);
        entity.enqueued = false;
        self.ready -= 1;
    }

    /// Recomputes the occupant.
    ///
    /// Returns the handle that should run and whether it differs from the
    /// previous occupant. A pending yield rotates the previous occupant's
    /// queue first and always reports a switch, even when the same handle is
    /// chosen again.
    pub fn update_occupant(&mut self) -> (H, bool) {
        let yielded = core::mem::take(&mut self.yield_pending);
        if yielded {
            if let Some((handle, prio)) = self.occupant {
                let queue = &mut self.queues[prio.as_index()];
                if queue.front() == Some(&handle) {
                    queue.rotate_left(1);
                }
            }
        }

        let previous = self.occupant.map_or(self.idle, |(h, _)| h);
        self.occupant = self.head();
        let next = self.occupant.map_or(self.idle, |(h, _)| h);
        let switched = next != previous || (yielded && self.occupant.is_some());
        if switched {
            self.slice_left = self.timeslice;
        }
        log::trace!(target: "sched", "pick {:?} switched={} ready={}", next, switched, self.ready);
        (next, switched)
    }

    /// Requests that the occupant go to the back of its queue on the next
    /// `update_occupant`.
    pub fn yield_occupation(&mut self) {
        self.yield_pending = true;
    }

    /// Charges `ticks` to the occupant's slice. An exhausted slice behaves
    /// like `yield_occupation`.
    pub fn account(&mut self, ticks: u32) {
        if self.occupant.is_none() {
            return;
        }
        self.slice_left = self.slice_left.saturating_sub(ticks);
        if self.slice_left == 0 {
            self.yield_pending = true;
        }
    }

    /// The occupant chosen by the last `update_occupant`, or idle.
    pub fn occupant(&self) -> H {
        self.occupant.map_or(self.idle, |(h, _)| h)
    }

    pub fn ready_count(&self) -> usize {
        self.ready
    }

    pub fn slice_left(&self) -> u32 {
        self.slice_left
    }

    fn head(&self) -> Option<(H, Priority)> {
        self.queues
            .iter()
            .enumerate()
            .rev()
            .find_map(|(prio, queue)| queue.front().map(|h| (*h, Priority(prio as u8))))
    }
}
