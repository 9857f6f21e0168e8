// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Thread kernel object
//! OWNERS: @kernel-team
//! PUBLIC API: Thread, ThreadId, ThreadState, FaultResume
//! DEPENDS_ON: sched::SchedEntity, pd::ThreadBinding, pager::message
//! INVARIANTS: A thread is bound to at most one domain; a pager holds at most one
//!             unanswered message

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::string::String;

use crate::pager::message::{PagerMessage, RawMessage};
use crate::pager::Pagefault;
use crate::pd::ThreadBinding;
use crate::registry::registry_handle;
use crate::sched::{Priority, SchedEntity};
use crate::trap::TrapFrame;
use crate::types::CpuId;

registry_handle!(
    /// Generational handle of a thread.
    ThreadId,
    "T"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created or stopped; not schedulable.
    Stopped,
    /// In its CPU's ready queue (or running).
    Ready,
    /// Blocked on a page fault or exception until its pager answers.
    AwaitFaultReply,
    /// A pager blocked in receive with an empty inbox.
    AwaitPagerMessage,
    /// Terminated by its pager or by a protocol violation.
    Dead,
}

/// How a blocked faulter came back to life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResume {
    /// The pager installed a mapping.
    Resolved,
    /// Woken without a mapping; the access is retried.
    Woken,
    /// The block was cancelled.
    Cancelled,
}

#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    name: String,
    cpu: CpuId,
    pub(crate) sched: SchedEntity<ThreadId>,
    pub(crate) state: ThreadState,
    binding: Option<ThreadBinding>,
    pub(crate) frame: TrapFrame,
    pub(crate) pending_fault: Option<Pagefault>,
    pub(crate) resume: Option<FaultResume>,
    /// Messages waiting for this thread in its role as a pager.
    pub(crate) inbox: VecDeque<RawMessage>,
    /// Message handed out by the last receive and not yet answered.
    pub(crate) serving: Option<PagerMessage>,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, name: &str, priority: Priority, cpu: CpuId) -> Self {
        Self {
            id,
            name: String::from(name),
            cpu,
            sched: SchedEntity::new(id, priority),
            state: ThreadState::Stopped,
            binding: None,
            frame: TrapFrame::default(),
            pending_fault: None,
            resume: None,
            inbox: VecDeque::new(),
            serving: None,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn priority(&self) -> Priority {
        self.sched.priority()
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn binding(&self) -> Option<&ThreadBinding> {
        self.binding.as_ref()
    }

    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    /// Fault the thread is blocked on, if any.
    pub fn pending_fault(&self) -> Option<&Pagefault> {
        self.pending_fault.as_ref()
    }

    pub fn is_enqueued(&self) -> bool {
        self.sched.is_enqueued()
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    pub(crate) fn bind(&mut self, binding: ThreadBinding) {
        debug_assert!(self.binding.is_none(), "thread {} bound twice", self.id);
        self.binding = Some(binding);
    }

    pub(crate) fn unbind(&mut self) -> Option<ThreadBinding> {
        self.binding.take()
    }
}
