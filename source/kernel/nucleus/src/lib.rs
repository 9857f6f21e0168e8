// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NUCLEUS: capability identity, per-CPU scheduling and the pager protocol
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, proptest suites (cap, sched), tests/scenarios.rs
//! PUBLIC API: Kernel, IpcPager, Scheduler, CapIdAllocator, IdentityTree, Pd, Registry
//! DEPENDS_ON: bitflags, spin, static_assertions, log, thiserror-no-std
//! INVARIANTS: Threads leave a domain before its memory; ids released exactly once;
//!             the idle entity never enters a ready queue; one unanswered fault per pager

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

pub mod registry;

pub mod cap;
pub mod config;
pub mod kernel;
pub mod mm;
pub mod pager;
pub mod pd;
pub mod platform;
pub mod sched;
pub mod signal;
pub mod sync;
pub mod thread;
pub mod trap;
pub mod types;

pub use cap::{CapId, CapIdAllocator, CapIdError, CapRange, CapSpace};
pub use cap::tree::{IdentityRef, IdentityTree, ObjectRef};
pub use config::{ConfigError, KernelConfig};
pub use kernel::{Kernel, KernelError};
pub use mm::{MapError, PageFlags, Translation, TranslationTable, PAGE_SIZE};
pub use pager::message::{PagerMessage, ProtocolError, RawMessage};
pub use pager::{
    Cacheability, Event, ExceptionInfo, ExceptionReceived, FaultAccess, FaultReceived, IpcPager,
    Mapping, Pagefault, Parked, PagerError, ReplyError, Wait, WakeupReceived,
};
pub use pd::{Pd, PdError, PdId, ThreadBinding};
pub use platform::{DecodeError, FaultDecoder, Platform, SoftMmu, StatusWordDecoder, Sv39Decoder};
pub use sched::{Priority, SchedEntity, Scheduler};
pub use signal::{Signal, SignalBroker, SignalContextId, SignalError};
pub use thread::{FaultResume, Thread, ThreadId, ThreadState};
pub use trap::TrapFrame;
pub use types::{CapSel, CpuId, PhysAddr, Slot, VirtAddr};
