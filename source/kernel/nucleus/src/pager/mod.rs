// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault protocol between the kernel and user-level pager threads
//! OWNERS: @kernel-ipc-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: IpcPager, Parked, FaultReceived, ExceptionReceived, WakeupReceived,
//!             Wait, Event, Mapping, Pagefault, PagerError, ReplyError
//! DEPENDS_ON: kernel::Kernel (pager entry points), pager::message
//! INVARIANTS: A pager holds at most one unanswered message; a map failure leaves the
//!             faulter blocked; faults are served in arrival order per pager
//!
//! The pager loop is a chain of typestates. Each state is consumed by the
//! operation that leaves it, so a pager cannot answer a fault twice or wait
//! for a new one while an answer is still owed:
//!
//! ```text
//! IpcPager --wait_for_fault--> Wait::Parked(Parked) --resume--> Wait::Received(..)
//!                          \-> Wait::Received(Event::Fault(FaultReceived))
//! FaultReceived --reply_and_wait_for_fault--> Wait
//! ```

pub mod message;

use thiserror_no_std::Error;

use crate::kernel::Kernel;
use crate::mm::{MapError, PageFlags, MAX_LEAF_LOG2, PAGE_SIZE_LOG2};
use crate::platform::Platform;
use crate::thread::ThreadId;
use crate::types::{PhysAddr, VirtAddr};

use self::message::{PagerMessage, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cacheability {
    #[default]
    Cached,
    WriteCombined,
    Uncached,
}

/// Translation a pager installs to resolve a fault.
///
/// The default value is invalid (`size_log2 == 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mapping {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    pub size_log2: u8,
    pub writable: bool,
    pub executable: bool,
    pub cacheability: Cacheability,
}

impl Mapping {
    pub const fn new(virt: VirtAddr, phys: PhysAddr, size_log2: u8, writable: bool) -> Self {
        Self {
            virt,
            phys,
            size_log2,
            writable,
            executable: false,
            cacheability: Cacheability::Cached,
        }
    }

    pub const fn with_executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    pub const fn with_cacheability(mut self, cacheability: Cacheability) -> Self {
        self.cacheability = cacheability;
        self
    }

    /// Sizes from one base page up to the largest leaf, naturally aligned.
    pub fn is_valid(&self) -> bool {
        (PAGE_SIZE_LOG2..=MAX_LEAF_LOG2).contains(&self.size_log2)
            && self.virt.is_aligned(self.size_log2)
            && self.phys.is_aligned(self.size_log2)
    }

    /// Number of base pages covered; zero if the size does not fit a `usize`.
    pub fn page_count(&self) -> usize {
        let shift = self.size_log2.saturating_sub(PAGE_SIZE_LOG2);
        1usize.checked_shl(u32::from(shift)).unwrap_or(0)
    }

    pub fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::VALID | PageFlags::READ | PageFlags::USER;
        if self.writable {
            flags |= PageFlags::WRITE;
        }
        if self.executable {
            flags |= PageFlags::EXECUTE;
        }
        match self.cacheability {
            Cacheability::Cached => {}
            Cacheability::WriteCombined => flags |= PageFlags::WRITE_COMBINED,
            Cacheability::Uncached => flags |= PageFlags::UNCACHED,
        }
        flags
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read = 0,
    Write = 1,
    Execute = 2,
}

impl FaultAccess {
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::Execute),
            _ => None,
        }
    }
}

/// Fault record delivered to a pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagefault {
    pub faulter: ThreadId,
    pub addr: VirtAddr,
    pub ip: VirtAddr,
    pub access: FaultAccess,
}

impl Pagefault {
    pub fn is_write(&self) -> bool {
        self.access == FaultAccess::Write
    }

    pub fn is_exec(&self) -> bool {
        self.access == FaultAccess::Execute
    }
}

/// Non-fault exception reported to a thread's pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub thread: ThreadId,
    pub ip: VirtAddr,
    pub vector: usize,
}

#[must_use = "pager errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PagerError {
    #[error("pager thread does not exist")]
    UnknownPager,
    #[error("pager thread is not running")]
    NotRunning,
    #[error("pager still owes an answer")]
    AlreadyServing,
    #[error("pager holds no message to answer")]
    NotServing,
    #[error("reply mapping is invalid")]
    InvalidMapping,
    #[error("idle threads cannot serve as pagers")]
    IdlePager,
    #[error("destination is served by another pager")]
    ForeignFaulter,
    #[error("mapping failed: {0}")]
    Map(MapError),
    #[error("protocol violation: {0}")]
    Protocol(ProtocolError),
}

impl From<MapError> for PagerError {
    fn from(err: MapError) -> Self {
        Self::Map(err)
    }
}

impl From<ProtocolError> for PagerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

/// Failure of `reply_and_wait_for_fault`.
#[must_use = "a rejected reply leaves the faulter blocked"]
#[derive(Debug)]
pub enum ReplyError {
    /// The reply was rejected; the faulter is still blocked and the fault is
    /// handed back for a retry, a cancel or a defer.
    Rejected { error: PagerError, fault: FaultReceived },
    /// The reply went out but waiting for the next message failed.
    Receive(PagerError),
}

impl ReplyError {
    pub fn error(&self) -> PagerError {
        match self {
            Self::Rejected { error, .. } | Self::Receive(error) => *error,
        }
    }

    pub fn into_fault(self) -> Option<FaultReceived> {
        match self {
            Self::Rejected { fault, .. } => Some(fault),
            Self::Receive(_) => None,
        }
    }
}

/// Outcome of waiting for the next pager message.
#[must_use = "a received message must be answered"]
#[derive(Debug)]
pub enum Wait {
    Received(Event),
    /// The inbox was empty; the pager thread is blocked until a message arrives.
    Parked(Parked),
}

#[derive(Debug)]
pub enum Event {
    Fault(FaultReceived),
    Exception(ExceptionReceived),
    Wakeup(WakeupReceived),
}

/// Armed pager: may wait for the next message.
#[derive(Debug)]
pub struct IpcPager {
    thread: ThreadId,
}

impl IpcPager {
    pub fn new(thread: ThreadId) -> Self {
        Self { thread }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Takes the next message or parks the pager thread.
    ///
    /// A message with an unknown tag kills the pager thread and is reported
    /// as [`PagerError::Protocol`].
    pub fn wait_for_fault<P: Platform>(self, kernel: &mut Kernel<P>) -> Result<Wait, PagerError> {
        match kernel.pager_receive(self.thread)? {
            Some(msg) => Ok(Wait::Received(Event::new(self.thread, msg))),
            None => Ok(Wait::Parked(Parked { thread: self.thread })),
        }
    }
}

/// Pager blocked in receive.
#[derive(Debug)]
pub struct Parked {
    thread: ThreadId,
}

impl Parked {
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Continues after the pager thread was scheduled again. Stays parked if
    /// it is still blocked.
    pub fn resume<P: Platform>(self, kernel: &mut Kernel<P>) -> Result<Wait, PagerError> {
        if kernel.pager_is_parked(self.thread) {
            return Ok(Wait::Parked(self));
        }
        IpcPager::new(self.thread).wait_for_fault(kernel)
    }
}

impl Event {
    fn new(pager: ThreadId, msg: PagerMessage) -> Self {
        match msg {
            PagerMessage::PageFault(fault) => Self::Fault(FaultReceived {
                pager,
                fault,
                reply_dst: fault.faulter,
                reply_mapping: Mapping::default(),
            }),
            PagerMessage::Exception(info) => Self::Exception(ExceptionReceived { pager, info }),
            PagerMessage::Wakeup { target } => Self::Wakeup(WakeupReceived { pager, target }),
        }
    }
}

/// What the pager does about the message it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Answer {
    Resolve(Mapping),
    Wake,
    Cancel,
    Stop,
    Defer,
}

/// A page fault the pager must answer.
#[derive(Debug)]
pub struct FaultReceived {
    pager: ThreadId,
    fault: Pagefault,
    reply_dst: ThreadId,
    reply_mapping: Mapping,
}

impl FaultReceived {
    pub fn fault(&self) -> &Pagefault {
        &self.fault
    }

    pub fn pager(&self) -> ThreadId {
        self.pager
    }

    pub fn reply_dst(&self) -> ThreadId {
        self.reply_dst
    }

    pub fn set_reply_mapping(&mut self, mapping: Mapping) {
        self.reply_mapping = mapping;
    }

    /// Redirects the reply to another blocked thread.
    pub fn set_reply_dst(&mut self, dst: ThreadId) {
        self.reply_dst = dst;
    }

    /// Installs the reply mapping, resumes the faulter and waits for the next
    /// message.
    pub fn reply_and_wait_for_fault<P: Platform>(
        self,
        kernel: &mut Kernel<P>,
    ) -> Result<Wait, ReplyError> {
        let answer = Answer::Resolve(self.reply_mapping);
        if let Err(error) = kernel.pager_answer(self.pager, self.reply_dst, answer) {
            return Err(ReplyError::Rejected { error, fault: self });
        }
        IpcPager::new(self.pager).wait_for_fault(kernel).map_err(ReplyError::Receive)
    }

    /// Leaves the faulter blocked until a wakeup names it.
    pub fn defer<P: Platform>(self, kernel: &mut Kernel<P>) -> Result<Wait, PagerError> {
        kernel.pager_answer(self.pager, self.fault.faulter, Answer::Defer)?;
        IpcPager::new(self.pager).wait_for_fault(kernel)
    }

    /// Gives up on the fault; the faulter returns with a cancelled status.
    pub fn cancel_faulter<P: Platform>(self, kernel: &mut Kernel<P>) -> Result<Wait, PagerError> {
        kernel.pager_answer(self.pager, self.fault.faulter, Answer::Cancel)?;
        IpcPager::new(self.pager).wait_for_fault(kernel)
    }
}

/// A non-fault exception the pager must answer.
#[derive(Debug)]
pub struct ExceptionReceived {
    pager: ThreadId,
    info: ExceptionInfo,
}

impl ExceptionReceived {
    pub fn info(&self) -> &ExceptionInfo {
        &self.info
    }

    /// Lets the thread continue at its saved state.
    pub fn resume_faulter<P: Platform>(self, kernel: &mut Kernel<P>) -> Result<Wait, PagerError> {
        kernel.pager_answer(self.pager, self.info.thread, Answer::Wake)?;
        IpcPager::new(self.pager).wait_for_fault(kernel)
    }

    /// Terminates the thread.
    pub fn stop_faulter<P: Platform>(self, kernel: &mut Kernel<P>) -> Result<Wait, PagerError> {
        kernel.pager_answer(self.pager, self.info.thread, Answer::Stop)?;
        IpcPager::new(self.pager).wait_for_fault(kernel)
    }
}

/// Request to wake a thread whose fault was deferred.
#[derive(Debug)]
pub struct WakeupReceived {
    pager: ThreadId,
    target: ThreadId,
}

impl WakeupReceived {
    pub fn target(&self) -> ThreadId {
        self.target
    }

    /// Wakes the target without a mapping; it retries the access.
    pub fn acknowledge_wakeup<P: Platform>(
        self,
        kernel: &mut Kernel<P>,
    ) -> Result<Wait, PagerError> {
        kernel.pager_answer(self.pager, self.target, Answer::Wake)?;
        IpcPager::new(self.pager).wait_for_fault(kernel)
    }
}
