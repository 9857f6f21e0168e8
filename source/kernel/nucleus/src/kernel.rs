// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel facade tying domains, threads, schedulers, pagers and signals together
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: Kernel (domain/thread lifecycle, fault entry, unmap, scheduling, signals), KernelError
//! DEPENDS_ON: pd::Pd, thread::Thread, sched::Scheduler, pager, signal::SignalBroker, platform::Platform
//! INVARIANTS: A thread is enqueued iff its state is Ready and it is not an idle thread;
//!             a blocked faulter is resumed at most once per fault;
//!             a domain's threads are quiesced before the domain is torn down
//!
//! Each entry point runs to completion on the calling CPU. Threads blocked on a
//! fault leave their ready queue and come back through `resume`, which records
//! how the block ended so the trap return path can read it with `take_resume`.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use thiserror_no_std::Error;

use crate::cap::tree::ObjectRef;
use crate::cap::CapIdError;
use crate::config::{ConfigError, KernelConfig};
use crate::mm::Translation;
use crate::pager::message::{PagerMessage, RawMessage};
use crate::pager::{Answer, ExceptionInfo, PagerError};
use crate::pd::{Pd, PdError, PdId, ThreadBinding};
use crate::platform::{DecodeError, Platform};
use crate::registry::Registry;
use crate::sched::{Priority, Scheduler};
use crate::signal::{Signal, SignalBroker, SignalError};
use crate::thread::{FaultResume, Thread, ThreadId, ThreadState};
use crate::trap::{fmt_trap, TrapFrame};
use crate::types::{CapSel, CpuId, VirtAddr};

#[must_use = "kernel errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("thread does not exist")]
    UnknownThread,
    #[error("domain does not exist")]
    UnknownDomain,
    #[error("cpu {0} is not managed by this kernel")]
    InvalidCpu(CpuId),
    #[error("idle threads cannot be managed")]
    IdleThread,
    #[error("the core domain cannot be destroyed")]
    CoreDomain,
    #[error("thread is not bound to a domain")]
    NotBound,
    #[error("operation not allowed in thread state {0:?}")]
    InvalidState(ThreadState),
    #[error("no live pager registered for the thread")]
    NoPager,
    #[error("thread is not blocked on its pager")]
    NotBlocked,
    #[error("selector does not name a signal context")]
    NotASignalContext,
    #[error("configuration: {0}")]
    Config(ConfigError),
    #[error("domain: {0}")]
    Domain(PdError),
    #[error("fault decode: {0}")]
    Decode(DecodeError),
    #[error("signal: {0}")]
    Signal(SignalError),
    #[error("pager: {0}")]
    Pager(PagerError),
}

impl From<ConfigError> for KernelError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<PdError> for KernelError {
    fn from(err: PdError) -> Self {
        Self::Domain(err)
    }
}

impl From<CapIdError> for KernelError {
    fn from(err: CapIdError) -> Self {
        Self::Domain(PdError::Cap(err))
    }
}

impl From<DecodeError> for KernelError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<SignalError> for KernelError {
    fn from(err: SignalError) -> Self {
        Self::Signal(err)
    }
}

impl From<PagerError> for KernelError {
    fn from(err: PagerError) -> Self {
        Self::Pager(err)
    }
}

struct Cpu {
    sched: Scheduler<ThreadId>,
    /// Set when a wakeup should preempt the occupant.
    preempt: bool,
}

pub struct Kernel<P> {
    config: KernelConfig,
    platform: P,
    threads: Registry<ThreadId, Thread>,
    pds: Registry<PdId, Pd>,
    cpus: Vec<Cpu>,
    signals: SignalBroker,
    core_pd: PdId,
}

impl<P: Platform> Kernel<P> {
    /// Validates `config`, creates the core domain and one idle thread per CPU.
    pub fn new(config: KernelConfig, platform: P) -> Result<Self, KernelError> {
        config.validate()?;
        let mut pds = Registry::new();
        let core_pd = pds.try_insert_with(|id| Pd::new(id, &config, true))?;
        let mut threads = Registry::new();
        let cpus = (0..config.cpus)
            .map(|index| {
                let cpu = CpuId::from_raw(index as u16);
                let idle = threads.insert_with(|id| {
                    let mut thread = Thread::new(id, "idle", Priority::MIN, cpu);
                    thread.state = ThreadState::Ready;
                    thread
                });
                Cpu { sched: Scheduler::new(idle, config.timeslice_ticks), preempt: false }
            })
            .collect();
        log::info!(target: "kernel", "boot cpus={} core={}", config.cpus, core_pd);
        Ok(Self {
            config,
            platform,
            threads,
            pds,
            cpus,
            signals: SignalBroker::new(),
            core_pd,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn core_pd(&self) -> PdId {
        self.core_pd
    }

    pub fn pd(&self, id: PdId) -> Option<&Pd> {
        self.pds.get(id)
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id)
    }

    pub fn idle_thread(&self, cpu: CpuId) -> Option<ThreadId> {
        self.cpus.get(cpu.as_index()).map(|c| c.sched.idle())
    }

    pub fn translate(&self, pd: PdId, virt: VirtAddr) -> Option<Translation> {
        self.pds.get(pd)?.translate(virt)
    }

    /// Removes `page_count` pages at `virt` from the domain's table.
    pub fn unmap(&mut self, pd: PdId, virt: VirtAddr, page_count: usize) -> Result<(), KernelError> {
        let pd_ref = self.pds.get(pd).ok_or(KernelError::UnknownDomain)?;
        let platform = &self.platform;
        pd_ref.with_table(|table| platform.unmap(table, virt, page_count));
        log::debug!(target: "kernel", "{}: unmap {} pages={}", pd, virt, page_count);
        Ok(())
    }

    // ---- domains ----

    pub fn create_pd(&mut self) -> Result<PdId, KernelError> {
        let config = self.config;
        let id = self.pds.try_insert_with(|id| Pd::new(id, &config, false))?;
        Ok(id)
    }

    /// Records `parent` as the domain's parent capability (first valid value wins).
    pub fn assign_parent(&mut self, pd: PdId, parent: CapSel) -> Result<(), KernelError> {
        self.pds.get_mut(pd).ok_or(KernelError::UnknownDomain)?.assign_parent(parent);
        Ok(())
    }

    /// Tears a domain down.
    ///
    /// Admitted threads are stopped first (their pending faults cancelled and
    /// their queued pager messages withdrawn), then evicted, then the
    /// capability space and the translation table are released. Signal
    /// contexts still named by the domain are dissolved.
    pub fn destroy_pd(&mut self, id: PdId) -> Result<(), KernelError> {
        if id == self.core_pd {
            return Err(KernelError::CoreDomain);
        }
        let admitted = self.pds.get(id).ok_or(KernelError::UnknownDomain)?.admitted_threads();
        for tid in &admitted {
            self.quiesce(*tid, ThreadState::Stopped);
        }
        let pd = self.pds.remove(id).ok_or(KernelError::UnknownDomain)?;
        let leftovers = pd.destroy(&mut self.threads);
        for object in leftovers {
            if let ObjectRef::SignalContext(ctx) = object {
                self.signals.dissolve(ctx);
            }
        }
        log::info!(target: "kernel", "destroyed {} threads={}", id, admitted.len());
        Ok(())
    }

    // ---- threads ----

    pub fn create_thread(
        &mut self,
        name: &str,
        priority: Priority,
        cpu: CpuId,
    ) -> Result<ThreadId, KernelError> {
        if cpu.as_index() >= self.cpus.len() {
            return Err(KernelError::InvalidCpu(cpu));
        }
        let id = self.threads.insert_with(|id| Thread::new(id, name, priority, cpu));
        log::debug!(target: "kernel", "create {} '{}' prio={} cpu={}", id, name, priority, cpu);
        Ok(id)
    }

    pub fn bind_thread(&mut self, tid: ThreadId, pd: PdId) -> Result<ThreadBinding, KernelError> {
        self.ensure_not_idle(tid)?;
        let pd = self.pds.get_mut(pd).ok_or(KernelError::UnknownDomain)?;
        let thread = self.threads.get_mut(tid).ok_or(KernelError::UnknownThread)?;
        Ok(pd.admit(thread)?)
    }

    /// Stops the thread and evicts it from its domain. Idempotent.
    pub fn unbind_thread(&mut self, tid: ThreadId) -> Result<(), KernelError> {
        self.ensure_not_idle(tid)?;
        let thread = self.threads.get(tid).ok_or(KernelError::UnknownThread)?;
        let Some(binding) = thread.binding().copied() else {
            return Ok(());
        };
        self.quiesce(tid, ThreadState::Stopped);
        if let (Some(pd), Some(thread)) = (self.pds.get_mut(binding.pd), self.threads.get_mut(tid)) {
            pd.evict(thread);
        }
        Ok(())
    }

    pub fn destroy_thread(&mut self, tid: ThreadId) -> Result<(), KernelError> {
        self.unbind_thread(tid)?;
        self.quiesce(tid, ThreadState::Dead);
        self.threads.remove(tid);
        log::debug!(target: "kernel", "destroy {}", tid);
        Ok(())
    }

    /// Starts a stopped, bound thread at `ip` with stack `sp`.
    pub fn start_thread(&mut self, tid: ThreadId, ip: usize, sp: usize) -> Result<(), KernelError> {
        self.ensure_not_idle(tid)?;
        let thread = self.threads.get_mut(tid).ok_or(KernelError::UnknownThread)?;
        if thread.binding().is_none() {
            return Err(KernelError::NotBound);
        }
        if thread.state != ThreadState::Stopped {
            return Err(KernelError::InvalidState(thread.state));
        }
        thread.frame.start_at(ip, sp);
        thread.resume = None;
        self.make_ready(tid);
        Ok(())
    }

    /// Registers `pager` as the fault handler of `faulter`.
    pub fn set_pager(&mut self, faulter: ThreadId, pager: ThreadId) -> Result<CapSel, KernelError> {
        self.ensure_not_idle(pager)?;
        if !self.threads.contains(pager) {
            return Err(KernelError::UnknownThread);
        }
        let thread = self.threads.get(faulter).ok_or(KernelError::UnknownThread)?;
        let pd_id = thread.binding().ok_or(KernelError::NotBound)?.pd;
        let pd = self.pds.get_mut(pd_id).ok_or(KernelError::UnknownDomain)?;
        Ok(pd.set_pager(thread, pager)?)
    }

    /// How the last fault block of `tid` ended; cleared by the read.
    pub fn take_resume(&mut self, tid: ThreadId) -> Option<FaultResume> {
        self.threads.get_mut(tid)?.resume.take()
    }

    // ---- fault entry ----

    /// Page-fault entry for a running thread.
    ///
    /// The fault is decoded by the platform and queued to the thread's pager;
    /// the thread blocks until the pager answers. On error the thread is left
    /// untouched.
    pub fn page_fault(&mut self, tid: ThreadId, frame: TrapFrame) -> Result<(), KernelError> {
        self.ensure_running(tid)?;
        let fault = self.platform.read_fault_registers(tid, &frame)?;
        let pager = self.pager_of(tid)?;
        log::debug!(
            target: "kernel",
            "{} faults at {} ip={} {:?} -> {}",
            tid,
            fault.addr,
            fault.ip,
            fault.access,
            pager
        );
        self.block(tid, ThreadState::AwaitFaultReply);
        if let Some(thread) = self.threads.get_mut(tid) {
            thread.frame = frame;
            thread.pending_fault = Some(fault);
            thread.resume = None;
        }
        self.post(pager, PagerMessage::PageFault(fault));
        Ok(())
    }

    /// Non-fault exception entry; forwarded to the pager like a fault.
    pub fn exception(&mut self, tid: ThreadId, frame: TrapFrame) -> Result<(), KernelError> {
        self.ensure_running(tid)?;
        let pager = self.pager_of(tid)?;
        let info = ExceptionInfo {
            thread: tid,
            ip: VirtAddr::new(frame.ip()),
            vector: frame.exception_code(),
        };
        log::debug!(target: "kernel", "{} exception {:?} -> {}", tid, frame, pager);
        self.block(tid, ThreadState::AwaitFaultReply);
        if let Some(thread) = self.threads.get_mut(tid) {
            thread.frame = frame;
            thread.pending_fault = None;
            thread.resume = None;
        }
        self.post(pager, PagerMessage::Exception(info));
        Ok(())
    }

    /// Asks the pager of a blocked thread to wake it.
    pub fn request_wakeup(&mut self, target: ThreadId) -> Result<(), KernelError> {
        let thread = self.threads.get(target).ok_or(KernelError::UnknownThread)?;
        if thread.state != ThreadState::AwaitFaultReply {
            return Err(KernelError::NotBlocked);
        }
        let pager = self.pager_of(target)?;
        self.post(pager, PagerMessage::Wakeup { target });
        Ok(())
    }

    /// Ends a fault block without a pager answer.
    ///
    /// Returns false if the thread was not blocked. Messages about the thread
    /// still queued at its pager are withdrawn; an answer already being
    /// prepared by the pager is dropped when it arrives.
    pub fn cancel_blocking(&mut self, tid: ThreadId) -> Result<bool, KernelError> {
        let thread = self.threads.get(tid).ok_or(KernelError::UnknownThread)?;
        if thread.state != ThreadState::AwaitFaultReply {
            return Ok(false);
        }
        self.withdraw(tid);
        self.resume(tid, FaultResume::Cancelled);
        Ok(true)
    }

    // ---- scheduling ----

    /// Picks the thread to run on `cpu`; returns it and whether it changed.
    pub fn schedule(&mut self, cpu: CpuId) -> Result<(ThreadId, bool), KernelError> {
        let cpu = self.cpu_mut(cpu)?;
        cpu.preempt = false;
        Ok(cpu.sched.update_occupant())
    }

    pub fn yield_current(&mut self, cpu: CpuId) -> Result<(), KernelError> {
        self.cpu_mut(cpu)?.sched.yield_occupation();
        Ok(())
    }

    /// Timer tick: charges `ticks` to the occupant of `cpu`.
    pub fn tick(&mut self, cpu: CpuId, ticks: u32) -> Result<(), KernelError> {
        self.cpu_mut(cpu)?.sched.account(ticks);
        Ok(())
    }

    /// True if a wakeup since the last `schedule` outranks the occupant.
    pub fn needs_reschedule(&self, cpu: CpuId) -> bool {
        self.cpus.get(cpu.as_index()).is_some_and(|c| c.preempt)
    }

    pub fn occupant(&self, cpu: CpuId) -> Option<ThreadId> {
        self.cpus.get(cpu.as_index()).map(|c| c.sched.occupant())
    }

    pub fn ready_count(&self, cpu: CpuId) -> usize {
        self.cpus.get(cpu.as_index()).map_or(0, |c| c.sched.ready_count())
    }

    // ---- signals ----

    /// Creates a signal context for `receiver` and names it in `pd`.
    pub fn create_signal_context(
        &mut self,
        pd: PdId,
        receiver: ThreadId,
        imprint: usize,
    ) -> Result<CapSel, KernelError> {
        if !self.threads.contains(receiver) {
            return Err(KernelError::UnknownThread);
        }
        let pd = self.pds.get(pd).ok_or(KernelError::UnknownDomain)?;
        let ctx = self.signals.create_context(receiver, imprint);
        match pd.alloc_cap(ObjectRef::SignalContext(ctx)) {
            Ok(sel) => Ok(sel),
            Err(err) => {
                self.signals.dissolve(ctx);
                Err(err.into())
            }
        }
    }

    pub fn submit_signal(&mut self, pd: PdId, sel: CapSel, count: u32) -> Result<(), KernelError> {
        let pd = self.pds.get(pd).ok_or(KernelError::UnknownDomain)?;
        let Some(ObjectRef::SignalContext(ctx)) = pd.lookup(sel) else {
            return Err(KernelError::NotASignalContext);
        };
        Ok(self.signals.submit(ctx, count)?)
    }

    /// Revokes a general selector of `pd`, dissolving a signal context it named.
    pub fn revoke_cap(&mut self, pd: PdId, sel: CapSel) -> Result<Option<ObjectRef>, KernelError> {
        let pd = self.pds.get(pd).ok_or(KernelError::UnknownDomain)?;
        let object = pd.revoke_cap(sel);
        if let Some(ObjectRef::SignalContext(ctx)) = object {
            self.signals.dissolve(ctx);
        }
        Ok(object)
    }

    /// Delivers pending signals; see [`SignalBroker::deliver`].
    pub fn deliver_signals<F>(&mut self, f: F) -> usize
    where
        F: FnMut(&mut SignalBroker, Signal),
    {
        self.signals.deliver(f)
    }

    pub fn signals(&self) -> &SignalBroker {
        &self.signals
    }

    /// Makes the next mapping into `pd` fail after validation.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_map(&self, pd: PdId) -> Result<(), KernelError> {
        self.pds.get(pd).ok_or(KernelError::UnknownDomain)?.with_table(|t| t.deny_next_map());
        Ok(())
    }

    /// Queues a raw message at a pager, bypassing encoding.
    #[cfg(feature = "failpoints")]
    pub fn inject_message(&mut self, pager: ThreadId, raw: RawMessage) -> Result<(), KernelError> {
        self.ensure_not_idle(pager)?;
        if !self.threads.contains(pager) {
            return Err(KernelError::UnknownThread);
        }
        self.post_raw(pager, raw);
        Ok(())
    }

    // ---- pager entry points (called by the pager typestates) ----

    pub(crate) fn pager_receive(
        &mut self,
        pager: ThreadId,
    ) -> Result<Option<PagerMessage>, PagerError> {
        if self.is_idle(pager) {
            return Err(PagerError::IdlePager);
        }
        let thread = self.threads.get_mut(pager).ok_or(PagerError::UnknownPager)?;
        if thread.state != ThreadState::Ready {
            return Err(PagerError::NotRunning);
        }
        if thread.serving.is_some() {
            return Err(PagerError::AlreadyServing);
        }
        let Some(raw) = thread.inbox.pop_front() else {
            self.block(pager, ThreadState::AwaitPagerMessage);
            log::trace!(target: "pager", "{} parks", pager);
            return Ok(None);
        };
        match PagerMessage::decode(&raw) {
            Ok(msg) => {
                thread.serving = Some(msg);
                Ok(Some(msg))
            }
            Err(err) => {
                log::error!(target: "pager", "{} received bad message ({}); terminating", pager, err);
                self.kill_pager(pager);
                Err(err.into())
            }
        }
    }

    pub(crate) fn pager_is_parked(&self, pager: ThreadId) -> bool {
        self.threads.get(pager).is_some_and(|t| t.state == ThreadState::AwaitPagerMessage)
    }

    /// Applies the pager's answer to `dst`.
    ///
    /// A rejected mapping keeps both the destination blocked and the pager's
    /// message outstanding. An answer for a destination that is no longer
    /// blocked is dropped. A blocked destination must be the subject of the
    /// served message or a thread whose registered pager is `pager`.
    pub(crate) fn pager_answer(
        &mut self,
        pager: ThreadId,
        dst: ThreadId,
        answer: Answer,
    ) -> Result<(), PagerError> {
        let Some(serving) = self.threads.get(pager).ok_or(PagerError::UnknownPager)?.serving else {
            return Err(PagerError::NotServing);
        };
        if let Answer::Resolve(mapping) = answer {
            if !mapping.is_valid() {
                return Err(PagerError::InvalidMapping);
            }
        }
        let blocked = self.threads.get(dst).is_some_and(|t| t.state == ThreadState::AwaitFaultReply);
        if blocked && dst != serving.subject() && self.pager_of(dst).ok() != Some(pager) {
            log::warn!(target: "pager", "{}: answer for {} rejected; not its pager", pager, dst);
            return Err(PagerError::ForeignFaulter);
        }
        match answer {
            Answer::Defer => {}
            _ if !blocked => {
                log::debug!(target: "pager", "{}: stale answer for {} dropped", pager, dst);
            }
            Answer::Resolve(mapping) => {
                let pd = self.threads.get(dst).and_then(|t| t.binding()).map(|b| b.pd);
                let Some(pd) = pd.and_then(|id| self.pds.get(id)) else {
                    return Err(PagerError::InvalidMapping);
                };
                let platform = &self.platform;
                pd.with_table(|table| {
                    platform.map(
                        table,
                        mapping.phys,
                        mapping.virt,
                        mapping.page_count(),
                        mapping.page_flags(),
                    )
                })?;
                log::debug!(
                    target: "pager",
                    "{}: {} -> {} 2^{} for {}",
                    pager,
                    mapping.virt,
                    mapping.phys,
                    mapping.size_log2,
                    dst
                );
                self.resume(dst, FaultResume::Resolved);
            }
            Answer::Wake => self.resume(dst, FaultResume::Woken),
            Answer::Cancel => self.resume(dst, FaultResume::Cancelled),
            Answer::Stop => {
                if let Some(thread) = self.threads.get(dst) {
                    let mut dump = String::new();
                    let _ = fmt_trap(thread.frame(), &mut dump);
                    log::warn!(target: "kernel", "{} stopped by {}\n{}", dst, pager, dump);
                }
                self.quiesce(dst, ThreadState::Dead);
            }
        }
        if let Some(thread) = self.threads.get_mut(pager) {
            thread.serving = None;
        }
        Ok(())
    }

    // ---- internals ----

    fn cpu_mut(&mut self, cpu: CpuId) -> Result<&mut Cpu, KernelError> {
        self.cpus.get_mut(cpu.as_index()).ok_or(KernelError::InvalidCpu(cpu))
    }

    fn is_idle(&self, tid: ThreadId) -> bool {
        self.cpus.iter().any(|c| c.sched.idle() == tid)
    }

    fn ensure_not_idle(&self, tid: ThreadId) -> Result<(), KernelError> {
        if self.is_idle(tid) {
            return Err(KernelError::IdleThread);
        }
        Ok(())
    }

    fn ensure_running(&self, tid: ThreadId) -> Result<(), KernelError> {
        self.ensure_not_idle(tid)?;
        let thread = self.threads.get(tid).ok_or(KernelError::UnknownThread)?;
        if thread.state != ThreadState::Ready {
            return Err(KernelError::InvalidState(thread.state));
        }
        Ok(())
    }

    /// Resolves the live pager named by the thread's pager selector.
    fn pager_of(&self, tid: ThreadId) -> Result<ThreadId, KernelError> {
        let thread = self.threads.get(tid).ok_or(KernelError::UnknownThread)?;
        let binding = thread.binding().ok_or(KernelError::NotBound)?;
        let pd = self.pds.get(binding.pd).ok_or(KernelError::UnknownDomain)?;
        match pd.lookup(binding.pager) {
            Some(ObjectRef::Pager(pager))
                if self.threads.get(pager).is_some_and(|p| p.state != ThreadState::Dead) =>
            {
                Ok(pager)
            }
            _ => {
                log::warn!(target: "kernel", "{} has no live pager", tid);
                Err(KernelError::NoPager)
            }
        }
    }

    fn make_ready(&mut self, tid: ThreadId) {
        if self.is_idle(tid) {
            return;
        }
        let Some(thread) = self.threads.get_mut(tid) else {
            return;
        };
        thread.state = ThreadState::Ready;
        let Some(cpu) = self.cpus.get_mut(thread.cpu().as_index()) else {
            return;
        };
        if !thread.sched.is_enqueued() {
            cpu.preempt |= cpu.sched.insert_and_check(&mut thread.sched);
        }
    }

    fn block(&mut self, tid: ThreadId, state: ThreadState) {
        let Some(thread) = self.threads.get_mut(tid) else {
            return;
        };
        thread.state = state;
        if thread.sched.is_enqueued() {
            if let Some(cpu) = self.cpus.get_mut(thread.cpu().as_index()) {
                cpu.sched.remove(&mut thread.sched);
            }
        }
    }

    fn resume(&mut self, tid: ThreadId, outcome: FaultResume) {
        if let Some(thread) = self.threads.get_mut(tid) {
            thread.pending_fault = None;
            thread.resume = Some(outcome);
        }
        log::trace!(target: "kernel", "{} resumes {:?}", tid, outcome);
        self.make_ready(tid);
    }

    fn post(&mut self, pager: ThreadId, msg: PagerMessage) {
        self.post_raw(pager, msg.encode());
    }

    fn post_raw(&mut self, pager: ThreadId, raw: RawMessage) {
        let Some(thread) = self.threads.get_mut(pager) else {
            return;
        };
        thread.inbox.push_back(raw);
        if thread.state == ThreadState::AwaitPagerMessage {
            self.make_ready(pager);
        }
    }

    /// Drops every queued message about `tid`.
    fn withdraw(&mut self, tid: ThreadId) {
        for (_, thread) in self.threads.iter_mut() {
            thread.inbox.retain(|raw| raw.subject() != tid);
        }
    }

    /// Takes a thread off the CPU for good or until restarted.
    ///
    /// A pending fault of the thread is withdrawn; faulters whose messages
    /// the thread held as a pager are cancelled.
    fn quiesce(&mut self, tid: ThreadId, state: ThreadState) {
        let Some(thread) = self.threads.get(tid) else {
            return;
        };
        if thread.state == ThreadState::AwaitFaultReply {
            self.withdraw(tid);
        }
        self.block(tid, state);
        if let Some(thread) = self.threads.get_mut(tid) {
            thread.pending_fault = None;
            thread.resume = None;
        }
        self.cancel_orphans(tid);
    }

    fn kill_pager(&mut self, pager: ThreadId) {
        self.quiesce(pager, ThreadState::Dead);
    }

    fn cancel_orphans(&mut self, pager: ThreadId) {
        let Some(thread) = self.threads.get_mut(pager) else {
            return;
        };
        let inbox = core::mem::take(&mut thread.inbox);
        let serving = thread.serving.take();
        let subjects: Vec<ThreadId> = inbox
            .iter()
            .map(RawMessage::subject)
            .chain(serving.map(|msg| msg.subject()))
            .collect();
        for subject in subjects {
            let blocked = self
                .threads
                .get(subject)
                .is_some_and(|t| t.state == ThreadState::AwaitFaultReply);
            if blocked {
                log::debug!(target: "kernel", "{} orphaned by {}; cancelled", subject, pager);
                self.resume(subject, FaultResume::Cancelled);
            }
        }
    }
}

impl<P> Drop for Kernel<P> {
    /// Tears down every domain, the core domain last, so each one evicts its
    /// threads before its capability space and table go away.
    fn drop(&mut self) {
        let mut ids = self.pds.keys();
        ids.sort_by_key(|id| *id == self.core_pd);
        for id in ids {
            if let Some(pd) = self.pds.remove(id) {
                let leftovers = pd.destroy(&mut self.threads);
                log::trace!(target: "kernel", "shutdown {} caps={}", id, leftovers.len());
            }
        }
    }
}
