// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Protection domain: address space, capability space and thread slots
//! OWNERS: @kernel-team
//! PUBLIC API: Pd (admit/evict/assign_parent/alloc_cap/revoke_cap/lookup/destroy), PdId, ThreadBinding
//! DEPENDS_ON: cap::CapSpace, mm::TranslationTable, sync::DomainLock, thread::Thread
//! INVARIANTS: Slot i owns UTCB `base + i * slot_size` and selectors `cap_base + 3i ..+3`;
//!             every admitted thread is evicted before the table is released
//!
//! Capability-space edits happen under the capability lock, table edits under
//! the table lock. Neither lock is held while the other is taken.

extern crate alloc;

use alloc::vec::Vec;
use thiserror_no_std::Error;

use crate::cap::tree::{IdentityRef, ObjectRef};
use crate::cap::{CapId, CapIdError, CapSpace};
use crate::config::{KernelConfig, THREAD_CAP_STRIDE};
use crate::mm::{Translation, TranslationTable};
use crate::registry::{registry_handle, Registry};
use crate::sync::DomainLock;
use crate::thread::{Thread, ThreadId};
use crate::types::{CapSel, Slot, VirtAddr};

registry_handle!(
    /// Generational handle of a protection domain.
    PdId,
    "PD"
);

#[must_use = "domain errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PdError {
    #[error("no free thread slot")]
    NoFreeSlot,
    #[error("thread already bound to a domain")]
    AlreadyBound,
    #[error("thread not bound to this domain")]
    NotBound,
    #[error("pager selector {0} holds no id")]
    PagerSelector(CapSel),
    #[error("capability space: {0}")]
    Cap(CapIdError),
}

impl From<CapIdError> for PdError {
    fn from(err: CapIdError) -> Self {
        Self::Cap(err)
    }
}

/// Where a thread lives inside its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadBinding {
    pub pd: PdId,
    pub slot: Slot,
    pub utcb: VirtAddr,
    pub gate: CapSel,
    pub pager: CapSel,
    pub irq: CapSel,
}

#[derive(Debug)]
struct SlotEntry {
    thread: ThreadId,
    /// Id of the pager selector while no pager is registered.
    pager_cap: Option<CapId>,
    irq_cap: CapId,
}

pub struct Pd {
    id: PdId,
    is_core: bool,
    self_sel: CapSel,
    parent: Option<CapSel>,
    caps: DomainLock<CapSpace>,
    table: DomainLock<TranslationTable>,
    slots: Vec<Option<SlotEntry>>,
    utcb_area_base: usize,
    utcb_slot_size: usize,
    thread_cap_base: u16,
}

impl Pd {
    pub fn new(id: PdId, config: &KernelConfig, is_core: bool) -> Result<Self, PdError> {
        let mut caps = CapSpace::new(config.max_cap_ids, config.placement_window());
        let self_sel = caps.create(ObjectRef::Pd(id))?;
        let slot_count = if is_core { config.core_thread_max } else { config.thread_max };
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, || None);
        log::debug!(target: "pd", "create {} core={} slots={}", id, is_core, slot_count);
        Ok(Self {
            id,
            is_core,
            self_sel,
            parent: None,
            caps: DomainLock::new("pd.caps", caps),
            table: DomainLock::new("pd.table", TranslationTable::new()),
            slots,
            utcb_area_base: config.utcb_area_base,
            utcb_slot_size: config.utcb_slot_size,
            thread_cap_base: config.thread_cap_base,
        })
    }

    pub fn id(&self) -> PdId {
        self.id
    }

    pub fn is_core(&self) -> bool {
        self.is_core
    }

    /// Selector naming the domain inside its own capability space.
    pub fn self_sel(&self) -> CapSel {
        self.self_sel
    }

    pub fn parent(&self) -> Option<CapSel> {
        self.parent
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn admitted(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn admitted_threads(&self) -> Vec<ThreadId> {
        self.slots.iter().flatten().map(|entry| entry.thread).collect()
    }

    pub fn utcb_of(&self, slot: Slot) -> VirtAddr {
        VirtAddr::new(self.utcb_area_base + slot.as_index() * self.utcb_slot_size)
    }

    fn triple_base(&self, slot: Slot) -> CapSel {
        CapSel::from_raw(self.thread_cap_base + (slot.as_index() * THREAD_CAP_STRIDE) as u16)
    }

    /// Admits `thread` into the lowest free slot.
    ///
    /// On error nothing changes: no slot, selector or binding is taken.
    pub fn admit(&mut self, thread: &mut Thread) -> Result<ThreadBinding, PdError> {
        if thread.binding().is_some() {
            return Err(PdError::AlreadyBound);
        }
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            log::warn!(target: "pd", "{}: no free slot for {}", self.id, thread.id());
            return Err(PdError::NoFreeSlot);
        };
        let slot = Slot::from_raw(index as u16);
        let base = self.triple_base(slot);

        let mut caps = self.caps.lock();
        let [gate, pager, irq] = caps.place::<THREAD_CAP_STRIDE>(base)?;
        let binding = ThreadBinding {
            pd: self.id,
            slot,
            utcb: self.utcb_of(slot),
            gate: gate.sel(),
            pager: pager.sel(),
            irq: irq.sel(),
        };
        caps.insert(IdentityRef::new(gate, ObjectRef::Thread(thread.id())));
        drop(caps);

        self.slots[index] =
            Some(SlotEntry { thread: thread.id(), pager_cap: Some(pager), irq_cap: irq });
        thread.bind(binding);
        log::debug!(
            target: "pd",
            "{}: admit {} slot={} utcb={} gate={}",
            self.id,
            thread.id(),
            slot,
            binding.utcb,
            binding.gate
        );
        Ok(binding)
    }

    /// Registers `pager` behind the thread's pager selector.
    pub fn set_pager(&mut self, thread: &Thread, pager: ThreadId) -> Result<CapSel, PdError> {
        let binding = match thread.binding() {
            Some(b) if b.pd == self.id => *b,
            _ => return Err(PdError::NotBound),
        };
        let Some(entry) = self.slots[binding.slot.as_index()].as_mut() else {
            return Err(PdError::NotBound);
        };
        let mut caps = self.caps.lock();
        let cap = match entry.pager_cap.take() {
            Some(cap) => cap,
            None => match caps.detach(binding.pager) {
                Some(node) => node.into_parts().0,
                None => return Err(PdError::PagerSelector(binding.pager)),
            },
        };
        caps.insert(IdentityRef::new(cap, ObjectRef::Pager(pager)));
        log::debug!(target: "pd", "{}: pager of {} is {}", self.id, thread.id(), pager);
        Ok(binding.pager)
    }

    /// Removes `thread` from this domain. Idempotent.
    pub fn evict(&mut self, thread: &mut Thread) {
        let binding = match thread.binding() {
            Some(b) if b.pd == self.id => *b,
            _ => return,
        };
        if let Some(entry) = self.slots[binding.slot.as_index()].take() {
            self.release_slot(&binding, entry);
        }
        thread.unbind();
        log::debug!(target: "pd", "{}: evict {} slot={}", self.id, thread.id(), binding.slot);
    }

    fn release_slot(&self, binding: &ThreadBinding, entry: SlotEntry) {
        let mut caps = self.caps.lock();
        if let Some(node) = caps.detach(binding.gate) {
            caps.release(node.into_parts().0);
        }
        match entry.pager_cap {
            Some(cap) => caps.release(cap),
            None => {
                if let Some(node) = caps.detach(binding.pager) {
                    caps.release(node.into_parts().0);
                }
            }
        }
        caps.release(entry.irq_cap);
    }

    /// Records the parent capability once; later calls are ignored while a
    /// valid parent is set.
    pub fn assign_parent(&mut self, parent: CapSel) {
        if self.parent.is_some_and(CapSel::is_valid) {
            return;
        }
        self.parent = Some(parent);
    }

    /// Allocates a selector for `object` above the placement window.
    pub fn alloc_cap(&self, object: ObjectRef) -> Result<CapSel, PdError> {
        Ok(self.caps.lock().create(object)?)
    }

    /// Revokes a general selector; thread-area selectors belong to admission.
    pub fn revoke_cap(&self, sel: CapSel) -> Option<ObjectRef> {
        let mut caps = self.caps.lock();
        if sel.as_index() < caps.ids().placement_window() || sel == self.self_sel {
            return None;
        }
        caps.revoke(sel)
    }

    pub fn lookup(&self, sel: CapSel) -> Option<ObjectRef> {
        self.caps.lock().lookup(sel)
    }

    pub fn caps_used(&self) -> usize {
        self.caps.lock().ids().used()
    }

    /// Runs `f` on the translation table under the table lock.
    pub fn with_table<R>(&self, f: impl FnOnce(&mut TranslationTable) -> R) -> R {
        f(&mut self.table.lock())
    }

    pub fn translate(&self, virt: VirtAddr) -> Option<Translation> {
        self.table.lock().lookup(virt)
    }

    /// Tears the domain down: threads first, then ids, then memory.
    ///
    /// Returns the objects still named by the capability space so the caller
    /// can dissolve those it owns.
    pub fn destroy(mut self, threads: &mut Registry<ThreadId, Thread>) -> Vec<ObjectRef> {
        for index in 0..self.slots.len() {
            let Some(entry) = self.slots[index].take() else {
                continue;
            };
            match threads.get_mut(entry.thread) {
                Some(thread) => {
                    let binding = thread.unbind();
                    debug_assert!(binding.is_some_and(|b| b.pd == self.id));
                    let binding = binding.unwrap_or_else(|| self.synthetic_binding(index));
                    self.release_slot(&binding, entry);
                }
                None => {
                    let binding = self.synthetic_binding(index);
                    self.release_slot(&binding, entry);
                }
            }
        }
        let leftovers = self.caps.get_mut().drain();
        debug_assert_eq!(self.caps.get_mut().ids().used(), 0, "{}: leaked capability ids", self.id);
        let leaves = self.table.get_mut().len();
        log::debug!(
            target: "pd",
            "destroy {} caps={} leaves={}",
            self.id,
            leftovers.len(),
            leaves
        );
        leftovers
    }

    fn synthetic_binding(&self, index: usize) -> ThreadBinding {
        let slot = Slot::from_raw(index as u16);
        let base = self.triple_base(slot).as_raw();
        ThreadBinding {
            pd: self.id,
            slot,
            utcb: self.utcb_of(slot),
            gate: CapSel::from_raw(base),
            pager: CapSel::from_raw(base + 1),
            irq: CapSel::from_raw(base + 2),
        }
    }
}

impl Drop for Pd {
    fn drop(&mut self) {
        debug_assert!(
            self.slots.iter().all(Option::is_none),
            "{} dropped with admitted threads",
            self.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Priority;
    use crate::types::CpuId;

    fn small_config() -> KernelConfig {
        KernelConfig { thread_max: 4, core_thread_max: 2, max_cap_ids: 128, ..KernelConfig::default() }
    }

    fn fixture() -> (Registry<ThreadId, Thread>, Registry<PdId, ()>) {
        (Registry::new(), Registry::new())
    }

    fn spawn(threads: &mut Registry<ThreadId, Thread>, name: &str) -> ThreadId {
        threads.insert_with(|id| Thread::new(id, name, Priority::new(5), CpuId::BOOT))
    }

    #[test]
    fn admit_assigns_slot_utcb_and_triple() {
        let (mut threads, mut ids) = fixture();
        let cfg = small_config();
        let pd_id = ids.insert(());
        let mut pd = Pd::new(pd_id, &cfg, false).expect("pd");
        let a = spawn(&mut threads, "a");
        let b = spawn(&mut threads, "b");

        let ba = pd.admit(threads.get_mut(a).expect("a")).expect("admit a");
        let bb = pd.admit(threads.get_mut(b).expect("b")).expect("admit b");
        assert_eq!(ba.slot, Slot::from_raw(0));
        assert_eq!(bb.slot, Slot::from_raw(1));
        assert_eq!(bb.utcb.raw(), cfg.utcb_area_base + cfg.utcb_slot_size);
        assert_eq!(ba.gate.as_raw(), cfg.thread_cap_base);
        assert_eq!(bb.gate.as_raw(), cfg.thread_cap_base + 3);
        assert_eq!(pd.lookup(bb.gate), Some(ObjectRef::Thread(b)));

        pd.evict(threads.get_mut(a).expect("a"));
        pd.evict(threads.get_mut(b).expect("b"));
        assert_eq!(pd.admitted(), 0);
    }

    #[test]
    fn evict_is_idempotent_and_frees_slot() {
        let (mut threads, mut ids) = fixture();
        let cfg = small_config();
        let mut pd = Pd::new(ids.insert(()), &cfg, false).expect("pd");
        let a = spawn(&mut threads, "a");
        let used_before = pd.caps_used();
        let binding = pd.admit(threads.get_mut(a).expect("a")).expect("admit");
        assert_eq!(pd.caps_used(), used_before + 3);

        pd.evict(threads.get_mut(a).expect("a"));
        pd.evict(threads.get_mut(a).expect("a"));
        assert_eq!(pd.caps_used(), used_before);
        assert!(threads.get(a).expect("a").binding().is_none());
        assert_eq!(pd.lookup(binding.gate), None);

        let again = pd.admit(threads.get_mut(a).expect("a")).expect("readmit");
        assert_eq!(again.slot, binding.slot);
        pd.evict(threads.get_mut(a).expect("a"));
    }

    #[test]
    fn full_domain_rejects_without_side_effects() {
        let (mut threads, mut ids) = fixture();
        let cfg = small_config();
        let mut pd = Pd::new(ids.insert(()), &cfg, true).expect("pd");
        let tids: Vec<ThreadId> = (0..3).map(|_| spawn(&mut threads, "t")).collect();
        pd.admit(threads.get_mut(tids[0]).expect("t")).expect("admit");
        pd.admit(threads.get_mut(tids[1]).expect("t")).expect("admit");
        let used = pd.caps_used();
        assert_eq!(pd.admit(threads.get_mut(tids[2]).expect("t")), Err(PdError::NoFreeSlot));
        assert_eq!(pd.caps_used(), used);
        assert!(threads.get(tids[2]).expect("t").binding().is_none());
        let leftovers = pd.destroy(&mut threads);
        assert_eq!(leftovers, vec![ObjectRef::Pd(ids.keys()[0])]);
        assert!(threads.get(tids[0]).expect("t").binding().is_none());
    }

    #[test]
    fn set_pager_installs_and_replaces() {
        let (mut threads, mut ids) = fixture();
        let mut pd = Pd::new(ids.insert(()), &small_config(), false).expect("pd");
        let a = spawn(&mut threads, "a");
        let p1 = spawn(&mut threads, "p1");
        let p2 = spawn(&mut threads, "p2");
        pd.admit(threads.get_mut(a).expect("a")).expect("admit");
        let thread = threads.get(a).expect("a");
        let sel = pd.set_pager(thread, p1).expect("pager");
        assert_eq!(pd.lookup(sel), Some(ObjectRef::Pager(p1)));
        assert_eq!(pd.set_pager(thread, p2), Ok(sel));
        assert_eq!(pd.lookup(sel), Some(ObjectRef::Pager(p2)));
        let used = pd.caps_used();
        pd.evict(threads.get_mut(a).expect("a"));
        assert_eq!(pd.caps_used(), used - 3);
    }

    #[test]
    fn assign_parent_is_one_shot() {
        let (_, mut ids) = fixture();
        let mut pd = Pd::new(ids.insert(()), &small_config(), false).expect("pd");
        pd.assign_parent(CapSel::INVALID);
        pd.assign_parent(CapSel::from_raw(40));
        assert_eq!(pd.parent(), Some(CapSel::from_raw(40)));
        pd.assign_parent(CapSel::from_raw(41));
        assert_eq!(pd.parent(), Some(CapSel::from_raw(40)));
    }

    #[test]
    fn general_caps_live_above_window() {
        let (_, mut ids) = fixture();
        let cfg = small_config();
        let pd_id = ids.insert(());
        let pd = Pd::new(pd_id, &cfg, false).expect("pd");
        let sel = pd.alloc_cap(ObjectRef::Pd(pd_id)).expect("cap");
        assert!(sel.as_index() >= cfg.placement_window());
        assert_eq!(pd.revoke_cap(CapSel::from_raw(cfg.thread_cap_base)), None);
        assert_eq!(pd.revoke_cap(pd.self_sel()), None);
        assert_eq!(pd.revoke_cap(sel), Some(ObjectRef::Pd(pd_id)));
    }
}
