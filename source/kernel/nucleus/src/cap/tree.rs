// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Identity-reference tree: selector to kernel object, per domain
//! OWNERS: @kernel-cap-team
//! PUBLIC API: IdentityTree, IdentityRef, ObjectRef, TreeError
//! DEPENDS_ON: cap::CapId, registry handles
//! INVARIANTS: Keys are unique; lookups never mutate; removal hands the id token back
//!
//! Nodes reference objects through generational handles, so a node that
//! outlives its object resolves to nothing instead of dangling.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use thiserror_no_std::Error;

use super::CapId;
use crate::pd::PdId;
use crate::signal::SignalContextId;
use crate::thread::ThreadId;
use crate::types::CapSel;

/// Weak back-reference from a tree node to the object it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRef {
    /// A thread's gate: names the thread itself.
    Thread(ThreadId),
    /// A protection domain.
    Pd(PdId),
    /// A signal context owned by the signal broker.
    SignalContext(SignalContextId),
    /// A pager registered for a faulting thread.
    Pager(ThreadId),
}

/// One tree node: an owned capability id plus the object it names.
#[derive(Debug, PartialEq, Eq)]
pub struct IdentityRef {
    cap: CapId,
    object: ObjectRef,
}

impl IdentityRef {
    pub fn new(cap: CapId, object: ObjectRef) -> Self {
        Self { cap, object }
    }

    pub fn sel(&self) -> CapSel {
        self.cap.sel()
    }

    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn into_parts(self) -> (CapId, ObjectRef) {
        (self.cap, self.object)
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum TreeError {
    /// The rejected node is handed back so its id can be released.
    #[error("selector {} already present", .0.sel())]
    Occupied(IdentityRef),
}

impl TreeError {
    pub fn into_node(self) -> IdentityRef {
        match self {
            Self::Occupied(node) => node,
        }
    }
}

#[derive(Debug, Default)]
pub struct IdentityTree {
    nodes: BTreeMap<CapSel, IdentityRef>,
}

impl IdentityTree {
    pub const fn new() -> Self {
        Self { nodes: BTreeMap::new() }
    }

    pub fn insert(&mut self, node: IdentityRef) -> Result<(), TreeError> {
        let sel = node.sel();
        if self.nodes.contains_key(&sel) {
            return Err(TreeError::Occupied(node));
        }
        self.nodes.insert(sel, node);
        Ok(())
    }

    pub fn lookup(&self, sel: CapSel) -> Option<ObjectRef> {
        self.nodes.get(&sel).map(IdentityRef::object)
    }

    pub fn remove(&mut self, sel: CapSel) -> Option<IdentityRef> {
        self.nodes.remove(&sel)
    }

    /// Removes every node in selector order.
    pub fn drain(&mut self) -> Vec<IdentityRef> {
        core::mem::take(&mut self.nodes).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn selectors(&self) -> impl Iterator<Item = CapSel> + '_ {
        self.nodes.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::CapIdAllocator;
    use crate::registry::{Handle, Key};

    fn thread(raw: u64) -> ThreadId {
        ThreadId::from_key(Key::from_raw(raw))
    }

    #[test]
    fn insert_lookup_remove() {
        let mut ids = CapIdAllocator::new(64, 1);
        let mut tree = IdentityTree::new();
        let cap = ids.alloc().expect("alloc");
        let sel = cap.sel();
        tree.insert(IdentityRef::new(cap, ObjectRef::Thread(thread(3)))).expect("insert");
        assert_eq!(tree.lookup(sel), Some(ObjectRef::Thread(thread(3))));
        assert_eq!(tree.lookup(CapSel::from_raw(sel.as_raw() + 1)), None);

        let node = tree.remove(sel).expect("present");
        assert_eq!(node.object(), ObjectRef::Thread(thread(3)));
        assert!(tree.remove(sel).is_none());
        let (cap, _) = node.into_parts();
        ids.free(cap);
    }

    #[test]
    fn duplicate_key_hands_node_back() {
        let mut ids = CapIdAllocator::new(64, 1);
        let mut tree = IdentityTree::new();
        let first = ids.alloc().expect("alloc");
        let sel = first.sel();
        tree.insert(IdentityRef::new(first, ObjectRef::Pager(thread(1)))).expect("insert");

        // Forge a colliding node from a second allocator's id for the test.
        let mut other = CapIdAllocator::new(64, 1);
        let clash = other.alloc().expect("alloc");
        assert_eq!(clash.sel(), sel);
        let err = tree.insert(IdentityRef::new(clash, ObjectRef::Pager(thread(2)))).unwrap_err();
        let (clash, object) = err.into_node().into_parts();
        assert_eq!(object, ObjectRef::Pager(thread(2)));
        other.free(clash);
        assert_eq!(tree.lookup(sel), Some(ObjectRef::Pager(thread(1))));
    }

    #[test]
    fn drain_is_in_key_order() {
        let mut ids = CapIdAllocator::new(64, 1);
        let mut tree = IdentityTree::new();
        let caps: Vec<CapId> = (0..4).map(|_| ids.alloc().expect("alloc")).collect();
        for cap in caps.into_iter().rev() {
            tree.insert(IdentityRef::new(cap, ObjectRef::Thread(thread(0)))).expect("insert");
        }
        let sels: Vec<u16> = tree.drain().into_iter().map(|n| n.sel().as_raw()).collect();
        assert_eq!(sels, vec![1, 2, 3, 4]);
        assert!(tree.is_empty());
    }
}
