// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Capability-id allocation and the per-domain capability space
//! OWNERS: @kernel-cap-team
//! PUBLIC API: CapIdAllocator, CapId, CapRange, CapSpace, CapIdError
//! DEPENDS_ON: cap::tree (identity references), types::CapSel
//! INVARIANTS: Id 0 is never handed out; an id is released exactly once;
//!             ids below the placement window only via explicit placement
//!
//! Ids are tracked in a bitmap (one bit per id) with a first-free hint. An
//! allocated id is represented by a [`CapId`] token which is neither `Clone`
//! nor `Copy`; the only way to release the id is to hand the token back to
//! [`CapIdAllocator::free`].

extern crate alloc;

pub mod tree;

#[cfg(test)]
mod tests_prop;

use alloc::vec;
use alloc::vec::Vec;
use thiserror_no_std::Error;

use crate::config::CAP_SEL_SPACE;
use crate::types::CapSel;

use self::tree::{IdentityRef, IdentityTree, ObjectRef};

const WORD_BITS: usize = u64::BITS as usize;

/// Errors reported by capability-id allocation.
#[must_use = "capability id errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapIdError {
    #[error("capability id space exhausted")]
    Exhausted,
    #[error("capability id {0} already allocated")]
    Occupied(CapSel),
    #[error("capability id range outside the id space")]
    OutOfRange,
    #[error("empty capability id range requested")]
    EmptyRange,
}

/// Ownership of exactly one allocated capability id.
#[must_use = "dropping a CapId leaks the id; free it or store it"]
#[derive(Debug, PartialEq, Eq)]
pub struct CapId(CapSel);

impl CapId {
    #[inline]
    pub fn sel(&self) -> CapSel {
        self.0
    }
}

/// Ownership of `len` consecutive capability ids starting at `base`.
#[must_use = "dropping a CapRange leaks its ids"]
#[derive(Debug, PartialEq, Eq)]
pub struct CapRange {
    base: CapSel,
    len: u16,
}

impl CapRange {
    pub fn base(&self) -> CapSel {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Splits the range into individually owned ids, lowest first.
    pub fn split(self) -> impl Iterator<Item = CapId> {
        let base = self.base.as_raw();
        (0..self.len).map(move |offset| CapId(CapSel::from_raw(base + offset)))
    }
}

/// Bitmap allocator over `1..capacity`.
pub struct CapIdAllocator {
    bitmap: Vec<u64>,
    capacity: usize,
    window: usize,
    /// No id in `window..hint` is free.
    hint: usize,
    used: usize,
}

impl CapIdAllocator {
    /// Creates an allocator for ids `1..capacity`; `alloc`/`alloc_range`
    /// search from `placement_window` upward.
    pub fn new(capacity: usize, placement_window: usize) -> Self {
        assert!(
            (2..=CAP_SEL_SPACE).contains(&capacity),
            "capability id capacity {} outside the selector space",
            capacity
        );
        let window = placement_window.clamp(1, capacity);
        let mut bitmap = vec![0u64; capacity.div_ceil(WORD_BITS)];
        // Id 0 is the invalid selector.
        bitmap[0] |= 1;
        Self { bitmap, capacity, window, hint: window, used: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn placement_window(&self) -> usize {
        self.window
    }

    /// Number of ids currently handed out.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_allocated(&self, sel: CapSel) -> bool {
        sel.is_valid() && sel.as_index() < self.capacity && self.is_set(sel.as_index())
    }

    /// Allocates the lowest free id above the placement window.
    pub fn alloc(&mut self) -> Result<CapId, CapIdError> {
        let range = self.alloc_range(1)?;
        Ok(CapId(range.base))
    }

    /// Allocates the lowest run of `count` free ids above the placement window.
    pub fn alloc_range(&mut self, count: usize) -> Result<CapRange, CapIdError> {
        if count == 0 {
            return Err(CapIdError::EmptyRange);
        }
        let base = self.find_run(count).ok_or_else(|| {
            log::warn!(target: "cap", "capability ids exhausted (used={} count={})", self.used, count);
            CapIdError::Exhausted
        })?;
        self.mark(base, count);
        if base == self.hint {
            self.hint = base + count;
        }
        Ok(CapRange { base: CapSel::from_raw(base as u16), len: count as u16 })
    }

    /// Allocates exactly `base..base + count`.
    pub fn alloc_at(&mut self, base: CapSel, count: usize) -> Result<CapRange, CapIdError> {
        if count == 0 {
            return Err(CapIdError::EmptyRange);
        }
        let start = base.as_index();
        if start == 0 || start + count > self.capacity {
            return Err(CapIdError::OutOfRange);
        }
        if let Some(taken) = (start..start + count).find(|&id| self.is_set(id)) {
            return Err(CapIdError::Occupied(CapSel::from_raw(taken as u16)));
        }
        self.mark(start, count);
        Ok(CapRange { base, len: count as u16 })
    }

    /// Releases one id.
    ///
    /// # Panics
    /// If the id is not allocated (double free).
    pub fn free(&mut self, cap: CapId) {
        self.release(cap.0.as_index());
    }

    pub fn free_range(&mut self, range: CapRange) {
        for cap in range.split() {
            self.free(cap);
        }
    }

    fn release(&mut self, id: usize) {
        assert!(id != 0 && id < self.capacity, "capability id {} outside allocator", id);
        assert!(self.is_set(id), "capability id {} freed twice", id);
        self.bitmap[id / WORD_BITS] &= !(1u64 << (id % WORD_BITS));
        self.used -= 1;
        if id >= self.window && id < self.hint {
            self.hint = id;
        }
    }

    #[inline]
    fn is_set(&self, id: usize) -> bool {
        self.bitmap[id / WORD_BITS] & (1u64 << (id % WORD_BITS)) != 0
    }

    fn mark(&mut self, base: usize, count: usize) {
        for id in base..base + count {
            self.bitmap[id / WORD_BITS] |= 1u64 << (id % WORD_BITS);
        }
        self.used += count;
    }

    fn find_free(&self, from: usize) -> Option<usize> {
        let mut word = from / WORD_BITS;
        let mut mask = !0u64 << (from % WORD_BITS);
        while word < self.bitmap.len() {
            let free = !self.bitmap[word] & mask;
            if free != 0 {
                let id = word * WORD_BITS + free.trailing_zeros() as usize;
                return (id < self.capacity).then_some(id);
            }
            mask = !0;
            word += 1;
        }
        None
    }

    fn find_run(&self, count: usize) -> Option<usize> {
        let mut from = self.hint.max(self.window);
        loop {
            let base = self.find_free(from)?;
            if base + count > self.capacity {
                return None;
            }
            match (base..base + count).find(|&id| self.is_set(id)) {
                None => return Some(base),
                Some(taken) => from = taken + 1,
            }
        }
    }
}

/// Id allocator plus identity tree of one protection domain.
///
/// Lives behind the domain's capability-space lock.
pub struct CapSpace {
    ids: CapIdAllocator,
    tree: IdentityTree,
}

impl CapSpace {
    pub fn new(capacity: usize, placement_window: usize) -> Self {
        Self { ids: CapIdAllocator::new(capacity, placement_window), tree: IdentityTree::new() }
    }

    pub fn ids(&self) -> &CapIdAllocator {
        &self.ids
    }

    pub fn tree(&self) -> &IdentityTree {
        &self.tree
    }

    /// Allocates a fresh selector naming `object`.
    pub fn create(&mut self, object: ObjectRef) -> Result<CapSel, CapIdError> {
        let cap = self.ids.alloc()?;
        let sel = cap.sel();
        self.insert(IdentityRef::new(cap, object));
        log::debug!(target: "cap", "create sel={} object={:?}", sel, object);
        Ok(sel)
    }

    /// Reserves `base..base + N` for explicit placement, one token per id.
    pub fn place<const N: usize>(&mut self, base: CapSel) -> Result<[CapId; N], CapIdError> {
        let CapRange { base, .. } = self.ids.alloc_at(base, N)?;
        let base = base.as_raw();
        Ok(core::array::from_fn(|offset| CapId(CapSel::from_raw(base + offset as u16))))
    }

    /// Adds a node whose id came from this space.
    ///
    /// # Panics
    /// If the selector is already present; ids are unique per allocator.
    pub fn insert(&mut self, node: IdentityRef) {
        if let Err(err) = self.tree.insert(node) {
            panic!("identity tree corrupted: {}", err);
        }
    }

    pub fn lookup(&self, sel: CapSel) -> Option<ObjectRef> {
        self.tree.lookup(sel)
    }

    /// Removes the node for `sel` and hands back its id token.
    pub fn detach(&mut self, sel: CapSel) -> Option<IdentityRef> {
        self.tree.remove(sel)
    }

    /// Removes the node for `sel` and frees its id.
    pub fn revoke(&mut self, sel: CapSel) -> Option<ObjectRef> {
        let (cap, object) = self.tree.remove(sel)?.into_parts();
        self.ids.free(cap);
        log::debug!(target: "cap", "revoke sel={} object={:?}", sel, object);
        Some(object)
    }

    pub fn release(&mut self, cap: CapId) {
        self.ids.free(cap);
    }

    pub fn release_range(&mut self, range: CapRange) {
        self.ids.free_range(range);
    }

    /// Removes every node, frees every id and returns the referenced objects.
    pub fn drain(&mut self) -> Vec<ObjectRef> {
        let nodes = self.tree.drain();
        let mut objects = Vec::with_capacity(nodes.len());
        for node in nodes {
            let (cap, object) = node.into_parts();
            self.ids.free(cap);
            objects.push(object);
        }
        objects
    }
}
