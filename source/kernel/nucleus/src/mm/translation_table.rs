// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Software translation table with power-of-two leaves.
//!
//! Leaves are keyed by their virtual base. A leaf of `2^size_log2` bytes
//! must be aligned to its own size on both sides of the translation, the way
//! Sv39 megapages and gigapages are.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::{is_canonical_sv39, MapError, PageFlags, MAX_LEAF_LOG2, PAGE_SIZE_LOG2};
use crate::types::{PhysAddr, VirtAddr};

const LEAF_PERMS: PageFlags =
    PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Leaf {
    phys: usize,
    size_log2: u8,
    flags: PageFlags,
}

impl Leaf {
    fn end(&self, base: usize) -> usize {
        base + (1usize << self.size_log2)
    }
}

/// Result of translating one virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub phys: PhysAddr,
    pub flags: PageFlags,
    pub size_log2: u8,
}

#[derive(Debug, Default)]
pub struct TranslationTable {
    leaves: BTreeMap<usize, Leaf>,
    #[cfg(feature = "failpoints")]
    deny_next_map: bool,
}

impl TranslationTable {
    pub const fn new() -> Self {
        Self {
            leaves: BTreeMap::new(),
            #[cfg(feature = "failpoints")]
            deny_next_map: false,
        }
    }

    /// Installs one leaf of `2^size_log2` bytes.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        size_log2: u8,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !(PAGE_SIZE_LOG2..=MAX_LEAF_LOG2).contains(&size_log2) {
            return Err(MapError::UnsupportedSize);
        }
        if !virt.is_aligned(size_log2) || !phys.is_aligned(size_log2) {
            return Err(MapError::Unaligned);
        }
        let va = virt.raw();
        let len = 1usize << size_log2;
        let last = va.checked_add(len - 1).ok_or(MapError::OutOfRange)?;
        if !is_canonical_sv39(va) || !is_canonical_sv39(last) {
            return Err(MapError::OutOfRange);
        }
        if !flags.contains(PageFlags::VALID) || !flags.intersects(LEAF_PERMS) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::UNCACHED | PageFlags::WRITE_COMBINED) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITE | PageFlags::EXECUTE) {
            return Err(MapError::PermissionDenied);
        }
        if self.overlaps(va, last) {
            return Err(MapError::Overlap);
        }
        #[cfg(feature = "failpoints")]
        if core::mem::take(&mut self.deny_next_map) {
            return Err(MapError::PermissionDenied);
        }
        self.leaves.insert(va, Leaf { phys: phys.raw(), size_log2, flags });
        Ok(())
    }

    /// Removes every leaf whose base lies in `virt..virt + 2^size_log2`.
    ///
    /// Returns the number of leaves removed.
    pub fn unmap(&mut self, virt: VirtAddr, size_log2: u8) -> usize {
        self.unmap_range(virt, 1usize << size_log2.min(63))
    }

    /// Removes every leaf whose base lies in `virt..virt + len`.
    pub fn unmap_range(&mut self, virt: VirtAddr, len: usize) -> usize {
        let start = virt.raw();
        let end = start.saturating_add(len);
        let doomed: Vec<usize> = self.leaves.range(start..end).map(|(va, _)| *va).collect();
        for va in &doomed {
            self.leaves.remove(va);
        }
        doomed.len()
    }

    /// Translates any address inside an installed leaf.
    pub fn lookup(&self, virt: VirtAddr) -> Option<Translation> {
        let va = virt.raw();
        let (base, leaf) = self.leaves.range(..=va).next_back()?;
        if va >= leaf.end(*base) {
            return None;
        }
        Some(Translation {
            phys: PhysAddr::new(leaf.phys + (va - base)),
            flags: leaf.flags,
            size_log2: leaf.size_log2,
        })
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Makes the next `map` fail with `PermissionDenied` after validation.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_map(&mut self) {
        self.deny_next_map = true;
    }

    fn overlaps(&self, va: usize, last: usize) -> bool {
        if let Some((base, leaf)) = self.leaves.range(..=va).next_back() {
            if va < leaf.end(*base) {
                return true;
            }
        }
        self.leaves.range(va..=last).next().is_some()
    }
}
