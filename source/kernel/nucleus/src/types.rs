// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the capability, scheduling and pager layers
//! OWNERS: @kernel-team
//! PUBLIC API: CpuId, CapSel, Slot, VirtAddr, PhysAddr
//! INVARIANTS: CapSel 0 is never a valid selector; addresses carry no implied alignment
//!
//! Newtypes keep CPU indices, capability selectors and thread slots from being
//! mixed up at call sites. All of them are `repr(transparent)` and free at runtime.

use core::fmt;

/// Logical CPU identifier used to route work to a per-CPU scheduler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_boot(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Capability selector: the integer a domain uses to name a kernel object.
///
/// **Ownership**: selectors are plain values; the id behind a live selector is
/// owned by a [`crate::cap::CapId`] token.
/// **Invariant**: selector 0 is reserved and never names an object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CapSel(u16);

impl CapSel {
    /// The reserved, never-valid selector.
    pub const INVALID: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for CapSel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Thread slot index inside a protection domain.
///
/// Stable for as long as the thread stays admitted; determines the UTCB address
/// and the selector triple of the thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Slot(u16);

impl Slot {
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_aligned(self, size_log2: u8) -> bool {
        is_aligned(self.0, size_log2)
    }

    #[inline]
    pub const fn align_down(self, size_log2: u8) -> Self {
        Self(self.0 & !((1usize << size_log2) - 1))
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<Self> {
        self.0.checked_add(v).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_aligned(self, size_log2: u8) -> bool {
        is_aligned(self.0, size_log2)
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<Self> {
        self.0.checked_add(v).map(Self)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[inline]
const fn is_aligned(addr: usize, size_log2: u8) -> bool {
    if size_log2 as u32 >= usize::BITS {
        return addr == 0;
    }
    addr & ((1usize << size_log2) - 1) == 0
}

// ---- conversions ----

impl From<u16> for CapSel {
    #[inline]
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl From<CapSel> for u16 {
    #[inline]
    fn from(sel: CapSel) -> Self {
        sel.0
    }
}

impl From<CapSel> for usize {
    #[inline]
    fn from(sel: CapSel) -> Self {
        sel.as_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_selector_is_zero() {
        assert!(!CapSel::INVALID.is_valid());
        assert!(CapSel::from_raw(1).is_valid());
    }

    #[test]
    fn alignment_helpers() {
        assert!(VirtAddr::new(0x2000).is_aligned(12));
        assert!(!VirtAddr::new(0x2010).is_aligned(12));
        assert_eq!(VirtAddr::new(0x2fff).align_down(12), VirtAddr::new(0x2000));
        assert!(PhysAddr::new(0x20_0000).is_aligned(21));
        assert!(!PhysAddr::new(0x1000).is_aligned(21));
    }
}
