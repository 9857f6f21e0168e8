// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Unit tests for translation-table invariants
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; verify alignment, flags, W^X, overlap, range, lookup, unmap

use super::{MapError, PageFlags, TranslationTable, PAGE_SIZE};
use crate::types::{PhysAddr, VirtAddr};

const RO: PageFlags = PageFlags::VALID.union(PageFlags::READ).union(PageFlags::USER);

fn va(raw: usize) -> VirtAddr {
    VirtAddr::new(raw)
}

fn pa(raw: usize) -> PhysAddr {
    PhysAddr::new(raw)
}

#[test]
fn rejects_unaligned_addresses() {
    let mut table = TranslationTable::new();
    assert_eq!(table.map(va(1), pa(PAGE_SIZE), 12, RO), Err(MapError::Unaligned));
    assert_eq!(table.map(va(0), pa(1), 12, RO), Err(MapError::Unaligned));
    assert_eq!(table.map(va(0x1000), pa(0x20_0000), 21, RO), Err(MapError::Unaligned));
}

#[test]
fn rejects_invalid_flags_and_sizes() {
    let mut table = TranslationTable::new();
    assert_eq!(table.map(va(0), pa(0), 12, PageFlags::empty()), Err(MapError::InvalidFlags));
    assert_eq!(table.map(va(0), pa(0), 12, PageFlags::VALID), Err(MapError::InvalidFlags));
    assert_eq!(
        table.map(va(0), pa(0), 12, RO | PageFlags::UNCACHED | PageFlags::WRITE_COMBINED),
        Err(MapError::InvalidFlags)
    );
    assert_eq!(table.map(va(0), pa(0), 11, RO), Err(MapError::UnsupportedSize));
    assert_eq!(table.map(va(0), pa(0), 31, RO), Err(MapError::UnsupportedSize));
}

#[test]
fn enforces_w_xor_x() {
    let mut table = TranslationTable::new();
    let flags = PageFlags::VALID | PageFlags::WRITE | PageFlags::EXECUTE;
    assert_eq!(table.map(va(0), pa(0), 12, flags), Err(MapError::PermissionDenied));
}

#[test]
fn detects_overlap_with_larger_and_smaller_leaves() {
    let mut table = TranslationTable::new();
    table.map(va(0x20_0000), pa(0x40_0000), 21, RO).expect("megapage");
    assert_eq!(table.map(va(0x20_1000), pa(0), 12, RO), Err(MapError::Overlap));

    table.map(va(0x60_1000), pa(0x1000), 12, RO).expect("page");
    assert_eq!(table.map(va(0x60_0000), pa(0), 21, RO), Err(MapError::Overlap));
}

#[test]
fn out_of_range_rejected() {
    let mut table = TranslationTable::new();
    let high = 1usize << 50; // beyond canonical Sv39 range
    assert_eq!(table.map(va(high), pa(0), 12, RO), Err(MapError::OutOfRange));
}

#[test]
fn lookup_translates_inside_leaf() {
    let mut table = TranslationTable::new();
    table.map(va(0x20_0000), pa(0x80_0000), 21, RO).expect("megapage");
    let tr = table.lookup(va(0x20_1234)).expect("translated");
    assert_eq!(tr.phys, pa(0x80_1234));
    assert_eq!(tr.size_log2, 21);
    assert!(!tr.flags.contains(PageFlags::WRITE));
    assert!(table.lookup(va(0x40_0000)).is_none());
    assert!(table.lookup(va(0x1f_ffff)).is_none());
}

#[test]
fn unmap_removes_leaves_in_range() {
    let mut table = TranslationTable::new();
    for i in 0..4 {
        table.map(va(0x10_0000 + i * PAGE_SIZE), pa(i * PAGE_SIZE), 12, RO).expect("map");
    }
    assert_eq!(table.unmap(va(0x10_1000), 13), 2);
    assert_eq!(table.len(), 2);
    assert!(table.lookup(va(0x10_1000)).is_none());
    assert!(table.lookup(va(0x10_3000)).is_some());
}

#[cfg(feature = "failpoints")]
#[test]
fn failpoint_denies_exactly_one_map() {
    let mut table = TranslationTable::new();
    table.deny_next_map();
    assert_eq!(table.map(va(0x1000), pa(0x1000), 12, RO), Err(MapError::PermissionDenied));
    assert!(table.is_empty());
    table.map(va(0x1000), pa(0x1000), 12, RO).expect("second attempt succeeds");
}
