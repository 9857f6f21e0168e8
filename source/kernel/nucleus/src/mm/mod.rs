// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Translation primitives for Sv39-shaped address spaces.

pub mod translation_table;

#[cfg(test)]
mod tests;

use bitflags::bitflags;
use thiserror_no_std::Error;

pub use translation_table::{Translation, TranslationTable};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_LOG2: u8 = 12;
/// Largest leaf the table installs (one Sv39 gigapage).
pub const MAX_LEAF_LOG2: u8 = 30;
/// Width of the Sv39 virtual address space.
pub const VA_BITS: u32 = 39;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Flags stored in a leaf entry.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Device memory; mutually exclusive with `WRITE_COMBINED`.
        const UNCACHED = 1 << 8;
        const WRITE_COMBINED = 1 << 9;
    }
}

/// Error returned by mapping operations.
#[must_use = "map errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// Virtual or physical address is not aligned to the leaf size.
    #[error("address not aligned to the leaf size")]
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    #[error("mapping outside the canonical address range")]
    OutOfRange,
    /// Mapping violates the W^X policy.
    #[error("mapping violates W^X")]
    PermissionDenied,
    /// Mapping collides with an existing entry.
    #[error("mapping overlaps an existing entry")]
    Overlap,
    /// Flags do not describe a valid leaf entry.
    #[error("flags do not describe a valid leaf")]
    InvalidFlags,
    /// Leaf size is not a power of two the table supports.
    #[error("unsupported leaf size")]
    UnsupportedSize,
}

/// Returns true if `va` is canonical under Sv39 (bits 63..39 copy bit 38).
#[inline]
pub const fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> (VA_BITS - 1)) & 1;
    let upper = va >> VA_BITS;
    if sign == 0 {
        upper == 0
    } else {
        upper == (usize::MAX >> VA_BITS)
    }
}
