// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Platform collaborator: fault-register decoding and translation edits
//! OWNERS: @kernel-arch-team
//! PUBLIC API: Platform, FaultDecoder, SoftMmu, Sv39Decoder, StatusWordDecoder, DecodeError
//! DEPENDS_ON: mm::TranslationTable, trap::TrapFrame, riscv (OS target)
//! INVARIANTS: `map` installs all pages or none
//!
//! The kernel core never interprets raw fault registers itself; it asks the
//! platform for a [`Pagefault`] and hands mapping requests back to it.

use thiserror_no_std::Error;

use crate::mm::{MapError, PageFlags, TranslationTable, PAGE_SIZE, PAGE_SIZE_LOG2};
use crate::pager::{FaultAccess, Pagefault};
use crate::thread::ThreadId;
use crate::trap::{
    TrapFrame, CAUSE_INSTRUCTION_PAGE_FAULT, CAUSE_LOAD_PAGE_FAULT, CAUSE_STORE_PAGE_FAULT,
};
use crate::types::{PhysAddr, VirtAddr};

#[must_use = "decode errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("trap cause {0:#x} is not a page fault")]
    NotAPageFault(usize),
}

/// Turns saved fault registers into a [`Pagefault`].
pub trait FaultDecoder {
    fn decode(&self, thread: ThreadId, frame: &TrapFrame) -> Result<Pagefault, DecodeError>;
}

pub trait Platform {
    /// Reads the fault record of a thread that just trapped.
    fn read_fault_registers(
        &self,
        thread: ThreadId,
        frame: &TrapFrame,
    ) -> Result<Pagefault, DecodeError>;

    /// Maps `page_count` pages of `phys` at `virt`.
    fn map(
        &self,
        table: &mut TranslationTable,
        phys: PhysAddr,
        virt: VirtAddr,
        page_count: usize,
        flags: PageFlags,
    ) -> Result<(), MapError>;

    fn unmap(&self, table: &mut TranslationTable, virt: VirtAddr, page_count: usize);
}

/// RISC-V Sv39: the access kind is encoded in `scause`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sv39Decoder;

impl FaultDecoder for Sv39Decoder {
    fn decode(&self, thread: ThreadId, frame: &TrapFrame) -> Result<Pagefault, DecodeError> {
        let access = match frame.scause {
            CAUSE_INSTRUCTION_PAGE_FAULT => FaultAccess::Execute,
            CAUSE_LOAD_PAGE_FAULT => FaultAccess::Read,
            CAUSE_STORE_PAGE_FAULT => FaultAccess::Write,
            other => return Err(DecodeError::NotAPageFault(other)),
        };
        Ok(Pagefault {
            faulter: thread,
            addr: VirtAddr::new(frame.stval),
            ip: VirtAddr::new(frame.sepc),
            access,
        })
    }
}

/// Platforms that report faults through a status word with protection bits.
///
/// The status word is read from `scause`, the address from `stval`. When the
/// status word carries no execute bit, a fault whose address equals the
/// instruction pointer is classified as an execute fault. That is a heuristic:
/// a data access to the faulting instruction's own address is misclassified.
#[derive(Debug, Clone, Copy)]
pub struct StatusWordDecoder {
    /// Bit set for faults the status word reports.
    pub fault_bit: u32,
    pub write_bit: u32,
    pub exec_bit: Option<u32>,
}

impl FaultDecoder for StatusWordDecoder {
    fn decode(&self, thread: ThreadId, frame: &TrapFrame) -> Result<Pagefault, DecodeError> {
        let status = frame.scause;
        let bit = |b: u32| status & (1usize << b) != 0;
        if !bit(self.fault_bit) {
            return Err(DecodeError::NotAPageFault(status));
        }
        let exec = match self.exec_bit {
            Some(b) => bit(b),
            None => frame.stval == frame.sepc,
        };
        let access = if exec {
            FaultAccess::Execute
        } else if bit(self.write_bit) {
            FaultAccess::Write
        } else {
            FaultAccess::Read
        };
        Ok(Pagefault {
            faulter: thread,
            addr: VirtAddr::new(frame.stval),
            ip: VirtAddr::new(frame.sepc),
            access,
        })
    }
}

/// Software MMU over [`TranslationTable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftMmu<D> {
    decoder: D,
}

impl<D: FaultDecoder> SoftMmu<D> {
    pub const fn new(decoder: D) -> Self {
        Self { decoder }
    }
}

impl<D: FaultDecoder> Platform for SoftMmu<D> {
    fn read_fault_registers(
        &self,
        thread: ThreadId,
        frame: &TrapFrame,
    ) -> Result<Pagefault, DecodeError> {
        self.decoder.decode(thread, frame)
    }

    fn map(
        &self,
        table: &mut TranslationTable,
        phys: PhysAddr,
        virt: VirtAddr,
        page_count: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if page_count == 0 {
            return Err(MapError::UnsupportedSize);
        }
        // One leaf when the run is a naturally aligned power of two.
        if page_count.is_power_of_two() {
            let size_log2 = PAGE_SIZE_LOG2 + page_count.trailing_zeros() as u8;
            if virt.is_aligned(size_log2) && phys.is_aligned(size_log2) {
                return table.map(virt, phys, size_log2, flags);
            }
        }
        for i in 0..page_count {
            let offset = i * PAGE_SIZE;
            let result = match (virt.checked_add(offset), phys.checked_add(offset)) {
                (Some(v), Some(p)) => table.map(v, p, PAGE_SIZE_LOG2, flags),
                _ => Err(MapError::OutOfRange),
            };
            if let Err(err) = result {
                table.unmap_range(virt, offset);
                return Err(err);
            }
        }
        Ok(())
    }

    fn unmap(&self, table: &mut TranslationTable, virt: VirtAddr, page_count: usize) {
        table.unmap_range(virt, page_count.saturating_mul(PAGE_SIZE));
    }
}
