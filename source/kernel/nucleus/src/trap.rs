// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//! Saved register state of a trapped thread and RISC-V cause decoding.

use core::fmt::{self, Write};

pub const INTERRUPT_FLAG: usize = 1 << (usize::BITS - 1);

/// Exception codes the pager path cares about.
pub const CAUSE_ILLEGAL_INSTRUCTION: usize = 2;
pub const CAUSE_BREAKPOINT: usize = 3;
pub const CAUSE_INSTRUCTION_PAGE_FAULT: usize = 12;
pub const CAUSE_LOAD_PAGE_FAULT: usize = 13;
pub const CAUSE_STORE_PAGE_FAULT: usize = 15;

/// Register state saved when a thread leaves user mode.
/// Must match the save/restore layout of the trap vector.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// General-purpose registers; `x[0]` stays zero.
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

impl TrapFrame {
    /// Frame of a thread that trapped with `scause` at `sepc` touching `stval`.
    pub fn with_cause(scause: usize, stval: usize, sepc: usize) -> Self {
        Self { sepc, scause, stval, ..Self::default() }
    }

    /// Fills the cause registers from the live CSRs of the current hart.
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    pub fn capture_cause(&mut self) {
        self.scause = riscv::register::scause::read().bits();
        self.stval = riscv::register::stval::read();
        self.sepc = riscv::register::sepc::read();
    }

    #[inline]
    pub fn ip(&self) -> usize {
        self.sepc
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.x[2]
    }

    /// Resets the frame for a fresh start at `ip` with stack `sp`.
    pub fn start_at(&mut self, ip: usize, sp: usize) {
        *self = Self::default();
        self.sepc = ip;
        self.x[2] = sp;
    }

    #[inline]
    pub fn exception_code(&self) -> usize {
        self.scause & !INTERRUPT_FLAG
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TrapFrame {{ ip: {:#x}, cause: {}, tval: {:#x}, .. }}",
            self.sepc,
            describe_cause(self.scause),
            self.stval
        )
    }
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

/// Human-readable name of a trap cause, for logs.
pub fn describe_cause(scause: usize) -> &'static str {
    if is_interrupt(scause) {
        return "interrupt";
    }
    match scause {
        CAUSE_ILLEGAL_INSTRUCTION => "illegal-instruction",
        CAUSE_BREAKPOINT => "breakpoint",
        CAUSE_INSTRUCTION_PAGE_FAULT => "fetch-page-fault",
        CAUSE_LOAD_PAGE_FAULT => "load-page-fault",
        CAUSE_STORE_PAGE_FAULT => "store-page-fault",
        _ => "exception",
    }
}

/// Multi-line dump of the state a pager saw when it stopped a thread.
pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, "  cause {:#x} ({})", frame.scause, describe_cause(frame.scause))?;
    writeln!(f, "  ip {:#018x}  tval {:#018x}", frame.sepc, frame.stval)?;
    writeln!(f, "  sp {:#018x}  ra   {:#018x}", frame.x[2], frame.x[1])?;
    write!(f, "  args {:x?}", &frame.x[10..=17])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_names() {
        assert_eq!(describe_cause(CAUSE_LOAD_PAGE_FAULT), "load-page-fault");
        assert_eq!(describe_cause(INTERRUPT_FLAG | 5), "interrupt");
        assert_eq!(describe_cause(8), "exception");
        assert!(!is_interrupt(CAUSE_STORE_PAGE_FAULT));
    }

    #[test]
    fn start_at_resets_state() {
        let mut frame = TrapFrame::with_cause(CAUSE_LOAD_PAGE_FAULT, 0x2000, 0x1000);
        frame.x[10] = 7;
        frame.start_at(0x4000, 0x8000);
        assert_eq!(frame.ip(), 0x4000);
        assert_eq!(frame.sp(), 0x8000);
        assert_eq!(frame.x[10], 0);
        assert_eq!(frame.scause, 0);
    }

    #[test]
    fn fmt_trap_names_cause() {
        let frame = TrapFrame::with_cause(CAUSE_INSTRUCTION_PAGE_FAULT, 0x10, 0x10);
        let mut out = String::new();
        fmt_trap(&frame, &mut out).expect("format");
        assert!(out.contains("fetch-page-fault"));
        assert_eq!(out.lines().count(), 4);
    }
}
