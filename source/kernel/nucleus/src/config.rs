// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Compile-time defaults and the validated boot configuration
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig, ConfigError, default constants
//! INVARIANTS: A `KernelConfig` handed to `Kernel::new` has passed `validate()`
//!
//! The selector space below `placement_window()` is reserved for the per-slot
//! thread capability triples; general allocation starts at the window.

use thiserror_no_std::Error;

use crate::mm::{PAGE_SIZE, PAGE_SIZE_LOG2};

/// Upper bound on CPUs the kernel manages.
pub const MAX_CPUS: usize = 8;
/// Thread slots in an ordinary protection domain.
pub const THREAD_MAX: usize = 64;
/// Thread slots in the core domain.
pub const CORE_THREAD_MAX: usize = 16;
/// Size of the selector space (`CapSel` is 16 bits wide).
pub const CAP_SEL_SPACE: usize = 1 << 16;
/// Capability ids per domain.
pub const MAX_CAP_IDS: usize = 4096;
/// First selector of the thread capability area.
pub const THREAD_CAP_BASE: u16 = 16;
/// Selectors per thread slot: gate, pager, irq.
pub const THREAD_CAP_STRIDE: usize = 3;
/// Default placement window: thread area for `THREAD_MAX` slots.
pub const CAP_PLACEMENT_WINDOW: usize = THREAD_CAP_BASE as usize + THREAD_MAX * THREAD_CAP_STRIDE;
/// Base of the per-domain UTCB area.
pub const UTCB_AREA_BASE: usize = 0x3f_0000_0000;
/// Bytes per UTCB slot.
pub const UTCB_SLOT_SIZE: usize = PAGE_SIZE;
/// Ticks per scheduling slice.
pub const DEFAULT_TIMESLICE_TICKS: u32 = 10;

#[must_use = "configuration errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cpu count {0} outside the supported range")]
    CpuCount(usize),
    #[error("thread_max must be non-zero")]
    NoThreadSlots,
    #[error("core_thread_max {core} exceeds thread_max {max}")]
    CoreSlotsExceedMax { core: usize, max: usize },
    #[error("capability id count {0} outside the selector space")]
    CapIdCount(usize),
    #[error("thread capability area does not fit below the id limit")]
    ThreadAreaTooLarge,
    #[error("thread capability base must be non-zero")]
    ThreadCapBaseZero,
    #[error("UTCB slot size {0:#x} is not a non-zero page multiple")]
    UtcbSlotSize(usize),
    #[error("UTCB area base {0:#x} is not page aligned or overflows")]
    UtcbArea(usize),
    #[error("timeslice must be non-zero")]
    Timeslice,
}

/// Boot configuration handed to [`crate::Kernel::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub cpus: usize,
    pub thread_max: usize,
    pub core_thread_max: usize,
    pub max_cap_ids: usize,
    pub thread_cap_base: u16,
    pub utcb_area_base: usize,
    pub utcb_slot_size: usize,
    pub timeslice_ticks: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            thread_max: THREAD_MAX,
            core_thread_max: CORE_THREAD_MAX,
            max_cap_ids: MAX_CAP_IDS,
            thread_cap_base: THREAD_CAP_BASE,
            utcb_area_base: UTCB_AREA_BASE,
            utcb_slot_size: UTCB_SLOT_SIZE,
            timeslice_ticks: DEFAULT_TIMESLICE_TICKS,
        }
    }
}

impl KernelConfig {
    /// First id reachable by dynamic allocation; saturates for absurd slot counts.
    pub const fn placement_window(&self) -> usize {
        (self.thread_max.saturating_mul(THREAD_CAP_STRIDE)).saturating_add(self.thread_cap_base as usize)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(ConfigError::CpuCount(self.cpus));
        }
        if self.thread_max == 0 {
            return Err(ConfigError::NoThreadSlots);
        }
        if self.core_thread_max == 0 || self.core_thread_max > self.thread_max {
            return Err(ConfigError::CoreSlotsExceedMax {
                core: self.core_thread_max,
                max: self.thread_max,
            });
        }
        if self.max_cap_ids < 2 || self.max_cap_ids > CAP_SEL_SPACE {
            return Err(ConfigError::CapIdCount(self.max_cap_ids));
        }
        if self.thread_cap_base == 0 {
            return Err(ConfigError::ThreadCapBaseZero);
        }
        // One id above the window must stay free for the domain's own identity.
        if self.placement_window() >= self.max_cap_ids {
            return Err(ConfigError::ThreadAreaTooLarge);
        }
        if self.utcb_slot_size == 0 || self.utcb_slot_size % PAGE_SIZE != 0 {
            return Err(ConfigError::UtcbSlotSize(self.utcb_slot_size));
        }
        let area = self
            .utcb_slot_size
            .checked_mul(self.thread_max)
            .and_then(|len| self.utcb_area_base.checked_add(len));
        if self.utcb_area_base & ((1 << PAGE_SIZE_LOG2) - 1) != 0 || area.is_none() {
            return Err(ConfigError::UtcbArea(self.utcb_area_base));
        }
        if self.timeslice_ticks == 0 {
            return Err(ConfigError::Timeslice);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
        assert_eq!(KernelConfig::default().placement_window(), CAP_PLACEMENT_WINDOW);
    }

    #[test]
    fn rejects_inconsistent_values() {
        let cfg = KernelConfig { cpus: 0, ..KernelConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::CpuCount(0)));

        let cfg = KernelConfig { core_thread_max: THREAD_MAX + 1, ..KernelConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::CoreSlotsExceedMax { .. })));

        let cfg = KernelConfig { max_cap_ids: CAP_PLACEMENT_WINDOW, ..KernelConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::ThreadAreaTooLarge));

        let cfg = KernelConfig {
            thread_max: usize::MAX,
            core_thread_max: 1,
            ..KernelConfig::default()
        };
        assert_eq!(cfg.placement_window(), usize::MAX);
        assert_eq!(cfg.validate(), Err(ConfigError::ThreadAreaTooLarge));

        let cfg = KernelConfig { utcb_slot_size: 100, ..KernelConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::UtcbSlotSize(100)));

        let cfg = KernelConfig { utcb_area_base: 0x1234, ..KernelConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::UtcbArea(0x1234)));
    }
}
