// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-domain locks (capability space, translation table)
//! OWNERS: @kernel-sync-team
//! PUBLIC API: DomainLock::new(), DomainLock::lock()
//! DEPENDS_ON: spin::Mutex, log (debug_lockdep)
//! INVARIANTS: Lock order is capability space before translation table;
//!             with `debug_lockdep` a double-lock panics instead of spinning forever

use core::ops::{Deref, DerefMut};
#[cfg(feature = "debug_lockdep")]
use core::sync::atomic::{AtomicBool, Ordering};

/// Spin lock guarding one piece of per-domain state.
pub struct DomainLock<T> {
    name: &'static str,
    inner: spin::Mutex<T>,
    #[cfg(feature = "debug_lockdep")]
    held: AtomicBool,
}

impl<T> DomainLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: spin::Mutex::new(value),
            #[cfg(feature = "debug_lockdep")]
            held: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock(&self) -> DomainLockGuard<'_, T> {
        #[cfg(feature = "debug_lockdep")]
        {
            if self.held.swap(true, Ordering::Acquire) {
                log::error!(target: "kernel", "LOCKDEP: double-lock of {}", self.name);
                panic!("lockdep: double-lock of {}", self.name);
            }
        }
        DomainLockGuard { parent: self, guard: self.inner.lock() }
    }

    /// Exclusive access without locking; the borrow checker proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct DomainLockGuard<'a, T> {
    #[cfg_attr(not(feature = "debug_lockdep"), allow(dead_code))]
    parent: &'a DomainLock<T>,
    guard: spin::MutexGuard<'a, T>,
}

impl<T> Deref for DomainLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for DomainLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(feature = "debug_lockdep")]
impl<T> Drop for DomainLockGuard<'_, T> {
    fn drop(&mut self) {
        self.parent.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::DomainLock;

    #[test]
    fn guard_gives_mutable_access() {
        let lock = DomainLock::new("test", 1u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 2);
        assert_eq!(lock.name(), "test");
    }
}
