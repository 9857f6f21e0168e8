// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Signal broker: counting notifications keyed by context
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: SignalBroker (create_context/submit/dissolve/deliver), SignalContextId, Signal
//! DEPENDS_ON: registry::Registry
//! INVARIANTS: A dissolved context never receives or delivers a signal

use thiserror_no_std::Error;

use crate::registry::{registry_handle, Registry};
use crate::thread::ThreadId;

registry_handle!(
    /// Generational handle of a signal context.
    SignalContextId,
    "SC"
);

#[must_use = "signal errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("signal context does not exist")]
    UnknownContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalContext {
    pub receiver: ThreadId,
    /// Value handed back with every delivery so the receiver can tell contexts apart.
    pub imprint: usize,
    pending: u32,
}

impl SignalContext {
    pub fn pending(&self) -> u32 {
        self.pending
    }
}

/// One delivered batch of submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub context: SignalContextId,
    pub receiver: ThreadId,
    pub imprint: usize,
    pub count: u32,
}

#[derive(Default)]
pub struct SignalBroker {
    contexts: Registry<SignalContextId, SignalContext>,
}

impl SignalBroker {
    pub const fn new() -> Self {
        Self { contexts: Registry::new() }
    }

    pub fn create_context(&mut self, receiver: ThreadId, imprint: usize) -> SignalContextId {
        let id = self.contexts.insert(SignalContext { receiver, imprint, pending: 0 });
        log::debug!(target: "signal", "create {} receiver={} imprint={:#x}", id, receiver, imprint);
        id
    }

    pub fn context(&self, id: SignalContextId) -> Option<&SignalContext> {
        self.contexts.get(id)
    }

    /// Adds `count` submissions to the context; saturates.
    pub fn submit(&mut self, id: SignalContextId, count: u32) -> Result<(), SignalError> {
        let ctx = self.contexts.get_mut(id).ok_or(SignalError::UnknownContext)?;
        ctx.pending = ctx.pending.saturating_add(count);
        Ok(())
    }

    pub fn dissolve(&mut self, id: SignalContextId) -> Option<SignalContext> {
        let ctx = self.contexts.remove(id);
        if ctx.is_some() {
            log::debug!(target: "signal", "dissolve {}", id);
        }
        ctx
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Delivers every pending context once, in creation-slot order.
    ///
    /// The callback may dissolve any context, the one being delivered
    /// included; dissolved contexts are skipped. Returns the number of
    /// signals delivered.
    pub fn deliver<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&mut Self, Signal),
    {
        let mut delivered = 0;
        for id in self.contexts.keys() {
            let Some(ctx) = self.contexts.get_mut(id) else {
                continue;
            };
            if ctx.pending == 0 {
                continue;
            }
            let signal = Signal {
                context: id,
                receiver: ctx.receiver,
                imprint: ctx.imprint,
                count: core::mem::take(&mut ctx.pending),
            };
            delivered += 1;
            f(self, signal);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Handle, Key};

    fn receiver() -> ThreadId {
        ThreadId::from_key(Key::from_raw(3))
    }

    #[test]
    fn submissions_accumulate_until_delivery() {
        let mut broker = SignalBroker::new();
        let ctx = broker.create_context(receiver(), 0xabc);
        broker.submit(ctx, 2).expect("submit");
        broker.submit(ctx, 3).expect("submit");
        let mut got = Vec::new();
        assert_eq!(broker.deliver(|_, sig| got.push(sig)), 1);
        assert_eq!(got, vec![Signal { context: ctx, receiver: receiver(), imprint: 0xabc, count: 5 }]);
        assert_eq!(broker.deliver(|_, _| panic!("nothing pending")), 0);
    }

    #[test]
    fn dissolved_context_rejects_submit() {
        let mut broker = SignalBroker::new();
        let ctx = broker.create_context(receiver(), 0);
        assert!(broker.dissolve(ctx).is_some());
        assert_eq!(broker.submit(ctx, 1), Err(SignalError::UnknownContext));
        assert!(broker.dissolve(ctx).is_none());
    }

    #[test]
    fn dissolve_during_delivery_skips_victims() {
        let mut broker = SignalBroker::new();
        let ids: Vec<SignalContextId> =
            (0..4).map(|i| broker.create_context(receiver(), i)).collect();
        for id in &ids {
            broker.submit(*id, 1).expect("submit");
        }
        let mut seen = Vec::new();
        broker.deliver(|broker, sig| {
            seen.push(sig.imprint);
            // First delivery dissolves itself and its successor.
            if sig.imprint == 0 {
                broker.dissolve(sig.context);
                broker.dissolve(ids[1]);
            }
        });
        assert_eq!(seen, vec![0, 2, 3]);
        assert_eq!(broker.len(), 2);
    }
}
