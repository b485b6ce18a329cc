//! Health counters read back by the embedding process

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) admitted: AtomicU64,
    pub(crate) conflated: AtomicU64,
    pub(crate) stale: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) transient_failures: AtomicU64,
    pub(crate) permanent_failures: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the conflation manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Envelopes accepted by `admit`
    pub admitted: u64,
    /// Envelopes dropped because a newer one replaced them before dispatch
    pub conflated: u64,
    /// Envelopes dropped because their version was already processed
    pub stale: u64,
    /// Envelopes that did not match their registration
    pub rejected: u64,
    /// Handler invocations started
    pub dispatched: u64,
    /// Handler invocations that succeeded
    pub succeeded: u64,
    /// Handler invocations that failed transiently
    pub transient_failures: u64,
    /// Handler invocations that failed permanently (envelope dropped)
    pub permanent_failures: u64,
    /// Live elements
    pub elements: usize,
    /// Elements with a dispatchable envelope
    pub pending: usize,
    /// Elements waiting on a dependency
    pub deferred: usize,
    /// Elements with a handler running
    pub in_flight: usize,
    /// Elements waiting out a retry delay
    pub backing_off: usize,
    /// Transport positions not yet acknowledged
    pub outstanding_positions: usize,
}

impl ManagerStats {
    pub(crate) fn from_counters(counters: &Counters) -> Self {
        Self {
            admitted: Counters::read(&counters.admitted),
            conflated: Counters::read(&counters.conflated),
            stale: Counters::read(&counters.stale),
            rejected: Counters::read(&counters.rejected),
            dispatched: Counters::read(&counters.dispatched),
            succeeded: Counters::read(&counters.succeeded),
            transient_failures: Counters::read(&counters.transient_failures),
            permanent_failures: Counters::read(&counters.permanent_failures),
            ..Self::default()
        }
    }
}
