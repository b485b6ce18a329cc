//! Conflation elements - the live state of one (source, event type)
//!
//! An element holds at most one pending envelope. Newer arrivals replace it
//! before dispatch; older or equal ones are absorbed. The transport positions
//! of absorbed envelopes are kept so they can be released once the envelope
//! that replaced them is finished.
//!
//! ```text
//! Idle ──admit──▶ Pending ──select──▶ InFlight ──ok──────▶ Idle
//!                  ▲   │                 │  └──malformed──▶ Idle
//!                  │   ▼                 │
//!               Deferred            transient
//!                  (dependency         │
//!                   unmet)             ▼
//!                                  BackingOff ──delay──▶ Pending
//! ```

use crate::dependency::Dependency;
use crate::envelope::{Envelope, TransportPosition};
use crate::identity::ElementKey;
use crate::registry::{Handler, Registration};
use crate::version::BundleVersion;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Observable state of one element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ElementState {
    /// Nothing pending
    Idle,
    /// An envelope is waiting for a worker
    Pending,
    /// An envelope is waiting for its dependency to catch up
    Deferred,
    /// A handler is running
    InFlight,
    /// A transient failure is waiting out its retry delay
    BackingOff,
}

/// Result of offering an envelope to an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// The envelope is now pending
    Queued,
    /// The envelope replaced an older pending one
    Superseded {
        /// Version that was dropped
        previous: BundleVersion,
    },
    /// A newer or equal envelope is already pending or in flight
    Conflated {
        /// Version that is kept
        retained: BundleVersion,
    },
    /// The version was already processed
    Stale {
        /// Last processed version of the element
        last_processed: BundleVersion,
    },
    /// The envelope does not match its registration and was dropped
    Rejected(RejectReason),
}

/// Why an envelope was rejected at admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Envelope sync mode differs from the registration
    SyncModeMismatch,
    /// The event type has a dependency but the envelope carries no baseline
    MissingBaseline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Retry {
    pub(crate) attempts: u32,
    pub(crate) not_before: Instant,
}

/// Mutable part of an element, guarded by the element lock
#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub(crate) last_processed: Option<BundleVersion>,
    pub(crate) pending: Option<Envelope>,
    /// Positions of envelopes absorbed since the last dispatch
    pub(crate) absorbed: Vec<TransportPosition>,
    pub(crate) in_flight: Option<BundleVersion>,
    /// Positions of arrivals not newer than the in-flight version; they end
    /// with the in-flight dispatch, whatever its outcome
    pub(crate) covered: Vec<TransportPosition>,
    pub(crate) deferred: bool,
    pub(crate) retry: Option<Retry>,
}

impl Slot {
    /// Conflate `envelope` into the slot
    ///
    /// Returns the outcome and the positions that are finished right away.
    pub(crate) fn offer(&mut self, envelope: Envelope) -> (AdmitOutcome, Vec<TransportPosition>) {
        if let Some(last_processed) = self.last_processed {
            if envelope.version <= last_processed {
                return (
                    AdmitOutcome::Stale { last_processed },
                    vec![envelope.position],
                );
            }
        }

        if let Some(in_flight) = self.in_flight {
            if envelope.version <= in_flight {
                self.covered.push(envelope.position);
                return (AdmitOutcome::Conflated { retained: in_flight }, Vec::new());
            }
        }

        let outcome = match self.pending.take() {
            Some(pending) if pending.version >= envelope.version => {
                let retained = pending.version;
                self.absorbed.push(envelope.position);
                self.pending = Some(pending);
                return (AdmitOutcome::Conflated { retained }, Vec::new());
            }
            Some(pending) => {
                self.absorbed.push(pending.position);
                AdmitOutcome::Superseded {
                    previous: pending.version,
                }
            }
            None => AdmitOutcome::Queued,
        };

        self.pending = Some(envelope);
        self.deferred = false;
        (outcome, Vec::new())
    }

    /// Move the pending envelope into flight
    pub(crate) fn begin_dispatch(&mut self) -> Option<(Envelope, Vec<TransportPosition>)> {
        let envelope = self.pending.take()?;
        self.in_flight = Some(envelope.version);
        self.deferred = false;
        Some((envelope, std::mem::take(&mut self.absorbed)))
    }

    /// Drop a pending envelope that is not newer than the last processed one
    pub(crate) fn discard_stale_pending(&mut self) -> Option<Vec<TransportPosition>> {
        let last_processed = self.last_processed?;
        let is_stale = matches!(&self.pending, Some(p) if p.version <= last_processed);
        if !is_stale {
            return None;
        }

        let pending = self.pending.take()?;
        let mut released = std::mem::take(&mut self.absorbed);
        released.push(pending.position);
        self.deferred = false;
        Some(released)
    }

    /// Record a successful dispatch
    pub(crate) fn finish_success(
        &mut self,
        envelope: Envelope,
        absorbed: Vec<TransportPosition>,
    ) -> Vec<TransportPosition> {
        self.in_flight = None;
        self.retry = None;
        self.last_processed = Some(envelope.version);

        let mut released = absorbed;
        released.push(envelope.position);
        released.append(&mut self.covered);
        if let Some(stale) = self.discard_stale_pending() {
            released.extend(stale);
        }
        released
    }

    /// Put a transiently failed envelope back, unless something newer arrived
    pub(crate) fn finish_transient(
        &mut self,
        envelope: Envelope,
        absorbed: Vec<TransportPosition>,
        retry: Retry,
    ) {
        self.in_flight = None;
        self.absorbed.extend(absorbed);
        self.absorbed.append(&mut self.covered);

        // Arrivals while in flight are only kept when newer than the
        // dispatched version, so a pending envelope always wins. The newer
        // version starts a fresh backoff.
        if self.pending.is_some() {
            self.absorbed.push(envelope.position);
            self.retry = None;
        } else {
            self.pending = Some(envelope);
            self.retry = Some(retry);
        }
    }

    /// Drop a malformed envelope
    pub(crate) fn finish_permanent(
        &mut self,
        envelope: Envelope,
        absorbed: Vec<TransportPosition>,
    ) -> Vec<TransportPosition> {
        self.in_flight = None;
        self.retry = None;
        let mut released = absorbed;
        released.push(envelope.position);
        released.append(&mut self.covered);
        released
    }

    pub(crate) fn state(&self, now: Instant) -> ElementState {
        if self.in_flight.is_some() {
            ElementState::InFlight
        } else if self.pending.is_none() {
            ElementState::Idle
        } else if self.retry.map_or(false, |r| r.not_before > now) {
            ElementState::BackingOff
        } else if self.deferred {
            ElementState::Deferred
        } else {
            ElementState::Pending
        }
    }
}

/// One (source, event type) and everything the scheduler needs about it
pub(crate) struct Element {
    pub(crate) key: ElementKey,
    pub(crate) priority: u32,
    pub(crate) dependency: Option<Dependency>,
    pub(crate) handler: Arc<dyn Handler>,
    /// Mirror of `Slot::last_processed` readable without the slot lock.
    /// Only written while the slot lock is held.
    processed: Mutex<Option<BundleVersion>>,
    slot: Mutex<Slot>,
}

impl Element {
    pub(crate) fn new(key: ElementKey, registration: &Registration) -> Self {
        Self {
            key,
            priority: registration.priority,
            dependency: registration.dependency.clone(),
            handler: Arc::clone(&registration.handler),
            processed: Mutex::new(None),
            slot: Mutex::new(Slot::default()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn last_processed(&self) -> Option<BundleVersion> {
        *self.processed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn publish_processed(&self, slot: &Slot) {
        *self.processed.lock().unwrap_or_else(PoisonError::into_inner) = slot.last_processed;
    }
}
