//! Conflation manager - admits envelopes and picks the next one to dispatch
//!
//! The manager owns the element table. `admit` only touches the target
//! element under its own lock. Selection scans every element, so it is
//! serialized by a separate selection lock: two workers can never pick the
//! same element, and neither blocks `admit` callers for longer than one
//! element lock.
//!
//! Workers (see [`WorkerPool`](crate::WorkerPool)) loop over
//! `next_ready` / `run`. [`ConflationManager::dispatch_next`] runs one
//! dispatch on the calling thread, which is how single-threaded embedders and
//! tests drive the manager.
//!
//! # Example
//!
//! ```
//! use hubsync_core::{
//!     ConflationManager, EngineConfig, Envelope, HandlerContext, HandlerError,
//!     NoopAcknowledger, Registration, RegistryBuilder, SyncMode, TransportPosition,
//! };
//!
//! let handler = |_: &HandlerContext, _: &[u8]| -> Result<(), HandlerError> { Ok(()) };
//! let mut builder = RegistryBuilder::new();
//! builder
//!     .register(Registration::new("policies", 1, SyncMode::Complete, handler))
//!     .unwrap();
//!
//! let manager = ConflationManager::new(
//!     builder.build().unwrap(),
//!     EngineConfig::with_worker_count(1),
//!     NoopAcknowledger,
//! );
//!
//! for (offset, version) in [(1, 1), (2, 2), (3, 3)] {
//!     let envelope = Envelope::complete(
//!         "hub1",
//!         "policies",
//!         version,
//!         TransportPosition::new(0, offset),
//!         vec![],
//!     );
//!     manager.admit(envelope).unwrap();
//! }
//!
//! // Three arrivals before dispatch collapse into one invocation
//! let report = manager.dispatch_next().unwrap();
//! assert_eq!(report.version.generation(), 3);
//! assert!(manager.dispatch_next().is_none());
//! ```

use crate::commit::{Acknowledger, CommitTracker};
use crate::config::EngineConfig;
use crate::element::{AdmitOutcome, Element, ElementState, RejectReason, Retry, Slot};
use crate::envelope::{Envelope, TransportPosition};
use crate::error::{Error, HandlerError, Result};
use crate::identity::{ElementKey, EventType, SourceId};
use crate::registry::{ConflationRegistry, HandlerContext, Registration};
use crate::stats::{Counters, ManagerStats};
use crate::version::BundleVersion;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How a dispatch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler succeeded and the version was recorded as processed
    Succeeded,
    /// The handler failed transiently; the envelope will be retried
    Retrying {
        /// Consecutive failed attempts for this element
        attempt: u32,
        /// Delay before the element is eligible again
        delay: Duration,
        /// Failure message
        reason: String,
    },
    /// The envelope was malformed and dropped
    Dropped {
        /// Failure message
        reason: String,
    },
}

/// Summary of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Element that was dispatched
    pub key: ElementKey,
    /// Version that was handed to the handler
    pub version: BundleVersion,
    /// How it ended
    pub outcome: DispatchOutcome,
}

/// An element selected for dispatch, already marked in flight
pub(crate) struct Dispatch {
    element: Arc<Element>,
    envelope: Envelope,
    absorbed: Vec<TransportPosition>,
}

/// Result of a selection pass
pub(crate) enum Selection {
    Ready(Dispatch),
    Idle {
        /// Earliest moment a backing-off element becomes eligible
        next_retry: Option<Instant>,
    },
}

enum Eligibility {
    Ready,
    NotReady,
    BackingOff(Instant),
    Stale(Vec<TransportPosition>),
}

#[derive(Debug, Default)]
struct WakeState {
    generation: u64,
    shutdown: bool,
}

/// Scheduler holding one element per (source, event type)
pub struct ConflationManager {
    registry: Arc<ConflationRegistry>,
    config: EngineConfig,
    elements: RwLock<HashMap<ElementKey, Arc<Element>>>,
    /// Serializes selection so marking in flight is atomic
    selection: Mutex<()>,
    wake: Mutex<WakeState>,
    signal: Condvar,
    commits: CommitTracker,
    /// Held across release and acknowledge so watermarks reach the
    /// acknowledger in increasing order
    acknowledging: Mutex<()>,
    acknowledger: Arc<dyn Acknowledger>,
    counters: Counters,
}

impl ConflationManager {
    /// Create a manager over a validated registry
    pub fn new(
        registry: ConflationRegistry,
        config: EngineConfig,
        acknowledger: impl Acknowledger + 'static,
    ) -> Self {
        Self::with_shared_acknowledger(registry, config, Arc::new(acknowledger))
    }

    /// Create a manager whose acknowledger is shared with the transport
    pub fn with_shared_acknowledger(
        registry: ConflationRegistry,
        config: EngineConfig,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
            elements: RwLock::new(HashMap::new()),
            selection: Mutex::new(()),
            wake: Mutex::new(WakeState::default()),
            signal: Condvar::new(),
            commits: CommitTracker::new(),
            acknowledging: Mutex::new(()),
            acknowledger,
            counters: Counters::default(),
        }
    }

    /// The registry the manager dispatches from
    pub fn registry(&self) -> &ConflationRegistry {
        &self.registry
    }

    /// The engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Accept an envelope from the transport
    ///
    /// Never blocks on storage or handlers. Fails only for event types that
    /// have no registration; envelopes that contradict their registration are
    /// dropped and reported as [`AdmitOutcome::Rejected`].
    pub fn admit(&self, envelope: Envelope) -> Result<AdmitOutcome> {
        let registration = self
            .registry
            .get(&envelope.event_type)
            .ok_or_else(|| Error::UnregisteredEventType(envelope.event_type.clone()))?;

        self.commits.track(envelope.position);
        Counters::bump(&self.counters.admitted);

        let rejection = if envelope.sync_mode != registration.sync_mode {
            Some(RejectReason::SyncModeMismatch)
        } else if registration.dependency.is_some() && envelope.baseline.is_none() {
            Some(RejectReason::MissingBaseline)
        } else {
            None
        };

        if let Some(reason) = rejection {
            error!(
                source = %envelope.source,
                event_type = %envelope.event_type,
                version = %envelope.version,
                ?reason,
                "rejecting envelope"
            );
            Counters::bump(&self.counters.rejected);
            self.release([envelope.position]);
            return Ok(AdmitOutcome::Rejected(reason));
        }

        let element = self.element_for(envelope.key(), registration);
        let source = envelope.source.clone();
        let event_type = envelope.event_type.clone();
        let version = envelope.version;

        let (outcome, released) = element.lock().offer(envelope);

        match outcome {
            AdmitOutcome::Queued => {
                debug!(%source, %event_type, %version, "envelope queued");
            }
            AdmitOutcome::Superseded { previous } => {
                Counters::bump(&self.counters.conflated);
                debug!(%source, %event_type, %version, %previous, "envelope superseded pending");
            }
            AdmitOutcome::Conflated { retained } => {
                Counters::bump(&self.counters.conflated);
                debug!(%source, %event_type, %version, %retained, "envelope conflated into newer");
            }
            AdmitOutcome::Stale { last_processed } => {
                Counters::bump(&self.counters.stale);
                debug!(%source, %event_type, %version, %last_processed, "stale envelope dropped");
            }
            AdmitOutcome::Rejected(_) => {}
        }

        self.release(released);
        if matches!(outcome, AdmitOutcome::Queued | AdmitOutcome::Superseded { .. }) {
            self.notify(false);
        }
        Ok(outcome)
    }

    fn element_for(
        &self,
        key: ElementKey,
        registration: &Registration,
    ) -> Arc<Element> {
        if let Some(element) = self.read_elements().get(&key) {
            return Arc::clone(element);
        }

        let mut elements = self.elements.write().unwrap_or_else(PoisonError::into_inner);
        let element = elements.entry(key).or_insert_with_key(|key| {
            debug!(element = %key, priority = registration.priority, "new conflation element");
            Arc::new(Element::new(key.clone(), registration))
        });
        Arc::clone(element)
    }

    fn read_elements(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ElementKey, Arc<Element>>> {
        self.elements.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_elements(&self) -> HashMap<ElementKey, Arc<Element>> {
        self.read_elements().clone()
    }

    // ========================================================================
    // Selection and dispatch
    // ========================================================================

    /// Pick the ready element with the lowest priority and mark it in flight
    ///
    /// Ties are broken by source name, then event type.
    pub(crate) fn next_ready(&self, now: Instant) -> Selection {
        let _selection = self.selection.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            let table = self.snapshot_elements();
            let mut best: Option<&Arc<Element>> = None;
            let mut next_retry: Option<Instant> = None;
            let mut released = Vec::new();

            for element in table.values() {
                let mut slot = element.lock();
                match self.eligibility(&table, element, &mut slot, now) {
                    Eligibility::Ready => {
                        let better = best.map_or(true, |b| {
                            (element.priority, &element.key) < (b.priority, &b.key)
                        });
                        if better {
                            best = Some(element);
                        }
                    }
                    Eligibility::BackingOff(at) => {
                        next_retry = Some(next_retry.map_or(at, |n| n.min(at)));
                    }
                    Eligibility::Stale(positions) => released.extend(positions),
                    Eligibility::NotReady => {}
                }
            }

            if !released.is_empty() {
                self.release(released);
            }

            let Some(element) = best else {
                return Selection::Idle { next_retry };
            };

            // An admit may have replaced the envelope since the scan
            let mut slot = element.lock();
            match self.eligibility(&table, element, &mut slot, now) {
                Eligibility::Ready => {
                    if let Some((envelope, absorbed)) = slot.begin_dispatch() {
                        Counters::bump(&self.counters.dispatched);
                        return Selection::Ready(Dispatch {
                            element: Arc::clone(element),
                            envelope,
                            absorbed,
                        });
                    }
                }
                Eligibility::Stale(positions) => {
                    drop(slot);
                    self.release(positions);
                }
                Eligibility::NotReady | Eligibility::BackingOff(_) => {}
            }
        }
    }

    fn eligibility(
        &self,
        table: &HashMap<ElementKey, Arc<Element>>,
        element: &Element,
        slot: &mut Slot,
        now: Instant,
    ) -> Eligibility {
        if slot.in_flight.is_some() {
            return Eligibility::NotReady;
        }
        if let Some(released) = slot.discard_stale_pending() {
            Counters::bump(&self.counters.stale);
            return Eligibility::Stale(released);
        }
        let Some(pending) = slot.pending.as_ref() else {
            return Eligibility::NotReady;
        };
        if let Some(retry) = slot.retry {
            if retry.not_before > now {
                return Eligibility::BackingOff(retry.not_before);
            }
        }

        if let Some(dependency) = &element.dependency {
            let dependency_key = ElementKey {
                source: element.key.source.clone(),
                event_type: dependency.depends_on.clone(),
            };
            let processed = table.get(&dependency_key).and_then(|d| d.last_processed());
            if !dependency.check(pending.baseline, processed).is_satisfied() {
                if !slot.deferred {
                    debug!(
                        element = %element.key,
                        version = %pending.version,
                        baseline = ?pending.baseline,
                        processed = ?processed,
                        "dispatch deferred on dependency"
                    );
                }
                slot.deferred = true;
                return Eligibility::NotReady;
            }
        }

        slot.deferred = false;
        Eligibility::Ready
    }

    /// Invoke the handler for a selected element and record the result
    pub(crate) fn run(&self, dispatch: Dispatch) -> DispatchReport {
        let element = Arc::clone(&dispatch.element);
        let envelope = &dispatch.envelope;
        let ctx = HandlerContext {
            source: envelope.source.clone(),
            event_type: envelope.event_type.clone(),
            version: envelope.version,
            sync_mode: envelope.sync_mode,
            baseline: envelope.baseline,
            position: envelope.position,
        };

        debug!(
            source = %ctx.source,
            event_type = %ctx.event_type,
            version = %ctx.version,
            priority = element.priority,
            "dispatching"
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            element.handler.handle(&ctx, &envelope.payload)
        }))
        .unwrap_or_else(|panic| {
            Err(HandlerError::malformed(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

        self.complete(dispatch, result)
    }

    fn complete(
        &self,
        dispatch: Dispatch,
        result: std::result::Result<(), HandlerError>,
    ) -> DispatchReport {
        let Dispatch {
            element,
            envelope,
            absorbed,
        } = dispatch;
        let version = envelope.version;

        let (outcome, released) = {
            let mut slot = element.lock();
            match result {
                Ok(()) => {
                    let released = slot.finish_success(envelope, absorbed);
                    element.publish_processed(&slot);
                    (DispatchOutcome::Succeeded, released)
                }
                Err(HandlerError::Transient(reason)) => {
                    let attempt = slot.retry.map_or(0, |r| r.attempts).saturating_add(1);
                    let delay = self.config.retry_delay(attempt);
                    slot.finish_transient(
                        envelope,
                        absorbed,
                        Retry {
                            attempts: attempt,
                            not_before: Instant::now() + delay,
                        },
                    );
                    (
                        DispatchOutcome::Retrying {
                            attempt,
                            delay,
                            reason,
                        },
                        Vec::new(),
                    )
                }
                Err(HandlerError::Malformed(reason)) => {
                    let released = slot.finish_permanent(envelope, absorbed);
                    (DispatchOutcome::Dropped { reason }, released)
                }
            }
        };

        match &outcome {
            DispatchOutcome::Succeeded => {
                Counters::bump(&self.counters.succeeded);
                debug!(element = %element.key, %version, "dispatch succeeded");
            }
            DispatchOutcome::Retrying {
                attempt,
                delay,
                reason,
            } => {
                Counters::bump(&self.counters.transient_failures);
                warn!(
                    element = %element.key,
                    %version,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    %reason,
                    "transient handler failure, will retry"
                );
            }
            DispatchOutcome::Dropped { reason } => {
                Counters::bump(&self.counters.permanent_failures);
                error!(element = %element.key, %version, %reason, "dropping malformed envelope");
            }
        }

        self.release(released);
        self.notify(true);

        DispatchReport {
            key: element.key.clone(),
            version,
            outcome,
        }
    }

    /// Run one ready dispatch on the calling thread
    ///
    /// Returns `None` if no element is ready right now.
    pub fn dispatch_next(&self) -> Option<DispatchReport> {
        match self.next_ready(Instant::now()) {
            Selection::Ready(dispatch) => Some(self.run(dispatch)),
            Selection::Idle { .. } => None,
        }
    }

    /// Dispatch until nothing is ready; returns every report in order
    pub fn drain_ready(&self) -> Vec<DispatchReport> {
        std::iter::from_fn(|| self.dispatch_next()).collect()
    }

    fn release<I>(&self, positions: I)
    where
        I: IntoIterator<Item = TransportPosition>,
    {
        let _acknowledging = self
            .acknowledging
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for position in self.commits.release(positions) {
            debug!(%position, "acknowledging transport position");
            self.acknowledger.acknowledge(position);
        }
    }

    // ========================================================================
    // Worker signalling
    // ========================================================================

    fn lock_wake(&self) -> MutexGuard<'_, WakeState> {
        self.wake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, all: bool) {
        {
            let mut wake = self.lock_wake();
            wake.generation = wake.generation.wrapping_add(1);
        }
        if all {
            self.signal.notify_all();
        } else {
            self.signal.notify_one();
        }
    }

    /// Current wake generation; read before a selection pass
    pub(crate) fn generation(&self) -> u64 {
        self.lock_wake().generation
    }

    /// Block until something changed since `observed`, `deadline` passed, or
    /// shutdown was requested
    pub(crate) fn wait_for_work(&self, observed: u64, deadline: Option<Instant>) {
        let mut wake = self.lock_wake();
        while wake.generation == observed && !wake.shutdown {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .signal
                        .wait_timeout(wake, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    wake = guard;
                }
                None => {
                    wake = self.signal.wait(wake).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Ask workers to stop after their current dispatch
    ///
    /// Pending envelopes stay unacknowledged and are redelivered by the
    /// transport after a restart.
    pub fn shutdown(&self) {
        self.lock_wake().shutdown = true;
        self.signal.notify_all();
    }

    /// True once [`shutdown`](Self::shutdown) was called
    pub fn is_shutdown(&self) -> bool {
        self.lock_wake().shutdown
    }

    // ========================================================================
    // Health signals
    // ========================================================================

    /// Counters and element gauges
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats::from_counters(&self.counters);
        let now = Instant::now();
        let table = self.snapshot_elements();

        stats.elements = table.len();
        for element in table.values() {
            match element.lock().state(now) {
                ElementState::Idle => {}
                ElementState::Pending => stats.pending += 1,
                ElementState::Deferred => stats.deferred += 1,
                ElementState::InFlight => stats.in_flight += 1,
                ElementState::BackingOff => stats.backing_off += 1,
            }
        }
        stats.outstanding_positions = self.commits.outstanding();
        stats
    }

    /// State of one element, `None` if no envelope ever arrived for it
    pub fn element_state(&self, source: &SourceId, event_type: &EventType) -> Option<ElementState> {
        let key = ElementKey {
            source: source.clone(),
            event_type: event_type.clone(),
        };
        let element = self.read_elements().get(&key).cloned()?;
        let state = element.lock().state(Instant::now());
        Some(state)
    }

    /// Last processed version of one element
    pub fn last_processed(&self, source: &SourceId, event_type: &EventType) -> Option<BundleVersion> {
        let key = ElementKey {
            source: source.clone(),
            event_type: event_type.clone(),
        };
        self.read_elements()
            .get(&key)
            .and_then(|element| element.last_processed())
    }

    /// Last acknowledged offset of a transport partition
    pub fn acknowledged(&self, partition: u32) -> Option<u64> {
        self.commits.acknowledged(partition)
    }
}

impl std::fmt::Debug for ConflationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflationManager")
            .field("registrations", &self.registry.len())
            .field("elements", &self.read_elements().len())
            .field("worker_count", &self.config.worker_count())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::Dependency;
    use crate::envelope::SyncMode;
    use crate::registry::RegistryBuilder;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    type Calls = Arc<Mutex<Vec<(String, String, u64)>>>;

    const COMPLETE: &str = "policies.complete";
    const DELTA: &str = "policies.delta";

    fn recording(calls: &Calls) -> impl Fn(&HandlerContext, &[u8]) -> std::result::Result<(), HandlerError> {
        let calls = Arc::clone(calls);
        move |ctx: &HandlerContext, _: &[u8]| {
            calls.lock().unwrap().push((
                ctx.source.to_string(),
                ctx.event_type.to_string(),
                ctx.version.generation(),
            ));
            Ok(())
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    fn immediate_retry() -> EngineConfig {
        let mut config = EngineConfig::with_worker_count(1);
        config.set_retry_delays(Duration::ZERO, Duration::ZERO);
        config
    }

    fn acks() -> (Arc<Mutex<Vec<TransportPosition>>>, impl Acknowledger + 'static) {
        let acked = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&acked);
        (acked, move |p: TransportPosition| sink.lock().unwrap().push(p))
    }

    fn policies_manager(calls: &Calls) -> ConflationManager {
        let mut builder = RegistryBuilder::new();
        builder
            .register(Registration::new(COMPLETE, 1, SyncMode::Complete, recording(calls)))
            .unwrap();
        builder
            .register(
                Registration::new(DELTA, 2, SyncMode::Delta, recording(calls))
                    .depends_on(Dependency::exact(COMPLETE)),
            )
            .unwrap();
        ConflationManager::new(builder.build().unwrap(), immediate_retry(), crate::NoopAcknowledger)
    }

    fn complete(source: &str, version: u64, offset: u64) -> Envelope {
        Envelope::complete(source, COMPLETE, version, TransportPosition::new(0, offset), vec![])
    }

    fn delta(source: &str, version: u64, baseline: u64, offset: u64) -> Envelope {
        Envelope::delta(source, DELTA, version, baseline, TransportPosition::new(0, offset), vec![])
    }

    fn versions(calls: &Calls) -> Vec<(String, u64)> {
        calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t, v)| (t.clone(), *v))
            .collect()
    }

    #[test]
    fn test_conflates_to_newest_version() {
        init_tracing();
        let calls = Calls::default();
        let manager = policies_manager(&calls);

        manager.admit(complete("hub1", 1, 1)).unwrap();
        manager.admit(complete("hub1", 2, 2)).unwrap();
        manager.admit(complete("hub1", 3, 3)).unwrap();

        let reports = manager.drain_ready();
        assert_eq!(reports.len(), 1);
        assert_eq!(versions(&calls), vec![(COMPLETE.to_string(), 3)]);
        assert_eq!(manager.stats().conflated, 2);
    }

    #[test]
    fn test_older_arrival_does_not_replace_pending() {
        let calls = Calls::default();
        let manager = policies_manager(&calls);

        manager.admit(complete("hub1", 5, 1)).unwrap();
        let outcome = manager.admit(complete("hub1", 4, 2)).unwrap();
        assert_eq!(
            outcome,
            AdmitOutcome::Conflated {
                retained: BundleVersion::from(5)
            }
        );

        manager.drain_ready();
        assert_eq!(versions(&calls), vec![(COMPLETE.to_string(), 5)]);
    }

    #[test]
    fn test_stale_and_duplicate_versions_are_noops() {
        let calls = Calls::default();
        let manager = policies_manager(&calls);

        manager.admit(complete("hub1", 2, 1)).unwrap();
        manager.drain_ready();

        let duplicate = manager.admit(complete("hub1", 2, 2)).unwrap();
        let older = manager.admit(complete("hub1", 1, 3)).unwrap();
        assert!(matches!(duplicate, AdmitOutcome::Stale { .. }));
        assert!(matches!(older, AdmitOutcome::Stale { .. }));
        assert!(manager.dispatch_next().is_none());
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(manager.stats().stale, 2);
    }

    #[test]
    fn test_delta_deferred_until_baseline_processed() {
        init_tracing();
        let calls = Calls::default();
        let manager = policies_manager(&calls);
        let hub = SourceId::new("hub1");

        // Delta derived from complete v1 arrives first
        manager.admit(delta("hub1", 1, 1, 1)).unwrap();
        assert!(manager.dispatch_next().is_none());
        assert_eq!(
            manager.element_state(&hub, &EventType::new(DELTA)),
            Some(ElementState::Deferred)
        );

        manager.admit(complete("hub1", 1, 2)).unwrap();
        manager.drain_ready();

        assert_eq!(
            versions(&calls),
            vec![(COMPLETE.to_string(), 1), (DELTA.to_string(), 1)]
        );
        assert_eq!(
            manager.last_processed(&hub, &EventType::new(DELTA)),
            Some(BundleVersion::from(1))
        );
    }

    #[test]
    fn test_deferred_delta_superseded_never_dispatches() {
        let calls = Calls::default();
        let manager = policies_manager(&calls);

        manager.admit(complete("hub1", 1, 1)).unwrap();
        manager.drain_ready();

        // Delta waits for complete v2, then a later delta on v1 replaces it
        manager.admit(delta("hub1", 1, 2, 2)).unwrap();
        assert!(manager.dispatch_next().is_none());
        manager.admit(delta("hub1", 2, 1, 3)).unwrap();
        manager.drain_ready();

        assert_eq!(
            versions(&calls),
            vec![(COMPLETE.to_string(), 1), (DELTA.to_string(), 2)]
        );
    }

    #[test]
    fn test_delta_on_outdated_baseline_stays_deferred() {
        let calls = Calls::default();
        let manager = policies_manager(&calls);

        manager.admit(complete("hub1", 2, 1)).unwrap();
        manager.drain_ready();
        manager.admit(delta("hub1", 1, 1, 2)).unwrap();

        assert!(manager.dispatch_next().is_none());
        assert_eq!(manager.stats().deferred, 1);
    }

    #[test]
    fn test_dependency_is_per_source() {
        let calls = Calls::default();
        let manager = policies_manager(&calls);

        manager.admit(complete("hub1", 1, 1)).unwrap();
        manager.drain_ready();
        // hub2 has no baseline yet even though hub1 does
        manager.admit(delta("hub2", 1, 1, 2)).unwrap();
        assert!(manager.dispatch_next().is_none());
    }

    #[test]
    fn test_lower_priority_dispatches_first() {
        let calls = Calls::default();
        let mut builder = RegistryBuilder::new();
        builder
            .register(Registration::new("low", 10, SyncMode::Complete, recording(&calls)))
            .unwrap();
        builder
            .register(Registration::new("high", 1, SyncMode::Complete, recording(&calls)))
            .unwrap();
        let manager =
            ConflationManager::new(builder.build().unwrap(), immediate_retry(), crate::NoopAcknowledger);

        let pos = TransportPosition::new(0, 1);
        manager.admit(Envelope::complete("hub1", "low", 1, pos, vec![])).unwrap();
        manager.admit(Envelope::complete("hub1", "high", 1, pos, vec![])).unwrap();
        manager.drain_ready();

        assert_eq!(
            versions(&calls),
            vec![("high".to_string(), 1), ("low".to_string(), 1)]
        );
    }

    #[test]
    fn test_ties_broken_by_source_name() {
        let calls = Calls::default();
        let manager = policies_manager(&calls);

        manager.admit(complete("hub-b", 1, 1)).unwrap();
        manager.admit(complete("hub-a", 1, 2)).unwrap();
        manager.drain_ready();

        let sources: Vec<String> = calls.lock().unwrap().iter().map(|c| c.0.clone()).collect();
        assert_eq!(sources, vec!["hub-a".to_string(), "hub-b".to_string()]);
    }

    #[test]
    fn test_transient_failure_retries_same_envelope() {
        init_tracing();
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&attempts);
        let flaky = move |_: &HandlerContext, _: &[u8]| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n == 1 {
                Err(HandlerError::transient("database unavailable"))
            } else {
                Ok(())
            }
        };

        let mut builder = RegistryBuilder::new();
        builder
            .register(Registration::new(COMPLETE, 1, SyncMode::Complete, flaky))
            .unwrap();
        let manager =
            ConflationManager::new(builder.build().unwrap(), immediate_retry(), crate::NoopAcknowledger);
        let hub = SourceId::new("hub1");
        let event_type = EventType::new(COMPLETE);

        manager.admit(complete("hub1", 1, 1)).unwrap();
        let first = manager.dispatch_next().unwrap();
        assert!(matches!(first.outcome, DispatchOutcome::Retrying { attempt: 1, .. }));
        assert_eq!(manager.last_processed(&hub, &event_type), None);

        let second = manager.dispatch_next().unwrap();
        assert_eq!(second.outcome, DispatchOutcome::Succeeded);
        assert_eq!(second.version, BundleVersion::from(1));
        assert_eq!(
            manager.last_processed(&hub, &event_type),
            Some(BundleVersion::from(1))
        );
        assert_eq!(manager.stats().transient_failures, 1);
    }

    #[test]
    fn test_backoff_skips_element_but_not_others() {
        let failing =
            |_: &HandlerContext, _: &[u8]| -> std::result::Result<(), HandlerError> {
                Err(HandlerError::transient("timeout"))
            };
        let calls = Calls::default();

        let mut builder = RegistryBuilder::new();
        builder
            .register(Registration::new("failing", 1, SyncMode::Complete, failing))
            .unwrap();
        builder
            .register(Registration::new("healthy", 2, SyncMode::Complete, recording(&calls)))
            .unwrap();
        let mut config = EngineConfig::with_worker_count(1);
        config.set_retry_delays(Duration::from_secs(60), Duration::from_secs(60));
        let manager = ConflationManager::new(builder.build().unwrap(), config, crate::NoopAcknowledger);

        let pos = TransportPosition::new(0, 1);
        manager.admit(Envelope::complete("hub1", "failing", 1, pos, vec![])).unwrap();
        manager.admit(Envelope::complete("hub1", "healthy", 1, pos, vec![])).unwrap();

        let reports = manager.drain_ready();
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0].outcome, DispatchOutcome::Retrying { .. }));
        assert_eq!(reports[1].outcome, DispatchOutcome::Succeeded);
        assert_eq!(
            manager.element_state(&SourceId::new("hub1"), &EventType::new("failing")),
            Some(ElementState::BackingOff)
        );
        assert_eq!(manager.stats().backing_off, 1);
    }

    #[test]
    fn test_transient_failure_superseded_by_newer_arrival() {
        let calls = Calls::default();
        let seen = Arc::clone(&calls);
        let fail_v1 = move |ctx: &HandlerContext, _: &[u8]| {
            seen.lock().unwrap().push((
                ctx.source.to_string(),
                ctx.event_type.to_string(),
                ctx.version.generation(),
            ));
            if ctx.version == BundleVersion::from(1) {
                Err(HandlerError::transient("conflict"))
            } else {
                Ok(())
            }
        };

        let mut builder = RegistryBuilder::new();
        builder
            .register(Registration::new(COMPLETE, 1, SyncMode::Complete, fail_v1))
            .unwrap();
        let manager =
            ConflationManager::new(builder.build().unwrap(), immediate_retry(), crate::NoopAcknowledger);

        manager.admit(complete("hub1", 1, 1)).unwrap();
        let Selection::Ready(dispatch) = manager.next_ready(Instant::now()) else {
            panic!("expected a ready element");
        };
        // v2 arrives while v1 is in flight
        manager.admit(complete("hub1", 2, 2)).unwrap();
        manager.run(dispatch);
        manager.drain_ready();

        assert_eq!(
            versions(&calls),
            vec![(COMPLETE.to_string(), 1), (COMPLETE.to_string(), 2)]
        );
    }

    #[test]
    fn test_malformed_dropped_and_key_continues() {
        let calls = Calls::default();
        let seen = Arc::clone(&calls);
        let strict = move |ctx: &HandlerContext, payload: &[u8]| {
            if payload.is_empty() {
                return Err(HandlerError::malformed("empty payload"));
            }
            seen.lock().unwrap().push((
                ctx.source.to_string(),
                ctx.event_type.to_string(),
                ctx.version.generation(),
            ));
            Ok(())
        };

        let mut builder = RegistryBuilder::new();
        builder
            .register(Registration::new(COMPLETE, 1, SyncMode::Complete, strict))
            .unwrap();
        let manager =
            ConflationManager::new(builder.build().unwrap(), immediate_retry(), crate::NoopAcknowledger);
        let hub = SourceId::new("hub1");

        manager.admit(complete("hub1", 1, 1)).unwrap();
        let report = manager.dispatch_next().unwrap();
        assert!(matches!(report.outcome, DispatchOutcome::Dropped { .. }));
        assert_eq!(
            manager.element_state(&hub, &EventType::new(COMPLETE)),
            Some(ElementState::Idle)
        );

        let mut next = complete("hub1", 2, 2);
        next.payload = vec![1];
        manager.admit(next).unwrap();
        manager.drain_ready();

        assert_eq!(versions(&calls), vec![(COMPLETE.to_string(), 2)]);
        assert_eq!(manager.stats().permanent_failures, 1);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        init_tracing();
        let panicking = |_: &HandlerContext, _: &[u8]| -> std::result::Result<(), HandlerError> {
            panic!("bug in handler")
        };
        let mut builder = RegistryBuilder::new();
        builder
            .register(Registration::new(COMPLETE, 1, SyncMode::Complete, panicking))
            .unwrap();
        let manager =
            ConflationManager::new(builder.build().unwrap(), immediate_retry(), crate::NoopAcknowledger);

        manager.admit(complete("hub1", 1, 1)).unwrap();
        let report = manager.dispatch_next().unwrap();
        match report.outcome {
            DispatchOutcome::Dropped { reason } => assert!(reason.contains("bug in handler")),
            other => panic!("expected drop, got {:?}", other),
        }
    }

    #[test]
    fn test_acknowledges_only_after_success() {
        let calls = Calls::default();
        let (acked, acknowledger) = acks();
        let mut builder = RegistryBuilder::new();
        builder
            .register(Registration::new(COMPLETE, 1, SyncMode::Complete, recording(&calls)))
            .unwrap();
        let manager = ConflationManager::new(builder.build().unwrap(), immediate_retry(), acknowledger);

        manager.admit(complete("hub1", 1, 10)).unwrap();
        manager.admit(complete("hub1", 2, 11)).unwrap();
        assert!(acked.lock().unwrap().is_empty());

        manager.drain_ready();
        // v1 was absorbed by v2; both commit together once v2 is durable
        assert_eq!(*acked.lock().unwrap(), vec![TransportPosition::new(0, 11)]);
        assert_eq!(manager.acknowledged(0), Some(11));
        assert_eq!(manager.stats().outstanding_positions, 0);
    }

    #[test]
    fn test_acknowledgment_waits_for_slower_source() {
        let calls = Calls::default();
        let (acked, acknowledger) = acks();
        let manager = {
            let mut builder = RegistryBuilder::new();
            builder
                .register(Registration::new(COMPLETE, 1, SyncMode::Complete, recording(&calls)))
                .unwrap();
            builder
                .register(
                    Registration::new(DELTA, 2, SyncMode::Delta, recording(&calls))
                        .depends_on(Dependency::exact(COMPLETE)),
                )
                .unwrap();
            ConflationManager::new(builder.build().unwrap(), immediate_retry(), acknowledger)
        };

        // Offset 1 is deferred, offset 2 succeeds
        manager.admit(delta("hub2", 1, 1, 1)).unwrap();
        manager.admit(complete("hub1", 1, 2)).unwrap();
        manager.drain_ready();
        assert!(acked.lock().unwrap().is_empty());

        manager.admit(complete("hub2", 1, 3)).unwrap();
        manager.drain_ready();
        assert_eq!(acked.lock().unwrap().last(), Some(&TransportPosition::new(0, 3)));
    }

    fn single_type_manager<H>(handler: H, acknowledger: impl Acknowledger + 'static) -> ConflationManager
    where
        H: Fn(&HandlerContext, &[u8]) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        let mut builder = RegistryBuilder::new();
        builder
            .register(Registration::new(COMPLETE, 1, SyncMode::Complete, handler))
            .unwrap();
        ConflationManager::new(builder.build().unwrap(), immediate_retry(), acknowledger)
    }

    fn select(manager: &ConflationManager) -> Dispatch {
        match manager.next_ready(Instant::now()) {
            Selection::Ready(dispatch) => dispatch,
            Selection::Idle { .. } => panic!("expected a ready element"),
        }
    }

    #[test]
    fn test_dropped_envelope_releases_redelivered_duplicate() {
        let reject_bad = |ctx: &HandlerContext, _: &[u8]| {
            if ctx.source.as_str() == "bad" {
                Err(HandlerError::malformed("unreadable bundle"))
            } else {
                Ok(())
            }
        };
        let (_, acknowledger) = acks();
        let manager = single_type_manager(reject_bad, acknowledger);

        manager.admit(complete("bad", 2, 1)).unwrap();
        let dispatch = select(&manager);
        // Redelivery of the same version while the handler runs
        manager.admit(complete("bad", 2, 2)).unwrap();
        let report = manager.run(dispatch);
        assert!(matches!(report.outcome, DispatchOutcome::Dropped { .. }));
        assert_eq!(manager.acknowledged(0), Some(2));

        manager.admit(complete("good", 1, 3)).unwrap();
        manager.drain_ready();
        assert_eq!(manager.acknowledged(0), Some(3));
        assert_eq!(manager.stats().outstanding_positions, 0);
    }

    #[test]
    fn test_success_with_pending_releases_duplicates() {
        let calls = Calls::default();
        let (_, acknowledger) = acks();
        let manager = single_type_manager(recording(&calls), acknowledger);

        manager.admit(complete("hub1", 2, 1)).unwrap();
        let dispatch = select(&manager);
        manager.admit(complete("hub1", 2, 2)).unwrap();
        manager.admit(complete("hub1", 3, 3)).unwrap();
        manager.run(dispatch);

        // v3 is still pending, so offset 3 holds the watermark
        assert_eq!(manager.acknowledged(0), Some(2));
        assert_eq!(manager.stats().outstanding_positions, 1);

        manager.drain_ready();
        assert_eq!(manager.acknowledged(0), Some(3));
        assert_eq!(manager.stats().outstanding_positions, 0);
        assert_eq!(
            versions(&calls),
            vec![(COMPLETE.to_string(), 2), (COMPLETE.to_string(), 3)]
        );
    }

    #[test]
    fn test_retry_releases_duplicates_absorbed_in_flight() {
        let failed = Arc::new(AtomicBool::new(false));
        let fail_once = {
            let failed = Arc::clone(&failed);
            move |_: &HandlerContext, _: &[u8]| {
                if failed.swap(true, Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(HandlerError::transient("store unavailable"))
                }
            }
        };
        let (_, acknowledger) = acks();
        let manager = single_type_manager(fail_once, acknowledger);

        manager.admit(complete("hub1", 2, 1)).unwrap();
        let dispatch = select(&manager);
        manager.admit(complete("hub1", 2, 2)).unwrap();
        let report = manager.run(dispatch);
        assert!(matches!(report.outcome, DispatchOutcome::Retrying { attempt: 1, .. }));
        assert_eq!(manager.acknowledged(0), None);
        assert_eq!(manager.stats().outstanding_positions, 2);

        manager.drain_ready();
        assert_eq!(manager.acknowledged(0), Some(2));
        assert_eq!(manager.stats().outstanding_positions, 0);
    }

    #[test]
    fn test_concurrent_completions_acknowledge_in_order() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let entered_tx = Mutex::new(entered_tx);
        let acked = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&acked);
        let slow_on_five = move |position: TransportPosition| {
            if position.offset == 5 {
                let _ = entered_tx.lock().unwrap().send(());
                std::thread::sleep(Duration::from_millis(200));
            }
            sink.lock().unwrap().push(position.offset);
        };
        let calls = Calls::default();
        let manager = single_type_manager(recording(&calls), slow_on_five);

        manager.admit(complete("x", 1, 5)).unwrap();
        manager.admit(complete("y", 1, 9)).unwrap();

        std::thread::scope(|scope| {
            // "x" sorts first, so the spawned worker takes it
            let first = scope.spawn(|| manager.dispatch_next());
            entered_rx.recv().unwrap();
            let second = manager.dispatch_next().unwrap();
            assert_eq!(second.key.source.as_str(), "y");
            let first = first.join().unwrap().unwrap();
            assert_eq!(first.key.source.as_str(), "x");
        });

        assert_eq!(*acked.lock().unwrap(), vec![5, 9]);
        assert_eq!(manager.acknowledged(0), Some(9));
    }

    #[test]
    fn test_unregistered_event_type() {
        let calls = Calls::default();
        let manager = policies_manager(&calls);
        let envelope = Envelope::complete("hub1", "unknown", 1, TransportPosition::new(0, 1), vec![]);
        assert!(matches!(
            manager.admit(envelope),
            Err(Error::UnregisteredEventType(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_envelopes() {
        let calls = Calls::default();
        let manager = policies_manager(&calls);

        let wrong_mode = Envelope::complete("hub1", DELTA, 1, TransportPosition::new(0, 1), vec![]);
        assert_eq!(
            manager.admit(wrong_mode).unwrap(),
            AdmitOutcome::Rejected(RejectReason::SyncModeMismatch)
        );

        let mut no_baseline = delta("hub1", 1, 1, 2);
        no_baseline.baseline = None;
        assert_eq!(
            manager.admit(no_baseline).unwrap(),
            AdmitOutcome::Rejected(RejectReason::MissingBaseline)
        );
        assert_eq!(manager.stats().rejected, 2);
        assert_eq!(manager.acknowledged(0), Some(2));
    }

    #[test]
    fn test_sources_progress_independently() {
        let calls = Calls::default();
        let manager = policies_manager(&calls);

        manager.admit(complete("hub1", 3, 1)).unwrap();
        manager.admit(complete("hub2", 1, 2)).unwrap();
        manager.drain_ready();

        assert_eq!(
            manager.last_processed(&SourceId::new("hub1"), &EventType::new(COMPLETE)),
            Some(BundleVersion::from(3))
        );
        assert_eq!(
            manager.last_processed(&SourceId::new("hub2"), &EventType::new(COMPLETE)),
            Some(BundleVersion::from(1))
        );
    }
}
