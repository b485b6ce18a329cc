//! Conflation registry - what to do with each event type
//!
//! The registry is assembled once at startup with a [`RegistryBuilder`] and is
//! immutable afterwards, so workers read it without locking.
//!
//! ```
//! use hubsync_core::{Dependency, HandlerContext, HandlerError, Registration, RegistryBuilder, SyncMode};
//!
//! let noop = |_: &HandlerContext, _: &[u8]| -> Result<(), HandlerError> { Ok(()) };
//!
//! let mut builder = RegistryBuilder::new();
//! builder
//!     .register(Registration::new("policies.complete", 1, SyncMode::Complete, noop))
//!     .unwrap();
//! builder
//!     .register(
//!         Registration::new("policies.delta", 2, SyncMode::Delta, noop)
//!             .depends_on(Dependency::exact("policies.complete")),
//!     )
//!     .unwrap();
//!
//! let registry = builder.build().unwrap();
//! assert_eq!(registry.len(), 2);
//! ```

use crate::dependency::Dependency;
use crate::envelope::{SyncMode, TransportPosition};
use crate::error::{Error, HandlerError, Result};
use crate::identity::{EventType, SourceId};
use crate::version::BundleVersion;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Metadata handed to a handler alongside the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    /// Leaf hub that produced the bundle
    pub source: SourceId,
    /// Event type of the bundle
    pub event_type: EventType,
    /// Version being applied
    pub version: BundleVersion,
    /// Complete or delta
    pub sync_mode: SyncMode,
    /// Baseline version of the dependency (delta only)
    pub baseline: Option<BundleVersion>,
    /// Transport position of the envelope
    pub position: TransportPosition,
}

/// Applies one bundle to storage
///
/// Handlers run on worker threads and may block on storage I/O. Return
/// [`HandlerError::Transient`] for failures worth retrying and
/// [`HandlerError::Malformed`] for payloads that can never be applied.
pub trait Handler: Send + Sync {
    /// Apply `payload` described by `ctx`
    fn handle(&self, ctx: &HandlerContext, payload: &[u8]) -> std::result::Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&HandlerContext, &[u8]) -> std::result::Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, ctx: &HandlerContext, payload: &[u8]) -> std::result::Result<(), HandlerError> {
        self(ctx, payload)
    }
}

/// Everything the manager needs to know about one event type
#[derive(Clone)]
pub struct Registration {
    /// Event type this registration covers
    pub event_type: EventType,
    /// Dispatch priority (lower = dispatched first)
    pub priority: u32,
    /// Complete or delta
    pub sync_mode: SyncMode,
    /// Handler invoked for each dispatched envelope
    pub handler: Arc<dyn Handler>,
    /// Optional dependency on another event type
    pub dependency: Option<Dependency>,
}

impl Registration {
    /// Create a registration without a dependency
    pub fn new(
        event_type: impl Into<EventType>,
        priority: u32,
        sync_mode: SyncMode,
        handler: impl Handler + 'static,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            priority,
            sync_mode,
            handler: Arc::new(handler),
            dependency: None,
        }
    }

    /// Create a registration around a handler that is shared elsewhere
    pub fn with_shared_handler(
        event_type: impl Into<EventType>,
        priority: u32,
        sync_mode: SyncMode,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            priority,
            sync_mode,
            handler,
            dependency: None,
        }
    }

    /// Declare a dependency
    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependency = Some(dependency);
        self
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("event_type", &self.event_type)
            .field("priority", &self.priority)
            .field("sync_mode", &self.sync_mode)
            .field("dependency", &self.dependency)
            .finish()
    }
}

/// Collects registrations and validates them into a [`ConflationRegistry`]
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registrations: IndexMap<EventType, Registration>,
}

impl RegistryBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration
    ///
    /// Fails with [`Error::DuplicateRegistration`] if the event type is
    /// already present.
    pub fn register(&mut self, registration: Registration) -> Result<&mut Self> {
        if self.registrations.contains_key(&registration.event_type) {
            return Err(Error::DuplicateRegistration(registration.event_type));
        }
        self.registrations
            .insert(registration.event_type.clone(), registration);
        Ok(self)
    }

    /// Validate the dependency graph and freeze the registry
    ///
    /// Rejects dependencies on unknown event types, self dependencies,
    /// delta registrations without a dependency, and cycles.
    pub fn build(self) -> Result<ConflationRegistry> {
        for registration in self.registrations.values() {
            match &registration.dependency {
                Some(dep) if dep.depends_on == registration.event_type => {
                    return Err(Error::SelfDependency(registration.event_type.clone()));
                }
                Some(dep) if !self.registrations.contains_key(&dep.depends_on) => {
                    return Err(Error::UnknownDependency {
                        event_type: registration.event_type.clone(),
                        depends_on: dep.depends_on.clone(),
                    });
                }
                None if registration.sync_mode == SyncMode::Delta => {
                    return Err(Error::DeltaWithoutDependency(
                        registration.event_type.clone(),
                    ));
                }
                _ => {}
            }
        }

        if let Some(cycle) = find_cycle(&self.registrations) {
            return Err(Error::DependencyCycle(cycle));
        }

        info!(
            registrations = self.registrations.len(),
            "conflation registry built"
        );

        Ok(ConflationRegistry {
            registrations: self.registrations,
        })
    }
}

/// Every event type has at most one dependency, so following the chain from
/// each node either terminates or revisits a node on the current path.
fn find_cycle(registrations: &IndexMap<EventType, Registration>) -> Option<Vec<EventType>> {
    let mut cleared: HashSet<&EventType> = HashSet::new();

    for start in registrations.keys() {
        let mut path: Vec<&EventType> = Vec::new();
        let mut current = start;

        loop {
            if cleared.contains(current) {
                break;
            }
            if let Some(pos) = path.iter().position(|t| *t == current) {
                let mut cycle: Vec<EventType> = path[pos..].iter().map(|t| (*t).clone()).collect();
                cycle.push(current.clone());
                return Some(cycle);
            }
            path.push(current);

            match registrations
                .get(current)
                .and_then(|r| r.dependency.as_ref())
            {
                Some(dep) => current = &dep.depends_on,
                None => break,
            }
        }

        cleared.extend(path);
    }

    None
}

/// Immutable map from event type to its registration
#[derive(Debug)]
pub struct ConflationRegistry {
    registrations: IndexMap<EventType, Registration>,
}

impl ConflationRegistry {
    /// Look up the registration for an event type
    pub fn get(&self, event_type: &EventType) -> Option<&Registration> {
        self.registrations.get(event_type)
    }

    /// Number of registered event types
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Iterate registrations in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.values()
    }
}
