//! Hubsync Core - Conflation and dependency-aware dispatch for status bundles
//!
//! Leaf hubs periodically publish versioned status bundles. Only the newest
//! bundle per (leaf hub, event type) matters, so this crate:
//! - Conflates arrivals per element, keeping only the newest version
//! - Holds delta bundles back until the complete bundle they were derived
//!   from has been processed
//! - Dispatches ready elements by priority on a bounded worker pool
//! - Acknowledges transport positions only once their effect is durable
//!
//! ## Building an engine
//!
//! 1. Register every event type with a [`RegistryBuilder`]
//! 2. Create a [`ConflationManager`] from the registry and an [`EngineConfig`]
//! 3. Start a [`WorkerPool`] and feed envelopes with [`pump`] or
//!    [`ConflationManager::admit`]
//!
//! Handlers implement [`Handler`] and classify their failures as
//! [`HandlerError::Transient`] (retried) or [`HandlerError::Malformed`]
//! (dropped).

mod commit;
mod config;
mod dependency;
mod element;
mod envelope;
mod error;
mod identity;
mod manager;
mod pool;
mod registry;
mod stats;
pub mod transport;
mod version;

pub use commit::{Acknowledger, CommitTracker, NoopAcknowledger};
pub use config::{max_workers, EngineConfig, WORKERS_PER_CPU};
pub use dependency::{Dependency, DependencyCheck, MatchPolicy};
pub use element::{AdmitOutcome, ElementState, RejectReason};
pub use envelope::{Envelope, SyncMode, TransportPosition};
pub use error::{Error, HandlerError, Result};
pub use identity::{ElementKey, EventType, SourceId};
pub use manager::{ConflationManager, DispatchOutcome, DispatchReport};
pub use pool::WorkerPool;
pub use registry::{ConflationRegistry, Handler, HandlerContext, Registration, RegistryBuilder};
pub use stats::ManagerStats;
pub use transport::{pump, ChannelTransport, EnvelopeSender, PumpSummary, RecordingAcknowledger, Transport};
pub use version::BundleVersion;
