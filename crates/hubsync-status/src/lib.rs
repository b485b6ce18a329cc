//! Hubsync Status - Snapshot reconciliation and status handlers
//!
//! This crate provides what the conflation engine's handlers run:
//! - A closed status vocabulary ([`StatusValue`], [`ComplianceStatus`])
//! - [`GroupedStatusSet`]: key -> status -> members, built per pass
//! - The set-diff engine ([`reconcile`]) for complete-state snapshots
//! - The [`StatusRepository`] interface with query and command objects, and
//!   an in-memory implementation
//! - Compliance bundles and the complete/delta handlers that apply them

mod bundle;
mod diff;
mod error;
mod grouped;
mod handler;
mod memory;
mod repository;
mod status;

pub use bundle::{ComplianceBundle, DeltaComplianceBundle, PolicyStatus, StatusChange};
pub use diff::{reconcile, ReconcilePlan};
pub use error::{Error, Result, StoreError};
pub use grouped::{Buckets, GroupedStatusSet};
pub use handler::{CompleteStateHandler, DeltaStateHandler};
pub use memory::InMemoryStatusRepository;
pub use repository::{ResetPredicate, StatusCommand, StatusQuery, StatusRepository, WriteSummary};
pub use status::{ComplianceStatus, GroupKey, MemberId, RowId, StatusRow, StatusValue};
