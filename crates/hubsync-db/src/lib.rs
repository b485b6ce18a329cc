//! Hubsync DB - Compliance status storage using native_db
//!
//! Provides a [`StatusRepository`](hubsync_status::StatusRepository) for
//! compliance rows:
//! - One row per (leaf hub, policy, cluster), never deleted
//! - Scoped scans and resets through a secondary key on (leaf hub, policy)
//! - Every `execute` call is one read-write transaction

mod error;
mod models;
mod store;

pub use error::{Error, Result};
pub use models::StoredComplianceRow;
pub use store::DbStatusRepository;
