//! Set-diff engine for complete-state snapshots
//!
//! Given the rows stored for one source and the snapshot that source just
//! reported, [`reconcile`] computes the smallest set of writes that makes the
//! store match the snapshot:
//!
//! 1. A member listed in an explicit bucket is written only if its stored
//!    status differs.
//! 2. A stored member of a listed key that appears in no explicit bucket is
//!    implicitly default, and is written only if it is not stored as default.
//! 3. A stored key missing from the snapshot is reset to default as a whole,
//!    unless all its rows are default already.
//!
//! Rows are never deleted. Applying the plan and reconciling the same
//! snapshot again yields an empty plan.
//!
//! ```
//! use hubsync_status::{reconcile, ComplianceStatus::*, GroupKey, GroupedStatusSet, StatusRow};
//!
//! let stored = GroupedStatusSet::from_rows(&[
//!     StatusRow::new("hub1", "p1", "a", NonCompliant),
//!     StatusRow::new("hub1", "p1", "b", Compliant),
//! ]);
//!
//! let mut incoming = GroupedStatusSet::new();
//! incoming.extend(&GroupKey::new("p1"), NonCompliant, ["a".into()]);
//!
//! let plan = reconcile(&"hub1".into(), &incoming, &stored);
//! assert!(plan.is_empty());
//! ```

use crate::grouped::GroupedStatusSet;
use crate::repository::{ResetPredicate, StatusCommand};
use crate::status::{StatusRow, StatusValue};
use hubsync_core::SourceId;

/// Writes needed to bring stored rows in line with a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan<S> {
    /// Rows to insert or overwrite
    pub upserts: Vec<StatusRow<S>>,
    /// Keys to reset to the default status
    pub resets: Vec<ResetPredicate>,
}

impl<S> Default for ReconcilePlan<S> {
    fn default() -> Self {
        Self {
            upserts: Vec::new(),
            resets: Vec::new(),
        }
    }
}

impl<S: StatusValue> ReconcilePlan<S> {
    /// True if nothing needs to be written
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.resets.is_empty()
    }

    /// Commands for one repository transaction
    pub fn into_commands(self) -> Vec<StatusCommand<S>> {
        let mut commands = Vec::with_capacity(1 + self.resets.len());
        if !self.upserts.is_empty() {
            commands.push(StatusCommand::UpsertBatch(self.upserts));
        }
        commands.extend(self.resets.into_iter().map(StatusCommand::ResetToDefaultWhere));
        commands
    }
}

/// Compute the writes that make `stored` match `incoming` for `source`
///
/// `stored` must hold the rows of `source` only.
pub fn reconcile<S: StatusValue>(
    source: &SourceId,
    incoming: &GroupedStatusSet<S>,
    stored: &GroupedStatusSet<S>,
) -> ReconcilePlan<S> {
    let mut plan = ReconcilePlan::default();

    for (key, buckets) in incoming.iter() {
        let mut remaining = stored.members(key);

        for (status, members) in buckets {
            for member in members {
                remaining.remove(member);
                if stored.status_of(key, member) != Some(*status) {
                    plan.upserts.push(StatusRow {
                        source: source.clone(),
                        key: key.clone(),
                        member: member.clone(),
                        status: *status,
                    });
                }
            }
        }

        // Stored but unlisted: back to default
        for member in remaining {
            if stored.status_of(key, &member) != Some(S::DEFAULT) {
                plan.upserts.push(StatusRow {
                    source: source.clone(),
                    key: key.clone(),
                    member,
                    status: S::DEFAULT,
                });
            }
        }
    }

    for key in stored.keys() {
        if !incoming.contains_key(key) && stored.has_non_default(key) {
            plan.resets.push(ResetPredicate {
                source: source.clone(),
                key: Some(key.clone()),
            });
        }
    }

    plan
}
