//! Compliance handlers for the conflation manager
//!
//! [`CompleteStateHandler`] reconciles a full [`ComplianceBundle`] against the
//! rows stored for the reporting leaf hub. [`DeltaStateHandler`] applies a
//! [`DeltaComplianceBundle`] as conditional updates. Each invocation writes in
//! one repository transaction, so a transient failure leaves nothing behind
//! and the retried envelope starts from the same stored state.

use crate::bundle::{ComplianceBundle, DeltaComplianceBundle};
use crate::diff::reconcile;
use crate::repository::{StatusCommand, StatusQuery, StatusRepository};
use crate::status::ComplianceStatus;
use hubsync_core::{Handler, HandlerContext, HandlerError};
use std::sync::Arc;
use tracing::debug;

/// Applies complete compliance snapshots
pub struct CompleteStateHandler<R> {
    repository: Arc<R>,
}

impl<R> CompleteStateHandler<R>
where
    R: StatusRepository<ComplianceStatus>,
{
    /// Create a handler writing to `repository`
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }
}

impl<R> Handler for CompleteStateHandler<R>
where
    R: StatusRepository<ComplianceStatus>,
{
    fn handle(&self, ctx: &HandlerContext, payload: &[u8]) -> Result<(), HandlerError> {
        let bundle = ComplianceBundle::decode(payload)?;
        let incoming = bundle.to_grouped();
        let stored = self.repository.load(&StatusQuery::source(ctx.source.clone()))?;

        let plan = reconcile(&ctx.source, &incoming, &stored);
        if plan.is_empty() {
            debug!(source = %ctx.source, version = %ctx.version, "snapshot unchanged");
            return Ok(());
        }

        let upserts = plan.upserts.len();
        let resets = plan.resets.len();
        let summary = self.repository.execute(plan.into_commands())?;
        debug!(
            source = %ctx.source,
            version = %ctx.version,
            upserts,
            resets,
            rows_written = summary.rows_written(),
            "snapshot reconciled"
        );
        Ok(())
    }
}

/// Applies compliance deltas
pub struct DeltaStateHandler<R> {
    repository: Arc<R>,
}

impl<R> DeltaStateHandler<R>
where
    R: StatusRepository<ComplianceStatus>,
{
    /// Create a handler writing to `repository`
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }
}

impl<R> Handler for DeltaStateHandler<R>
where
    R: StatusRepository<ComplianceStatus>,
{
    fn handle(&self, ctx: &HandlerContext, payload: &[u8]) -> Result<(), HandlerError> {
        let bundle = DeltaComplianceBundle::decode(payload)?;
        if bundle.events.is_empty() {
            return Ok(());
        }

        let rows = bundle.to_rows(&ctx.source);
        let summary = self
            .repository
            .execute(vec![StatusCommand::UpdateIfChanged(rows)])?;
        debug!(
            source = %ctx.source,
            version = %ctx.version,
            baseline = ?ctx.baseline,
            changed = summary.upserted,
            unchanged = summary.unchanged,
            "delta applied"
        );
        Ok(())
    }
}
