//! Database store wrapper.

use crate::error::{Error, Result};
use crate::models::*;
use hubsync_core::SourceId;
use hubsync_status::{
    ComplianceStatus, GroupKey, GroupedStatusSet, ResetPredicate, StatusCommand, StatusQuery,
    StatusRepository, StatusRow, StatusValue, StoreError, WriteSummary,
};
use native_db::transaction::RwTransaction;
use native_db::*;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

// Static models for the database
static MODELS: LazyLock<std::result::Result<Models, String>> = LazyLock::new(|| -> std::result::Result<Models, String> {
    let mut models = Models::new();
    models
        .define::<StoredComplianceRow>()
        .map_err(|e| e.to_string())?;
    Ok(models)
});

fn models() -> Result<&'static Models> {
    MODELS.as_ref().map_err(|e| Error::Database(e.clone()))
}

/// Compliance rows stored with native_db.
pub struct DbStatusRepository {
    pub(crate) db: Database<'static>,
}

impl DbStatusRepository {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Builder::new()
            .create(models()?, path.as_ref())
            .map_err(|e| Error::Database(e.to_string()))?;
        info!(path = %path.as_ref().display(), "compliance store opened");
        Ok(Self { db })
    }

    /// Create an in-memory database.
    pub fn in_memory() -> Result<Self> {
        let db = Builder::new()
            .create_in_memory(models()?)
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(Self { db })
    }

    /// Load every row of `source`.
    pub fn rows_for_source(&self, source: &SourceId) -> Result<Vec<StatusRow<ComplianceStatus>>> {
        let r = self.db.r_transaction()?;
        let scan = r
            .scan()
            .secondary::<StoredComplianceRow>(StoredComplianceRowKey::scope)?;
        let prefix = source_prefix(source);
        let iter = scan.start_with(prefix.as_str())?;
        let stored: std::result::Result<Vec<StoredComplianceRow>, _> = iter.collect();
        let stored = stored.map_err(|e| Error::Database(e.to_string()))?;
        stored.iter().map(StoredComplianceRow::to_row).collect()
    }

    /// Count all stored rows.
    pub fn count_rows(&self) -> Result<usize> {
        let r = self.db.r_transaction()?;
        let scan = r.scan().primary::<StoredComplianceRow>()?;
        let iter = scan.all()?;
        Ok(iter.count())
    }

    /// Apply `commands` in one read-write transaction.
    ///
    /// The transaction is committed only if every command succeeded.
    pub fn apply(&self, commands: Vec<StatusCommand<ComplianceStatus>>) -> Result<WriteSummary> {
        let rw = self.db.rw_transaction()?;
        let mut summary = WriteSummary::default();

        for command in commands {
            match command {
                StatusCommand::UpsertBatch(rows) => {
                    for row in &rows {
                        rw.upsert(StoredComplianceRow::from_row(row)?)?;
                        summary.upserted += 1;
                    }
                }
                StatusCommand::UpdateIfChanged(rows) => {
                    for row in &rows {
                        let id = row_key(&row.source, &row.key, &row.member);
                        let existing: Option<StoredComplianceRow> = rw.get().primary(id)?;
                        match existing {
                            Some(stored) if stored.parsed_status()? == row.status => {
                                summary.unchanged += 1;
                            }
                            _ => {
                                rw.upsert(StoredComplianceRow::from_row(row)?)?;
                                summary.upserted += 1;
                            }
                        }
                    }
                }
                StatusCommand::ResetToDefaultWhere(predicate) => {
                    reset_where(&rw, &predicate, &mut summary)?;
                }
            }
        }

        rw.commit()?;
        debug!(
            upserted = summary.upserted,
            reset = summary.reset,
            unchanged = summary.unchanged,
            "compliance transaction committed"
        );
        Ok(summary)
    }
}

fn reset_where(
    rw: &RwTransaction<'_>,
    predicate: &ResetPredicate,
    summary: &mut WriteSummary,
) -> Result<()> {
    let prefix = match &predicate.key {
        Some(key) => scope_key(&predicate.source, key),
        None => source_prefix(&predicate.source),
    };

    let candidates: Vec<StoredComplianceRow> = {
        let scan = rw
            .scan()
            .secondary::<StoredComplianceRow>(StoredComplianceRowKey::scope)?;
        let iter = scan.start_with(prefix.as_str())?;
        let stored: std::result::Result<Vec<StoredComplianceRow>, _> = iter.collect();
        stored.map_err(|e| Error::Database(e.to_string()))?
    };

    for mut stored in candidates {
        // A key prefix also matches longer keys ("p1" vs "p10")
        let source = SourceId::new(stored.source.clone());
        let key = GroupKey::new(stored.policy_id.clone());
        if !predicate.matches(&source, &key) {
            continue;
        }
        if stored.parsed_status()?.is_default() {
            summary.unchanged += 1;
            continue;
        }
        stored.set_status(ComplianceStatus::DEFAULT);
        rw.upsert(stored)?;
        summary.reset += 1;
    }
    Ok(())
}

impl StatusRepository<ComplianceStatus> for DbStatusRepository {
    fn load(&self, query: &StatusQuery) -> std::result::Result<GroupedStatusSet<ComplianceStatus>, StoreError> {
        let rows = self.rows_for_source(&query.source)?;
        let mut set = GroupedStatusSet::new();
        for row in rows {
            if query.matches(&row.source, &row.key) {
                set.insert(row.key, row.member, row.status);
            }
        }
        Ok(set)
    }

    fn execute(
        &self,
        commands: Vec<StatusCommand<ComplianceStatus>>,
    ) -> std::result::Result<WriteSummary, StoreError> {
        Ok(self.apply(commands)?)
    }
}

impl std::fmt::Debug for DbStatusRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbStatusRepository").finish_non_exhaustive()
    }
}
