//! Compliance row model.

use crate::error::{Error, Result};
use hubsync_core::SourceId;
use hubsync_status::{ComplianceStatus, GroupKey, MemberId, StatusRow};
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

/// Separates the parts of composite keys. Names containing it are rejected.
const SEPARATOR: char = '\u{1f}';

fn checked(name: &str) -> Result<String> {
    if name.contains(SEPARATOR) {
        return Err(Error::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(name.to_string())
}

/// Scope key of every row of `source`.
pub(crate) fn source_prefix(source: &SourceId) -> String {
    format!("{}{}", source, SEPARATOR)
}

/// Scope key of every row of (`source`, `policy`).
pub(crate) fn scope_key(source: &SourceId, policy: &GroupKey) -> String {
    format!("{}{}{}", source, SEPARATOR, policy)
}

/// Primary key of one row.
pub(crate) fn row_key(source: &SourceId, policy: &GroupKey, cluster: &MemberId) -> String {
    format!("{}{}{}{}{}", source, SEPARATOR, policy, SEPARATOR, cluster)
}

/// Stored compliance of one cluster against one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[native_model(id = 1, version = 1)]
#[native_db]
pub struct StoredComplianceRow {
    /// Primary key - source, policy and cluster.
    #[primary_key]
    pub id: String,
    /// Source and policy, for scoped scans and resets.
    #[secondary_key]
    pub scope: String,
    /// Leaf hub that reported the row.
    pub source: String,
    /// Policy ID.
    pub policy_id: String,
    /// Cluster name.
    pub cluster: String,
    /// Status name (see `ComplianceStatus::as_str`).
    pub status: String,
}

impl StoredComplianceRow {
    /// Create from a status row.
    ///
    /// Fails with [`Error::InvalidName`] if any name contains the key
    /// separator.
    pub fn from_row(row: &StatusRow<ComplianceStatus>) -> Result<Self> {
        Ok(Self {
            source: checked(row.source.as_str())?,
            policy_id: checked(row.key.as_str())?,
            cluster: checked(row.member.as_str())?,
            id: row_key(&row.source, &row.key, &row.member),
            scope: scope_key(&row.source, &row.key),
            status: row.status.as_str().to_string(),
        })
    }

    /// Convert to a status row.
    pub fn to_row(&self) -> Result<StatusRow<ComplianceStatus>> {
        let status = self
            .status
            .parse::<ComplianceStatus>()
            .map_err(|e| Error::Corrupt {
                id: self.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(StatusRow::new(
            self.source.as_str(),
            self.policy_id.as_str(),
            self.cluster.as_str(),
            status,
        ))
    }

    /// Stored status, parsed.
    pub fn parsed_status(&self) -> Result<ComplianceStatus> {
        Ok(self.to_row()?.status)
    }

    /// Replace the status.
    pub fn set_status(&mut self, status: ComplianceStatus) {
        self.status = status.as_str().to_string();
    }
}
