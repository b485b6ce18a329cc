//! Compliance bundle payloads
//!
//! Leaf hubs publish two bundle kinds for policy compliance:
//! - [`ComplianceBundle`]: the complete state. Lists, per policy, the
//!   clusters that are not compliant; every other cluster is compliant.
//! - [`DeltaComplianceBundle`]: individual status changes since the
//!   complete bundle it was derived from.
//!
//! Both travel as `bincode`.

use crate::error::Result;
use crate::grouped::GroupedStatusSet;
use crate::status::{ComplianceStatus, GroupKey, MemberId, StatusRow};
use hubsync_core::SourceId;
use serde::{Deserialize, Serialize};

/// Explicit status buckets of one policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatus {
    pub policy_id: String,
    pub non_compliant: Vec<String>,
    pub unknown: Vec<String>,
    pub pending: Vec<String>,
}

impl PolicyStatus {
    /// Create a policy entry with empty buckets (every cluster compliant)
    pub fn new(policy_id: impl Into<String>) -> Self {
        Self {
            policy_id: policy_id.into(),
            ..Self::default()
        }
    }

    /// Add non-compliant clusters
    pub fn non_compliant<I, T>(mut self, clusters: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.non_compliant.extend(clusters.into_iter().map(Into::into));
        self
    }

    /// Add clusters in unknown state
    pub fn unknown<I, T>(mut self, clusters: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.unknown.extend(clusters.into_iter().map(Into::into));
        self
    }

    /// Add clusters still pending evaluation
    pub fn pending<I, T>(mut self, clusters: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.pending.extend(clusters.into_iter().map(Into::into));
        self
    }
}

/// Complete compliance state of one leaf hub
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceBundle {
    pub policies: Vec<PolicyStatus>,
}

impl ComplianceBundle {
    /// Create a bundle
    pub fn new(policies: Vec<PolicyStatus>) -> Self {
        Self { policies }
    }

    /// Encode for the transport
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a transport payload
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Explicit buckets as a grouped set
    ///
    /// Every listed policy is present, even with empty buckets. A policy listed
    /// twice is merged; a cluster listed in several buckets ends up in the last
    /// one (non-compliant, unknown, pending).
    pub fn to_grouped(&self) -> GroupedStatusSet<ComplianceStatus> {
        let mut set = GroupedStatusSet::new();
        for policy in &self.policies {
            let key = GroupKey::new(policy.policy_id.clone());
            set.ensure_key(key.clone());
            let buckets = [
                (ComplianceStatus::NonCompliant, &policy.non_compliant),
                (ComplianceStatus::Unknown, &policy.unknown),
                (ComplianceStatus::Pending, &policy.pending),
            ];
            for (status, clusters) in buckets {
                set.extend(&key, status, clusters.iter().cloned().map(MemberId::from));
            }
        }
        set
    }
}

/// One status change in a delta bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub policy_id: String,
    pub cluster: String,
    pub status: ComplianceStatus,
}

impl StatusChange {
    /// Create a status change
    pub fn new(policy_id: impl Into<String>, cluster: impl Into<String>, status: ComplianceStatus) -> Self {
        Self {
            policy_id: policy_id.into(),
            cluster: cluster.into(),
            status,
        }
    }
}

/// Compliance changes of one leaf hub since a complete bundle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaComplianceBundle {
    pub events: Vec<StatusChange>,
}

impl DeltaComplianceBundle {
    /// Create a bundle
    pub fn new(events: Vec<StatusChange>) -> Self {
        Self { events }
    }

    /// Encode for the transport
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a transport payload
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Changes as rows of `source`, in bundle order
    pub fn to_rows(&self, source: &SourceId) -> Vec<StatusRow<ComplianceStatus>> {
        self.events
            .iter()
            .map(|event| StatusRow {
                source: source.clone(),
                key: GroupKey::new(event.policy_id.clone()),
                member: MemberId::new(event.cluster.clone()),
                status: event.status,
            })
            .collect()
    }
}
