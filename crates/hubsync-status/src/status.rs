//! Status vocabulary and row identity
//!
//! A status row says "member M of group K at source S is in status V".
//! Vocabularies are closed enums implementing [`StatusValue`], which names the
//! implicit default every unlisted member falls back to.

use crate::error::Error;
use hubsync_core::SourceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

/// A closed, finite status vocabulary
pub trait StatusValue:
    Copy + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Status of a member that is not listed in any explicit bucket
    const DEFAULT: Self;

    /// True if this is the implicit default
    fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }
}

/// Compliance of one cluster against one policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ComplianceStatus {
    Compliant,
    NonCompliant,
    Unknown,
    Pending,
}

impl ComplianceStatus {
    /// Every status, in bucket order
    pub const ALL: [ComplianceStatus; 4] = [
        ComplianceStatus::Compliant,
        ComplianceStatus::NonCompliant,
        ComplianceStatus::Unknown,
        ComplianceStatus::Pending,
    ];

    /// Stored name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Compliant => "compliant",
            ComplianceStatus::NonCompliant => "non_compliant",
            ComplianceStatus::Unknown => "unknown",
            ComplianceStatus::Pending => "pending",
        }
    }
}

impl StatusValue for ComplianceStatus {
    const DEFAULT: Self = ComplianceStatus::Compliant;
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ComplianceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::UnknownStatus(s.to_string()))
    }
}

/// Logical grouping key of status rows (e.g. a policy ID)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(pub String);

impl GroupKey {
    /// Create a new group key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for GroupKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Member identifier inside a group (e.g. a managed cluster name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub String);

impl MemberId {
    /// Create a new member ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MemberId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for MemberId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One stored status row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatusRow<S> {
    /// Leaf hub that reported the row
    pub source: SourceId,
    /// Group the row belongs to
    pub key: GroupKey,
    /// Member the status is about
    pub member: MemberId,
    /// Current status
    pub status: S,
}

impl<S: StatusValue> StatusRow<S> {
    /// Create a row
    pub fn new(
        source: impl Into<SourceId>,
        key: impl Into<GroupKey>,
        member: impl Into<MemberId>,
        status: S,
    ) -> Self {
        Self {
            source: source.into(),
            key: key.into(),
            member: member.into(),
            status,
        }
    }

    /// Identity of the row, without its status
    pub fn id(&self) -> RowId {
        RowId {
            source: self.source.clone(),
            key: self.key.clone(),
            member: self.member.clone(),
        }
    }
}

/// Identity of a status row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId {
    pub source: SourceId,
    pub key: GroupKey,
    pub member: MemberId,
}
