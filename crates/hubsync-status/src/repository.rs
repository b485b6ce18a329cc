//! Repository interface for status rows
//!
//! Handlers never talk to a database directly. They read a
//! [`GroupedStatusSet`] through a [`StatusQuery`] and write through a batch of
//! [`StatusCommand`]s. One `execute` call is one transaction: either every
//! command is applied or none is.

use crate::error::StoreError;
use crate::grouped::GroupedStatusSet;
use crate::status::{GroupKey, StatusRow, StatusValue};
use hubsync_core::SourceId;
use std::collections::BTreeSet;
use std::ops::AddAssign;

/// Rows to load for one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusQuery {
    /// Only rows of this source
    pub source: SourceId,
    /// Only these keys; `None` loads every key of the source
    pub keys: Option<BTreeSet<GroupKey>>,
}

impl StatusQuery {
    /// Every row of `source`
    pub fn source(source: impl Into<SourceId>) -> Self {
        Self {
            source: source.into(),
            keys: None,
        }
    }

    /// Restrict the query to `keys`
    pub fn with_keys<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = GroupKey>,
    {
        self.keys = Some(keys.into_iter().collect());
        self
    }

    /// True if a row at (`source`, `key`) is selected
    pub fn matches(&self, source: &SourceId, key: &GroupKey) -> bool {
        &self.source == source && self.keys.as_ref().map_or(true, |keys| keys.contains(key))
    }
}

/// Rows a reset applies to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResetPredicate {
    /// Rows of this source only
    pub source: SourceId,
    /// Rows of this key only; `None` resets every key of the source
    pub key: Option<GroupKey>,
}

impl ResetPredicate {
    /// Every row of `key` at `source`
    pub fn key(source: impl Into<SourceId>, key: impl Into<GroupKey>) -> Self {
        Self {
            source: source.into(),
            key: Some(key.into()),
        }
    }

    /// Every row of `source`
    pub fn source(source: impl Into<SourceId>) -> Self {
        Self {
            source: source.into(),
            key: None,
        }
    }

    /// True if the row at (`source`, `key`) is covered
    pub fn matches(&self, source: &SourceId, key: &GroupKey) -> bool {
        &self.source == source && self.key.as_ref().map_or(true, |k| k == key)
    }
}

/// One write inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCommand<S> {
    /// Insert or overwrite every row
    UpsertBatch(Vec<StatusRow<S>>),
    /// Set every matching row to the default status (rows are kept)
    ResetToDefaultWhere(ResetPredicate),
    /// Insert missing rows and overwrite rows whose status differs
    UpdateIfChanged(Vec<StatusRow<S>>),
}

/// Rows touched by one transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Rows inserted or overwritten
    pub upserted: usize,
    /// Rows reset to the default status
    pub reset: usize,
    /// Rows left alone because they already had the requested status
    pub unchanged: usize,
}

impl WriteSummary {
    /// Rows whose stored value changed or was rewritten
    pub fn rows_written(&self) -> usize {
        self.upserted + self.reset
    }
}

impl AddAssign for WriteSummary {
    fn add_assign(&mut self, other: Self) {
        self.upserted += other.upserted;
        self.reset += other.reset;
        self.unchanged += other.unchanged;
    }
}

/// Storage of status rows for one vocabulary
pub trait StatusRepository<S: StatusValue>: Send + Sync {
    /// Load the rows selected by `query`, grouped by key and status
    fn load(&self, query: &StatusQuery) -> Result<GroupedStatusSet<S>, StoreError>;

    /// Apply `commands` in order inside one transaction
    fn execute(&self, commands: Vec<StatusCommand<S>>) -> Result<WriteSummary, StoreError>;
}

impl<S, R> StatusRepository<S> for std::sync::Arc<R>
where
    S: StatusValue,
    R: StatusRepository<S> + ?Sized,
{
    fn load(&self, query: &StatusQuery) -> Result<GroupedStatusSet<S>, StoreError> {
        (**self).load(query)
    }

    fn execute(&self, commands: Vec<StatusCommand<S>>) -> Result<WriteSummary, StoreError> {
        (**self).execute(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_matches_source_and_keys() {
        let hub1 = SourceId::new("hub1");
        let hub2 = SourceId::new("hub2");
        let p1 = GroupKey::new("p1");
        let p2 = GroupKey::new("p2");

        let all = StatusQuery::source("hub1");
        assert!(all.matches(&hub1, &p1));
        assert!(!all.matches(&hub2, &p1));

        let only_p1 = StatusQuery::source("hub1").with_keys([p1.clone()]);
        assert!(only_p1.matches(&hub1, &p1));
        assert!(!only_p1.matches(&hub1, &p2));
    }

    #[test]
    fn test_reset_predicate_scope() {
        let hub1 = SourceId::new("hub1");
        let p1 = GroupKey::new("p1");
        let p2 = GroupKey::new("p2");

        let reset_key = ResetPredicate::key("hub1", "p1");
        assert!(reset_key.matches(&hub1, &p1));
        assert!(!reset_key.matches(&hub1, &p2));
        assert!(!reset_key.matches(&SourceId::new("hub2"), &p1));

        assert!(ResetPredicate::source("hub1").matches(&hub1, &p2));
    }

    #[test]
    fn test_summary_accumulates() {
        let mut total = WriteSummary::default();
        total += WriteSummary {
            upserted: 2,
            reset: 1,
            unchanged: 0,
        };
        total += WriteSummary {
            upserted: 1,
            reset: 0,
            unchanged: 4,
        };
        assert_eq!(total.rows_written(), 4);
        assert_eq!(total.unchanged, 4);
    }
}
