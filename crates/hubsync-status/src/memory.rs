//! In-memory status repository
//!
//! Reference backend for tests and embedders without a database. Each
//! `execute` works on a copy of the table and swaps it in only when every
//! command succeeded.

use crate::error::StoreError;
use crate::grouped::GroupedStatusSet;
use crate::repository::{StatusCommand, StatusQuery, StatusRepository, WriteSummary};
use crate::status::{GroupKey, MemberId, StatusRow, StatusValue};
use hubsync_core::SourceId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

type Table<S> = BTreeMap<(SourceId, GroupKey, MemberId), S>;

/// Status rows held in a `BTreeMap`
#[derive(Debug)]
pub struct InMemoryStatusRepository<S: StatusValue> {
    rows: Mutex<Table<S>>,
    transactions: AtomicU64,
    rows_written: AtomicU64,
    /// Number of upcoming `execute` calls that fail transiently
    failures: AtomicU64,
}

impl<S: StatusValue> Default for InMemoryStatusRepository<S> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            transactions: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

impl<S: StatusValue> InMemoryStatusRepository<S> {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table<S>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert rows directly, bypassing counters
    pub fn seed<I>(&self, rows: I)
    where
        I: IntoIterator<Item = StatusRow<S>>,
    {
        let mut table = self.table();
        for row in rows {
            table.insert((row.source, row.key, row.member), row.status);
        }
    }

    /// Every stored row, ordered by (source, key, member)
    pub fn rows(&self) -> Vec<StatusRow<S>> {
        self.table()
            .iter()
            .map(|((source, key, member), status)| StatusRow {
                source: source.clone(),
                key: key.clone(),
                member: member.clone(),
                status: *status,
            })
            .collect()
    }

    /// Stored status of one row
    pub fn status(&self, source: &str, key: &str, member: &str) -> Option<S> {
        self.table()
            .get(&(SourceId::new(source), GroupKey::new(key), MemberId::new(member)))
            .copied()
    }

    /// Committed transactions
    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::SeqCst)
    }

    /// Rows written by committed transactions
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::SeqCst)
    }

    /// Make the next `count` calls to `execute` fail with a transient error
    pub fn fail_next(&self, count: u64) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn apply<S: StatusValue>(table: &mut Table<S>, command: StatusCommand<S>, summary: &mut WriteSummary) {
    match command {
        StatusCommand::UpsertBatch(rows) => {
            for row in rows {
                table.insert((row.source, row.key, row.member), row.status);
                summary.upserted += 1;
            }
        }
        StatusCommand::UpdateIfChanged(rows) => {
            for row in rows {
                let id = (row.source, row.key, row.member);
                if table.get(&id) == Some(&row.status) {
                    summary.unchanged += 1;
                } else {
                    table.insert(id, row.status);
                    summary.upserted += 1;
                }
            }
        }
        StatusCommand::ResetToDefaultWhere(predicate) => {
            for ((source, key, _), status) in table.iter_mut() {
                if !predicate.matches(source, key) {
                    continue;
                }
                if status.is_default() {
                    summary.unchanged += 1;
                } else {
                    *status = S::DEFAULT;
                    summary.reset += 1;
                }
            }
        }
    }
}

impl<S: StatusValue> StatusRepository<S> for InMemoryStatusRepository<S> {
    fn load(&self, query: &StatusQuery) -> Result<GroupedStatusSet<S>, StoreError> {
        let table = self.table();
        let mut set = GroupedStatusSet::new();
        let from = (query.source.clone(), GroupKey::new(""), MemberId::new(""));
        for ((source, key, member), status) in table.range(from..) {
            if source != &query.source {
                break;
            }
            if query.matches(source, key) {
                set.insert(key.clone(), member.clone(), *status);
            }
        }
        Ok(set)
    }

    fn execute(&self, commands: Vec<StatusCommand<S>>) -> Result<WriteSummary, StoreError> {
        if self.take_failure() {
            return Err(StoreError::transient("injected failure"));
        }

        let mut table = self.table();
        let mut staged = table.clone();
        let mut summary = WriteSummary::default();
        for command in commands {
            apply(&mut staged, command, &mut summary);
        }
        *table = staged;

        self.transactions.fetch_add(1, Ordering::SeqCst);
        self.rows_written
            .fetch_add(summary.rows_written() as u64, Ordering::SeqCst);
        Ok(summary)
    }
}
