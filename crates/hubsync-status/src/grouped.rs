//! Grouped status sets
//!
//! A [`GroupedStatusSet`] maps each group key to its status buckets, and each
//! bucket to the members in that status. It is built for one reconciliation
//! pass, either from stored rows or from an incoming bundle, and thrown away
//! afterwards.

use crate::status::{GroupKey, MemberId, StatusRow, StatusValue};
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet};

/// Status buckets of one group
pub type Buckets<S> = BTreeMap<S, BTreeSet<MemberId>>;

/// key -> status -> members
///
/// A member is in at most one bucket per key: inserting it again moves it.
/// Keys keep insertion order, so passes over a set are deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedStatusSet<S: StatusValue> {
    groups: IndexMap<GroupKey, Buckets<S>>,
}

impl<S: StatusValue> Default for GroupedStatusSet<S> {
    fn default() -> Self {
        Self {
            groups: IndexMap::new(),
        }
    }
}

impl<S: StatusValue> GroupedStatusSet<S> {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Group rows by key and status
    pub fn from_rows<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a StatusRow<S>>,
    {
        let mut set = Self::new();
        for row in rows {
            set.insert(row.key.clone(), row.member.clone(), row.status);
        }
        set
    }

    /// Make sure `key` is present, even with no members
    ///
    /// An incoming bundle that lists a key with empty buckets says every
    /// stored member of that key is now in the default status.
    pub fn ensure_key(&mut self, key: GroupKey) -> &mut Buckets<S> {
        self.groups.entry(key).or_default()
    }

    /// Put `member` of `key` into the `status` bucket
    pub fn insert(&mut self, key: GroupKey, member: MemberId, status: S) {
        let buckets = self.ensure_key(key);
        for (bucket_status, members) in buckets.iter_mut() {
            if *bucket_status != status {
                members.remove(&member);
            }
        }
        buckets.retain(|_, members| !members.is_empty());
        buckets.entry(status).or_default().insert(member);
    }

    /// Insert every member of `members` into the `status` bucket of `key`
    pub fn extend<I>(&mut self, key: &GroupKey, status: S, members: I)
    where
        I: IntoIterator<Item = MemberId>,
    {
        self.ensure_key(key.clone());
        for member in members {
            self.insert(key.clone(), member, status);
        }
    }

    /// Status of one member, `None` if it is not in the set
    pub fn status_of(&self, key: &GroupKey, member: &MemberId) -> Option<S> {
        self.groups.get(key).and_then(|buckets| {
            buckets
                .iter()
                .find(|(_, members)| members.contains(member))
                .map(|(status, _)| *status)
        })
    }

    /// All members of `key`, whatever their status
    pub fn members(&self, key: &GroupKey) -> BTreeSet<MemberId> {
        self.groups
            .get(key)
            .map(|buckets| buckets.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// True if `key` has at least one member outside the default bucket
    pub fn has_non_default(&self, key: &GroupKey) -> bool {
        self.groups.get(key).map_or(false, |buckets| {
            buckets
                .iter()
                .any(|(status, members)| !status.is_default() && !members.is_empty())
        })
    }

    /// True if `key` is present
    pub fn contains_key(&self, key: &GroupKey) -> bool {
        self.groups.contains_key(key)
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    /// (key, buckets) pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &Buckets<S>)> {
        self.groups.iter()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// True if there are no keys
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of (key, member) entries
    pub fn member_count(&self) -> usize {
        self.groups
            .values()
            .flat_map(|buckets| buckets.values())
            .map(BTreeSet::len)
            .sum()
    }
}
