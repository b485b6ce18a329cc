//! Bundle versions
//!
//! A [`BundleVersion`] is a generation counter owned by one
//! (source, event type) pair. Leaf hubs increment it on every observable
//! change; the manager never dispatches a version that is not strictly
//! greater than the last one it processed for the same key.
//!
//! Versions from different sources or event types are unrelated, so the
//! manager never compares them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Monotonic generation counter scoped to one (source, event type)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleVersion(u64);

impl BundleVersion {
    /// The initial version (generation 0)
    pub const INITIAL: BundleVersion = BundleVersion(0);

    /// Create the initial version
    pub fn new() -> Self {
        Self::INITIAL
    }

    /// Create a version from a raw generation
    pub fn from_generation(generation: u64) -> Self {
        Self(generation)
    }

    /// Get the raw generation
    pub fn generation(&self) -> u64 {
        self.0
    }

    /// Advance to the next generation
    ///
    /// Saturates at `u64::MAX`; a producer that far along cannot be
    /// distinguished from a stuck one anyway.
    pub fn increment(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    /// Compare two versions of the same (source, event type)
    pub fn compare(&self, other: &BundleVersion) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for BundleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for BundleVersion {
    fn from(generation: u64) -> Self {
        Self(generation)
    }
}
