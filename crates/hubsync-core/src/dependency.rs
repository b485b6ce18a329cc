//! Dependency declarations between event types
//!
//! A dependent event type (typically a delta bundle) may only be dispatched
//! for a source after its dependency (the matching complete bundle) has been
//! processed at the exact version the dependent was derived from.

use crate::identity::EventType;
use crate::version::BundleVersion;
use serde::{Deserialize, Serialize};

/// How a dependent's baseline is matched against its dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MatchPolicy {
    /// Baseline must equal the dependency's last processed version
    #[default]
    ExactMatch,
}

/// Result of evaluating a dependency for one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyCheck {
    /// Dispatch may proceed
    Satisfied,
    /// The dependency has not been processed at the required version yet
    Unsatisfied,
}

impl DependencyCheck {
    /// True if the dependency is satisfied
    pub fn is_satisfied(&self) -> bool {
        matches!(self, DependencyCheck::Satisfied)
    }
}

/// Rule: this event type requires `depends_on` to reach a version first
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// The event type that must be processed first
    pub depends_on: EventType,
    /// Matching rule for the baseline version
    pub match_policy: MatchPolicy,
}

impl Dependency {
    /// Create an exact-match dependency on `depends_on`
    pub fn exact(depends_on: impl Into<EventType>) -> Self {
        Self {
            depends_on: depends_on.into(),
            match_policy: MatchPolicy::ExactMatch,
        }
    }

    /// Evaluate the dependency
    ///
    /// * `baseline` - the dependent envelope's baseline version
    /// * `processed` - last processed version of the dependency for the same
    ///   source, `None` if nothing was processed yet
    pub fn check(
        &self,
        baseline: Option<BundleVersion>,
        processed: Option<BundleVersion>,
    ) -> DependencyCheck {
        match (self.match_policy, baseline, processed) {
            (MatchPolicy::ExactMatch, Some(baseline), Some(processed)) if baseline == processed => {
                DependencyCheck::Satisfied
            }
            _ => DependencyCheck::Unsatisfied,
        }
    }
}
