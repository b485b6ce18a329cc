//! Envelopes - one status bundle from one leaf hub as it comes off the transport

use crate::identity::{ElementKey, EventType, SourceId};
use crate::version::BundleVersion;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a bundle describes state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Full snapshot: absence of a member means it reverted to the default status
    Complete,
    /// Incremental change: absence means no change
    Delta,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Complete => write!(f, "complete"),
            SyncMode::Delta => write!(f, "delta"),
        }
    }
}

/// Position of an envelope on the transport
///
/// Offsets are ordered within a partition only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransportPosition {
    /// Transport partition
    pub partition: u32,
    /// Offset within the partition
    pub offset: u64,
}

impl TransportPosition {
    /// Create a new position
    pub fn new(partition: u32, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for TransportPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// One unit of status data for one event type from one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event type of the bundle
    pub event_type: EventType,
    /// Leaf hub that produced the bundle
    pub source: SourceId,
    /// Bundle version within (source, event_type)
    pub version: BundleVersion,
    /// Complete or delta
    pub sync_mode: SyncMode,
    /// Version of the dependency bundle this one was derived from (delta only)
    pub baseline: Option<BundleVersion>,
    /// Where the envelope sits on the transport
    pub position: TransportPosition,
    /// Encoded bundle body, interpreted only by the handler
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create a complete-state envelope
    pub fn complete(
        source: impl Into<SourceId>,
        event_type: impl Into<EventType>,
        version: impl Into<BundleVersion>,
        position: TransportPosition,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            version: version.into(),
            sync_mode: SyncMode::Complete,
            baseline: None,
            position,
            payload,
        }
    }

    /// Create a delta-state envelope derived from `baseline` of its dependency
    pub fn delta(
        source: impl Into<SourceId>,
        event_type: impl Into<EventType>,
        version: impl Into<BundleVersion>,
        baseline: impl Into<BundleVersion>,
        position: TransportPosition,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            version: version.into(),
            sync_mode: SyncMode::Delta,
            baseline: Some(baseline.into()),
            position,
            payload,
        }
    }

    /// Key of the conflation element this envelope belongs to
    pub fn key(&self) -> ElementKey {
        ElementKey {
            source: self.source.clone(),
            event_type: self.event_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_envelope() {
        let env = Envelope::complete("hub1", "policies", 3, TransportPosition::new(0, 9), vec![1]);
        assert_eq!(env.sync_mode, SyncMode::Complete);
        assert_eq!(env.baseline, None);
        assert_eq!(env.key(), ElementKey::new("hub1", "policies"));
    }

    #[test]
    fn test_delta_envelope() {
        let env = Envelope::delta("hub1", "policies.delta", 5, 3, TransportPosition::new(1, 2), vec![]);
        assert_eq!(env.sync_mode, SyncMode::Delta);
        assert_eq!(env.baseline, Some(BundleVersion::from(3)));
        assert_eq!(format!("{}", env.position), "1@2");
    }
}
