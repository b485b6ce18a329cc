//! Transport commit tracking
//!
//! A single transport partition interleaves envelopes from every leaf hub and
//! event type, and they finish out of order. Acknowledging an offset commits
//! everything before it, so the tracker only acknowledges an offset once every
//! tracked envelope at or below it has been released.
//!
//! An envelope is released when its effect is durable (handler success), when
//! it turned out to be a no-op (stale), when a newer envelope that absorbed it
//! finishes, or when it was dropped as malformed.

use crate::envelope::TransportPosition;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

/// Receives acknowledged transport positions
///
/// `acknowledge(p)` means every envelope at or below `p.offset` in
/// `p.partition` is done and need not be redelivered.
pub trait Acknowledger: Send + Sync {
    /// Commit up to and including `position`
    fn acknowledge(&self, position: TransportPosition);
}

impl<F> Acknowledger for F
where
    F: Fn(TransportPosition) + Send + Sync,
{
    fn acknowledge(&self, position: TransportPosition) {
        self(position)
    }
}

/// Acknowledger that discards every position
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAcknowledger;

impl Acknowledger for NoopAcknowledger {
    fn acknowledge(&self, _position: TransportPosition) {}
}

#[derive(Debug, Default)]
struct PartitionProgress {
    /// Offsets admitted but not yet released, with multiplicity
    outstanding: BTreeMap<u64, usize>,
    /// Released offsets above the last acknowledgment
    released: BTreeSet<u64>,
    /// Last acknowledged offset
    acknowledged: Option<u64>,
}

impl PartitionProgress {
    fn track(&mut self, offset: u64) {
        *self.outstanding.entry(offset).or_insert(0) += 1;
    }

    fn release(&mut self, offset: u64) {
        match self.outstanding.get_mut(&offset) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.outstanding.remove(&offset);
                if self.acknowledged.map_or(true, |acked| offset > acked) {
                    self.released.insert(offset);
                }
            }
            None => {}
        }
    }

    /// Advance the acknowledgment to the highest released offset below the
    /// lowest outstanding one
    fn advance(&mut self) -> Option<u64> {
        let candidate = match self.outstanding.keys().next() {
            Some(&lowest) => self.released.range(..lowest).next_back().copied(),
            None => self.released.iter().next_back().copied(),
        }?;

        self.acknowledged = Some(candidate);
        self.released.retain(|&offset| offset > candidate);
        Some(candidate)
    }
}

/// Computes safe commit points per partition
#[derive(Debug, Default)]
pub struct CommitTracker {
    partitions: Mutex<HashMap<u32, PartitionProgress>>,
}

impl CommitTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an admitted envelope
    pub fn track(&self, position: TransportPosition) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions
            .entry(position.partition)
            .or_default()
            .track(position.offset);
    }

    /// Release finished envelopes
    ///
    /// Returns the positions that became safe to acknowledge, at most one per
    /// partition, in partition order.
    pub fn release<I>(&self, positions: I) -> Vec<TransportPosition>
    where
        I: IntoIterator<Item = TransportPosition>,
    {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut touched = BTreeSet::new();

        for position in positions {
            if let Some(progress) = partitions.get_mut(&position.partition) {
                progress.release(position.offset);
                touched.insert(position.partition);
            }
        }

        touched
            .into_iter()
            .filter_map(|partition| {
                partitions
                    .get_mut(&partition)
                    .and_then(PartitionProgress::advance)
                    .map(|offset| TransportPosition::new(partition, offset))
            })
            .collect()
    }

    /// Last acknowledged offset for a partition
    pub fn acknowledged(&self, partition: u32) -> Option<u64> {
        let partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions.get(&partition).and_then(|p| p.acknowledged)
    }

    /// Number of tracked envelopes not yet released
    pub fn outstanding(&self) -> usize {
        let partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions
            .values()
            .map(|p| p.outstanding.values().sum::<usize>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(offset: u64) -> TransportPosition {
        TransportPosition::new(0, offset)
    }

    #[test]
    fn test_in_order_release() {
        let tracker = CommitTracker::new();
        tracker.track(pos(1));
        tracker.track(pos(2));

        assert_eq!(tracker.release([pos(1)]), vec![pos(1)]);
        assert_eq!(tracker.release([pos(2)]), vec![pos(2)]);
        assert_eq!(tracker.acknowledged(0), Some(2));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_out_of_order_release_waits_for_gap() {
        let tracker = CommitTracker::new();
        for offset in 1..=3 {
            tracker.track(pos(offset));
        }

        // 2 and 3 finish first; 1 is still outstanding
        assert!(tracker.release([pos(3)]).is_empty());
        assert!(tracker.release([pos(2)]).is_empty());
        assert_eq!(tracker.acknowledged(0), None);

        // Releasing 1 commits through 3 in a single acknowledgment
        assert_eq!(tracker.release([pos(1)]), vec![pos(3)]);
    }

    #[test]
    fn test_partial_advance() {
        let tracker = CommitTracker::new();
        for offset in 10..=12 {
            tracker.track(pos(offset));
        }
        assert_eq!(tracker.release([pos(10), pos(12)]), vec![pos(10)]);
        assert_eq!(tracker.release([pos(11)]), vec![pos(12)]);
    }

    #[test]
    fn test_redelivered_offset_needs_two_releases() {
        let tracker = CommitTracker::new();
        tracker.track(pos(5));
        tracker.track(pos(5));

        assert!(tracker.release([pos(5)]).is_empty());
        assert_eq!(tracker.release([pos(5)]), vec![pos(5)]);
    }

    #[test]
    fn test_partitions_are_independent() {
        let tracker = CommitTracker::new();
        tracker.track(TransportPosition::new(0, 1));
        tracker.track(TransportPosition::new(1, 1));

        let acked = tracker.release([TransportPosition::new(1, 1)]);
        assert_eq!(acked, vec![TransportPosition::new(1, 1)]);
        assert_eq!(tracker.acknowledged(0), None);
    }

    #[test]
    fn test_untracked_release_ignored() {
        let tracker = CommitTracker::new();
        assert!(tracker.release([pos(1)]).is_empty());
    }
}
