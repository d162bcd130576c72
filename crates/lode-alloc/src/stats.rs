//! Process-wide segment assignment statistics.
//!
//! Flush feedback from downstream data nodes arrives indexed by segment id,
//! so the index here is flat and shared by every pchannel manager in the
//! process: one lookup per feedback event, no per-channel indirection.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use lode_common::{CollectionId, PartitionId, SegmentId, VChannel};

use crate::inspector::SealWaker;

/// Size of one insert as charged against a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertMetrics {
    pub rows: u64,
    pub binary_size: u64,
}

impl InsertMetrics {
    pub fn accumulate(&mut self, other: InsertMetrics) {
        self.rows += other.rows;
        self.binary_size += other.binary_size;
    }
}

/// Feedback pushed by flushers after a sync operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOperationMetrics {
    pub binlog_counter_incr: u64,
}

/// Full identity of a segment on its channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentBelongs {
    pub pchannel: String,
    pub vchannel: VChannel,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
}

#[derive(Debug, Default)]
struct SegmentStatsEntry {
    insert: InsertMetrics,
    synced_binlog_counter: u64,
}

/// Process-wide singleton aggregating per-segment assign and sync feedback.
///
/// Callers must never hold a segment lock while calling in here.
pub struct SegmentAssignStatsManager {
    entries: Mutex<HashMap<SegmentId, SegmentStatsEntry>>,
    binlog_counter_threshold: u64,
    waker: Mutex<Option<SealWaker>>,
}

impl SegmentAssignStatsManager {
    pub fn new(binlog_counter_threshold: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            binlog_counter_threshold,
            waker: Mutex::new(None),
        }
    }

    /// Wire the seal inspector's wake capability. Called once by the
    /// resource container.
    pub fn set_waker(&self, waker: SealWaker) {
        *self.waker.lock() = Some(waker);
    }

    /// Start tracking a segment, seeding counters from its recovered stat.
    pub fn register(&self, segment_id: SegmentId, insert: InsertMetrics) {
        self.entries
            .lock()
            .insert(segment_id, SegmentStatsEntry {
                insert,
                synced_binlog_counter: 0,
            });
    }

    /// Authoritative insert accounting from the assign path.
    pub fn update_on_insert(&self, segment_id: SegmentId, metrics: InsertMetrics) {
        if let Some(entry) = self.entries.lock().get_mut(&segment_id) {
            entry.insert.accumulate(metrics);
        }
    }

    /// Sync feedback from downstream flushers. Crossing the binlog threshold
    /// wakes the seal inspector.
    pub fn update_on_sync(&self, segment_id: SegmentId, metrics: SyncOperationMetrics) {
        let crossed = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&segment_id) {
                Some(entry) => {
                    let before = entry.synced_binlog_counter;
                    entry.synced_binlog_counter += metrics.binlog_counter_incr;
                    before < self.binlog_counter_threshold
                        && entry.synced_binlog_counter >= self.binlog_counter_threshold
                }
                None => false,
            }
        };
        if crossed {
            debug!(segment_id, "binlog counter crossed seal threshold");
            if let Some(waker) = self.waker.lock().as_ref() {
                waker.wake();
            }
        }
    }

    /// Authoritative inserted binary size of a tracked segment, as charged
    /// by the assign path. `None` once the segment is flushed.
    pub fn inserted_binary_size(&self, segment_id: SegmentId) -> Option<u64> {
        self.entries
            .lock()
            .get(&segment_id)
            .map(|e| e.insert.binary_size)
    }

    /// Stats-policy seal decision: accumulated binlog increments since
    /// creation reached the configured threshold.
    pub fn should_seal(&self, segment_id: SegmentId) -> bool {
        self.entries
            .lock()
            .get(&segment_id)
            .map(|e| e.synced_binlog_counter >= self.binlog_counter_threshold)
            .unwrap_or(false)
    }

    /// Drop tracking once the segment is flushed.
    pub fn unregister(&self, segment_id: SegmentId) {
        self.entries.lock().remove(&segment_id);
    }

    pub fn tracked_segments(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_seal_over_threshold() {
        let stats = SegmentAssignStatsManager::new(100);
        stats.register(6000, InsertMetrics::default());

        stats.update_on_sync(6000, SyncOperationMetrics { binlog_counter_incr: 99 });
        assert!(!stats.should_seal(6000));

        stats.update_on_sync(6000, SyncOperationMetrics { binlog_counter_incr: 1 });
        assert!(stats.should_seal(6000));
    }

    #[test]
    fn unknown_segments_never_seal() {
        let stats = SegmentAssignStatsManager::new(100);
        stats.update_on_sync(1, SyncOperationMetrics { binlog_counter_incr: 1000 });
        assert!(!stats.should_seal(1));
        assert_eq!(stats.inserted_binary_size(1), None);
    }

    #[test]
    fn insert_accounting_accumulates_from_registration() {
        let stats = SegmentAssignStatsManager::new(100);
        stats.register(10, InsertMetrics { rows: 5, binary_size: 300 });

        stats.update_on_insert(10, InsertMetrics { rows: 2, binary_size: 200 });
        assert_eq!(stats.inserted_binary_size(10), Some(500));

        stats.unregister(10);
        assert_eq!(stats.inserted_binary_size(10), None);
    }

    #[test]
    fn unregister_clears_counters() {
        let stats = SegmentAssignStatsManager::new(1);
        stats.register(10, InsertMetrics { rows: 5, binary_size: 50 });
        stats.update_on_sync(10, SyncOperationMetrics { binlog_counter_incr: 5 });
        assert!(stats.should_seal(10));

        stats.unregister(10);
        assert!(!stats.should_seal(10));
        assert_eq!(stats.tracked_segments(), 0);
    }
}
