//! In-memory implementation of the streaming catalog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Result, SegmentIdAllocator, StreamingCatalog};
use crate::types::{
    CollectionId, CollectionInfo, PartitionId, SegmentAssignmentMeta, SegmentAssignmentState,
    SegmentId,
};

/// In-memory [`StreamingCatalog`] for tests and single-process runs.
pub struct MemoryCatalog {
    collections: RwLock<HashMap<String, Vec<CollectionInfo>>>,
    assignments: RwLock<HashMap<String, HashMap<SegmentId, SegmentAssignmentMeta>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// Seed the coordinator view of a pchannel.
    pub async fn put_collections(&self, pchannel: &str, infos: Vec<CollectionInfo>) {
        self.collections
            .write()
            .await
            .insert(pchannel.to_string(), infos);
    }

    /// Seed persisted segment assignments, e.g. a recovery fixture.
    pub async fn put_assignments(&self, pchannel: &str, metas: Vec<SegmentAssignmentMeta>) {
        let mut assignments = self.assignments.write().await;
        let entry = assignments.entry(pchannel.to_string()).or_default();
        for meta in metas {
            entry.insert(meta.segment_id, meta);
        }
    }

    /// Snapshot of the stored assignments for a pchannel, sorted by segment id.
    pub async fn dump_assignments(&self, pchannel: &str) -> Vec<SegmentAssignmentMeta> {
        let assignments = self.assignments.read().await;
        let mut metas: Vec<_> = assignments
            .get(pchannel)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        metas.sort_by_key(|m| m.segment_id);
        metas
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamingCatalog for MemoryCatalog {
    async fn list_pchannel_collections(&self, pchannel: &str) -> Result<Vec<CollectionInfo>> {
        Ok(self
            .collections
            .read()
            .await
            .get(pchannel)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_segment_assignments(
        &self,
        pchannel: &str,
    ) -> Result<Vec<SegmentAssignmentMeta>> {
        Ok(self.dump_assignments(pchannel).await)
    }

    async fn save_segment_assignments(
        &self,
        pchannel: &str,
        metas: Vec<SegmentAssignmentMeta>,
    ) -> Result<()> {
        let mut assignments = self.assignments.write().await;
        let entry = assignments.entry(pchannel.to_string()).or_default();
        for meta in metas {
            if meta.state == SegmentAssignmentState::Flushed {
                entry.remove(&meta.segment_id);
            } else {
                entry.insert(meta.segment_id, meta);
            }
        }
        Ok(())
    }
}

/// Counter-backed [`SegmentIdAllocator`].
pub struct CounterIdAllocator {
    next: AtomicI64,
}

impl CounterIdAllocator {
    pub fn new(start: SegmentId) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }
}

#[async_trait]
impl SegmentIdAllocator for CounterIdAllocator {
    async fn alloc_segment(
        &self,
        _collection_id: CollectionId,
        _partition_id: PartitionId,
    ) -> Result<SegmentId> {
        Ok(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
