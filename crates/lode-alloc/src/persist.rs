//! Persistence adapter for segment assignment records.
//!
//! Hides the metastore schema behind staged, coalesced batch upserts. A
//! dirty set per pchannel is flushed when it crosses a small threshold, on
//! every seal announcement, and before close. Lifecycle transitions go
//! through [`AssignmentPersister::save`], which flushes immediately: those
//! are the durable points where the metastore and memory must agree.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use lode_common::{SegmentAssignmentMeta, SegmentId, StreamingCatalog};

use crate::error::Result;

pub struct AssignmentPersister {
    pchannel: String,
    catalog: Arc<dyn StreamingCatalog>,
    dirty: Mutex<HashMap<SegmentId, SegmentAssignmentMeta>>,
    dirty_threshold: usize,
}

impl AssignmentPersister {
    pub fn new(
        pchannel: impl Into<String>,
        catalog: Arc<dyn StreamingCatalog>,
        dirty_threshold: usize,
    ) -> Self {
        Self {
            pchannel: pchannel.into(),
            catalog,
            dirty: Mutex::new(HashMap::new()),
            dirty_threshold: dirty_threshold.max(1),
        }
    }

    /// Load every persisted assignment for this pchannel (recovery).
    pub async fn list(&self) -> Result<Vec<SegmentAssignmentMeta>> {
        Ok(self.catalog.list_segment_assignments(&self.pchannel).await?)
    }

    /// Stage a record for the next coalesced flush. Newer stages for the
    /// same segment replace older ones.
    pub async fn stage(&self, meta: SegmentAssignmentMeta) -> Result<()> {
        let should_flush = {
            let mut dirty = self.dirty.lock().await;
            dirty.insert(meta.segment_id, meta);
            dirty.len() >= self.dirty_threshold
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Persist a record immediately, together with anything already staged.
    pub async fn save(&self, meta: SegmentAssignmentMeta) -> Result<()> {
        self.dirty.lock().await.insert(meta.segment_id, meta);
        self.flush().await
    }

    /// Write the dirty set out as one idempotent batch upsert.
    pub async fn flush(&self) -> Result<()> {
        let staged: Vec<SegmentAssignmentMeta> = {
            let mut dirty = self.dirty.lock().await;
            if dirty.is_empty() {
                return Ok(());
            }
            dirty.drain().map(|(_, meta)| meta).collect()
        };

        let count = staged.len();
        match self
            .catalog
            .save_segment_assignments(&self.pchannel, staged.clone())
            .await
        {
            Ok(()) => {
                debug!(pchannel = %self.pchannel, count, "persisted segment assignments");
                Ok(())
            }
            Err(e) => {
                // Put the failed batch back without clobbering records that
                // were re-staged while the save was in flight.
                let mut dirty = self.dirty.lock().await;
                for meta in staged {
                    dirty.entry(meta.segment_id).or_insert(meta);
                }
                Err(e.into())
            }
        }
    }

    pub async fn dirty_len(&self) -> usize {
        self.dirty.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_common::metadata::MemoryCatalog;
    use lode_common::{SegmentAssignmentState, SegmentAssignmentStat};

    fn meta(segment_id: SegmentId, state: SegmentAssignmentState) -> SegmentAssignmentMeta {
        SegmentAssignmentMeta {
            collection_id: 1,
            partition_id: 1,
            segment_id,
            vchannel: "v1".to_string(),
            state,
            stat: Some(SegmentAssignmentStat {
                max_binary_size: 1000,
                inserted_rows: 1,
                inserted_binary_size: 10,
                create_timestamp: 1,
                last_modified_timestamp: 1,
            }),
        }
    }

    #[tokio::test]
    async fn stage_coalesces_until_threshold() {
        let catalog = Arc::new(MemoryCatalog::new());
        let persister = AssignmentPersister::new("p1", catalog.clone(), 3);

        persister.stage(meta(1, SegmentAssignmentState::Growing)).await.unwrap();
        persister.stage(meta(2, SegmentAssignmentState::Growing)).await.unwrap();
        assert!(catalog.dump_assignments("p1").await.is_empty());
        assert_eq!(persister.dirty_len().await, 2);

        persister.stage(meta(3, SegmentAssignmentState::Growing)).await.unwrap();
        assert_eq!(catalog.dump_assignments("p1").await.len(), 3);
        assert_eq!(persister.dirty_len().await, 0);
    }

    #[tokio::test]
    async fn save_flushes_immediately_and_upserts() {
        let catalog = Arc::new(MemoryCatalog::new());
        let persister = AssignmentPersister::new("p1", catalog.clone(), 100);

        persister.stage(meta(1, SegmentAssignmentState::Growing)).await.unwrap();
        persister.save(meta(1, SegmentAssignmentState::Sealed)).await.unwrap();

        let stored = catalog.dump_assignments("p1").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, SegmentAssignmentState::Sealed);
    }
}
