//! Metastore and ID-allocator contracts.
//!
//! The actual key-value backend and the root-coord allocation RPC live
//! outside this workspace; the node only ever talks to these traits. An
//! in-memory catalog is provided in [`memory`] for tests and single-process
//! runs.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    CollectionId, CollectionInfo, PartitionId, SegmentAssignmentMeta, SegmentId,
};

pub mod memory;

pub use memory::{CounterIdAllocator, MemoryCatalog};

/// Metadata store errors.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Catalog of streaming-node state kept in the metastore.
///
/// `save_segment_assignments` is an idempotent batch upsert keyed by segment
/// id; records saved in the Flushed state are deleted by the backend rather
/// than stored.
#[async_trait]
pub trait StreamingCatalog: Send + Sync {
    /// Collections (and their partitions) assigned to a pchannel, from the
    /// meta coordinator.
    async fn list_pchannel_collections(&self, pchannel: &str) -> Result<Vec<CollectionInfo>>;

    /// All persisted segment assignments for a pchannel.
    async fn list_segment_assignments(&self, pchannel: &str)
        -> Result<Vec<SegmentAssignmentMeta>>;

    /// Batch upsert of segment assignment records.
    async fn save_segment_assignments(
        &self,
        pchannel: &str,
        metas: Vec<SegmentAssignmentMeta>,
    ) -> Result<()>;
}

/// Segment-id allocation seam (root-coord RPC in production).
#[async_trait]
pub trait SegmentIdAllocator: Send + Sync {
    async fn alloc_segment(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> Result<SegmentId>;
}
