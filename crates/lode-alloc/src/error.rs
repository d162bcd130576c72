//! Segment allocation error types.

use lode_common::metadata::MetadataError;
use lode_common::{CollectionId, PartitionId, SegmentId};
use thiserror::Error;

use crate::segment::SegmentState;

pub type Result<T> = std::result::Result<T, AllocError>;

#[derive(Error, Debug)]
pub enum AllocError {
    /// The request's time-tick is behind the pchannel watermark. The client
    /// must refresh its tick and retry.
    #[error("time tick too old for assignment")]
    TimeTickTooOld,

    /// A single insert larger than the segment capacity can never be
    /// assigned. Unrecoverable; the record must be rejected upstream.
    #[error("insert too large: binary size {binary_size} exceeds segment capacity {max_binary_size}")]
    TooLargeInsert {
        binary_size: u64,
        max_binary_size: u64,
    },

    /// The collection is fenced at or above the request's time-tick; the
    /// caller reorders into the next epoch.
    #[error("assignment fenced by manual flush")]
    FencedAssign,

    #[error("collection {0} not found on this pchannel")]
    CollectionNotFound(CollectionId),

    #[error("partition {0} not found")]
    PartitionNotFound(PartitionId),

    #[error("segment {0} not found")]
    SegmentNotFound(SegmentId),

    /// A backwards lifecycle edge was requested. Programming error; the
    /// owning partition manager is poisoned and rebuilt from the catalog.
    #[error("invalid state transition for segment {segment_id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        segment_id: SegmentId,
        from: SegmentState,
        to: SegmentState,
    },

    /// A suspended operation was interrupted by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    #[error("wal append failed: {0}")]
    Wal(String),

    #[error("segment id allocation failed: {0}")]
    IdAllocation(String),

    #[error("metastore error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AllocError {
    /// Expected policy rejections: cheap, not logged above debug.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            AllocError::TimeTickTooOld
                | AllocError::TooLargeInsert { .. }
                | AllocError::FencedAssign
        )
    }

    /// Transient external failures: the assign path surfaces them for the
    /// caller to retry, the seal path re-queues on the next inspector tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AllocError::Wal(_) | AllocError::IdAllocation(_) | AllocError::Metadata(_)
        )
    }
}
