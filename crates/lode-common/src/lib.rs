//! Common types and contracts shared across the lodestream streaming node.

pub mod latch;
pub mod metadata;
pub mod types;

pub use latch::FutureCell;
pub use metadata::{MetadataError, SegmentIdAllocator, StreamingCatalog};
pub use types::{
    current_time_tick, CollectionId, CollectionInfo, PChannelInfo, PartitionId,
    SegmentAssignmentMeta, SegmentAssignmentStat, SegmentAssignmentState, SegmentId, TimeTick,
    VChannel,
};
