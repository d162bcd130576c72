//! Common identifiers and persisted record types.

use serde::{Deserialize, Serialize};

/// Collection identifier allocated by the meta coordinator.
pub type CollectionId = i64;

/// Partition identifier within a collection.
pub type PartitionId = i64;

/// Globally unique segment identifier allocated by the external ID service.
pub type SegmentId = i64;

/// Hybrid logical clock value: physical milliseconds shifted left by
/// [`LOGICAL_BITS`], low bits reserved for the logical counter. WAL-global,
/// monotonic per pchannel.
pub type TimeTick = u64;

/// Logical subdivision of a pchannel per collection. Carried in records but
/// not used for routing here.
pub type VChannel = String;

/// Number of logical-counter bits in a [`TimeTick`].
pub const LOGICAL_BITS: u32 = 18;

/// Current hybrid-logical-clock value from the wall clock. Monotonicity
/// across callers is the time-tick allocator's concern, not this helper's.
pub fn current_time_tick() -> TimeTick {
    (chrono::Utc::now().timestamp_millis() as u64) << LOGICAL_BITS
}

/// Identity of a physical WAL channel.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PChannelInfo {
    pub name: String,
    /// Ownership term of this channel on the current node.
    pub term: i64,
}

impl PChannelInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            term: 1,
        }
    }
}

/// The meta coordinator's view of one collection on one pchannel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub collection_id: CollectionId,
    pub vchannel: VChannel,
    pub partitions: Vec<PartitionId>,
}

/// Segment assignment lifecycle state as persisted in the metastore.
///
/// Transitions are strictly forward: Pending -> Growing -> Sealed -> Flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentAssignmentState {
    /// Segment id allocated but the CreateSegment announcement never reached
    /// the WAL.
    Pending,
    /// Accepting new assigns.
    Growing,
    /// No new assigns; flush announcement imminent.
    Sealed,
    /// FlushSegment durably appended and persisted.
    Flushed,
}

/// Accumulated counters for one segment assignment.
///
/// Both timestamps are time-ticks: `create_timestamp` is the WAL time-tick
/// returned by the CreateSegment append, `last_modified_timestamp` the tick
/// of the most recent assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentAssignmentStat {
    pub max_binary_size: u64,
    pub inserted_rows: u64,
    pub inserted_binary_size: u64,
    pub create_timestamp: TimeTick,
    pub last_modified_timestamp: TimeTick,
}

/// Persisted record for one segment assignment, keyed by `segment_id`.
///
/// `stat` is `None` only while the segment is [`SegmentAssignmentState::Pending`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentAssignmentMeta {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub vchannel: VChannel,
    pub state: SegmentAssignmentState,
    pub stat: Option<SegmentAssignmentStat>,
}
