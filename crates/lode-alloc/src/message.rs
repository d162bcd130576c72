//! WAL control messages emitted by the segment allocation core.
//!
//! Bodies are opaque to the WAL; what matters downstream are the headers.
//! The append offset of a CreateSegment message pins the segment's creation
//! point, the offset of a FlushSegment message its seal point: everything
//! before the flush offset belongs to the segment, everything after does not.

use serde::{Deserialize, Serialize};

use lode_common::{CollectionId, PartitionId, SegmentId, VChannel};

/// Announces a new growing segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSegmentHeader {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub max_binary_size: u64,
}

/// Seals a segment at this WAL offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushSegmentHeader {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentMessageBody {
    CreateSegment(CreateSegmentHeader),
    FlushSegment(FlushSegmentHeader),
}

/// A control message bound for one vchannel of the pchannel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMessage {
    pub vchannel: VChannel,
    pub body: SegmentMessageBody,
}

impl SegmentMessage {
    pub fn create_segment(vchannel: VChannel, header: CreateSegmentHeader) -> Self {
        Self {
            vchannel,
            body: SegmentMessageBody::CreateSegment(header),
        }
    }

    pub fn flush_segment(vchannel: VChannel, header: FlushSegmentHeader) -> Self {
        Self {
            vchannel,
            body: SegmentMessageBody::FlushSegment(header),
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        match &self.body {
            SegmentMessageBody::CreateSegment(h) => h.segment_id,
            SegmentMessageBody::FlushSegment(h) => h.segment_id,
        }
    }
}

/// Piggy-backed on the ManualFlush reply: the segments sealed by the fence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualFlushExtraResponse {
    pub segment_ids: Vec<SegmentId>,
}
