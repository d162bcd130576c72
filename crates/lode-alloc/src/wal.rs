//! WAL announcement adapter.
//!
//! The append primitive itself is an external collaborator behind the
//! [`Wal`] trait; appends on one pchannel are serialized by the
//! implementation. The adapter here builds CreateSegment / FlushSegment
//! messages and interprets the returned (message id, time-tick) as the
//! segment's creation or seal point.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use lode_common::{FutureCell, TimeTick};

use crate::error::Result;
use crate::message::{CreateSegmentHeader, FlushSegmentHeader, SegmentMessage};
use crate::stats::SegmentBelongs;

/// Outcome of a durable WAL append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Offset of the message within the pchannel.
    pub message_id: i64,
    /// Time-tick assigned to the message by the WAL clock.
    pub time_tick: TimeTick,
}

/// The WAL append primitive.
#[async_trait]
pub trait Wal: Send + Sync {
    async fn append(&self, msg: SegmentMessage) -> Result<AppendResult>;
}

/// Shared handle to a WAL that may not be open yet.
///
/// The allocation manager is constructed during boot, before the WAL is
/// opened; the latch resolves once it is. The write path never runs before
/// that, so awaiting the latch here cannot deadlock.
pub type WalFuture = Arc<FutureCell<Arc<dyn Wal>>>;

/// Builds and appends segment lifecycle announcements for one pchannel.
pub struct SegmentAnnouncer {
    wal: WalFuture,
}

impl SegmentAnnouncer {
    pub fn new(wal: WalFuture) -> Self {
        Self { wal }
    }

    /// Announce a new growing segment. The returned time-tick becomes the
    /// segment's create timestamp; the message id pins its ordering.
    pub async fn announce_create(
        &self,
        belongs: &SegmentBelongs,
        max_binary_size: u64,
    ) -> Result<AppendResult> {
        let msg = SegmentMessage::create_segment(
            belongs.vchannel.clone(),
            CreateSegmentHeader {
                collection_id: belongs.collection_id,
                partition_id: belongs.partition_id,
                segment_id: belongs.segment_id,
                max_binary_size,
            },
        );
        let result = self.wal.get().await.append(msg).await?;
        debug!(
            segment_id = belongs.segment_id,
            time_tick = result.time_tick,
            "announced segment creation"
        );
        Ok(result)
    }

    /// Announce the seal point of a segment: everything appended before the
    /// returned offset belongs to it, everything after does not.
    pub async fn announce_flush(&self, belongs: &SegmentBelongs) -> Result<AppendResult> {
        let msg = SegmentMessage::flush_segment(
            belongs.vchannel.clone(),
            FlushSegmentHeader {
                collection_id: belongs.collection_id,
                partition_id: belongs.partition_id,
                segment_id: belongs.segment_id,
            },
        );
        let result = self.wal.get().await.append(msg).await?;
        debug!(
            segment_id = belongs.segment_id,
            time_tick = result.time_tick,
            "announced segment flush"
        );
        Ok(result)
    }
}
