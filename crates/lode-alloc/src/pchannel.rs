//! PChannel-scoped segment allocation manager.
//!
//! One manager per physical WAL channel. Routes assigns to partition
//! managers, owns the collection -> partitions index, the per-collection
//! fence table, and the stale-tick watermark, and exposes the public API.
//!
//! Lock ordering, acquired top-down only:
//! 1. the index lock here (map operations only, never across an await)
//! 2. a partition manager's critical section
//! 3. a segment's counter lock

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use lode_common::{
    CollectionId, PChannelInfo, PartitionId, SegmentAssignmentMeta, SegmentAssignmentState,
    SegmentId, TimeTick, VChannel,
};

use crate::error::{AllocError, Result};
use crate::inspector::SealWaker;
use crate::message::ManualFlushExtraResponse;
use crate::partition::{AssignSegmentRequest, PartitionManager};
use crate::persist::AssignmentPersister;
use crate::resource::Resources;
use crate::segment::{AssignSegmentResult, SealPolicy, Segment, SegmentState};
use crate::stats::{InsertMetrics, SegmentBelongs};
use crate::wal::{SegmentAnnouncer, WalFuture};

/// Re-check cadence while self-driving a drain (remove/close paths).
const DRAIN_RECHECK_INTERVAL: Duration = Duration::from_millis(10);

struct CollectionEntry {
    vchannel: VChannel,
    partitions: HashMap<PartitionId, Arc<PartitionManager>>,
    /// Max fenced tick: assigns at or below are rejected.
    fence: TimeTick,
    /// Largest time-tick accepted so far; older ticks are stale.
    watermark: TimeTick,
}

/// Segment allocation manager for one pchannel.
pub struct PChannelManager {
    info: PChannelInfo,
    resources: Arc<Resources>,
    announcer: Arc<SegmentAnnouncer>,
    persister: Arc<AssignmentPersister>,
    index: RwLock<HashMap<CollectionId, CollectionEntry>>,
    /// Notified whenever a segment reaches Flushed.
    flushed_notify: Notify,
    seal_waker: Mutex<Option<SealWaker>>,
}

impl PChannelManager {
    /// Recover the manager for `info` from the metastore: fetch the
    /// collection layout, load persisted assignments, rebuild partition
    /// managers, and register with the seal inspector. Pending segments are
    /// re-announced once the WAL latch resolves; Sealed segments get their
    /// flush re-announced by the inspector.
    #[instrument(skip(resources, wal), fields(pchannel = %info.name))]
    pub async fn recover(
        resources: Arc<Resources>,
        info: PChannelInfo,
        wal: WalFuture,
    ) -> Result<Arc<Self>> {
        let announcer = Arc::new(SegmentAnnouncer::new(wal));
        let persister = Arc::new(AssignmentPersister::new(
            info.name.clone(),
            resources.catalog.clone(),
            resources.config.meta_dirty_threshold,
        ));

        let collections = resources
            .catalog
            .list_pchannel_collections(&info.name)
            .await?;
        let metas = persister.list().await?;

        let mut grouped: HashMap<(CollectionId, PartitionId), Vec<SegmentAssignmentMeta>> =
            HashMap::new();
        for meta in metas {
            grouped
                .entry((meta.collection_id, meta.partition_id))
                .or_default()
                .push(meta);
        }

        let manager = Arc::new(Self {
            info: info.clone(),
            resources: resources.clone(),
            announcer: announcer.clone(),
            persister: persister.clone(),
            index: RwLock::new(HashMap::new()),
            flushed_notify: Notify::new(),
            seal_waker: Mutex::new(None),
        });

        let mut recovered_segments = 0usize;
        for collection in &collections {
            let mut partitions = HashMap::new();
            let mut watermark = 0;
            for &partition_id in &collection.partitions {
                let metas = grouped
                    .remove(&(collection.collection_id, partition_id))
                    .unwrap_or_default();
                recovered_segments += metas.len();
                let segments = manager
                    .restore_segments(collection.collection_id, partition_id, metas)
                    .await?;
                for segment in &segments {
                    let stat = segment.snapshot_stat();
                    watermark = watermark
                        .max(stat.create_timestamp)
                        .max(stat.last_modified_timestamp);
                }
                partitions.insert(
                    partition_id,
                    Arc::new(manager.build_partition(
                        &collection.vchannel,
                        collection.collection_id,
                        partition_id,
                        segments,
                    )),
                );
            }
            manager.index.write().insert(
                collection.collection_id,
                CollectionEntry {
                    vchannel: collection.vchannel.clone(),
                    partitions,
                    fence: 0,
                    watermark,
                },
            );
        }
        for ((collection_id, partition_id), metas) in grouped {
            warn!(
                collection_id,
                partition_id,
                orphans = metas.len(),
                "persisted assignments for a partition unknown to the meta coordinator; skipped"
            );
        }

        resources.inspector.register(manager.clone());
        info!(
            pchannel = %info.name,
            collections = collections.len(),
            segments = recovered_segments,
            "pchannel segment allocation manager recovered"
        );
        Ok(manager)
    }

    /// Retrying wrapper around [`PChannelManager::recover`]: exponential
    /// backoff per the configured schedule, aborting when `shutdown` fires.
    pub async fn recover_with_backoff(
        resources: Arc<Resources>,
        info: PChannelInfo,
        wal: WalFuture,
        shutdown: Arc<Notify>,
    ) -> Result<Arc<Self>> {
        let backoff = resources.config.alloc_backoff.clone();
        let mut delay = backoff.initial();
        for attempt in 0.. {
            match Self::recover(resources.clone(), info.clone(), wal.clone()).await {
                Ok(manager) => return Ok(manager),
                Err(err) => {
                    warn!(
                        pchannel = %info.name,
                        attempt,
                        next_retry_ms = delay.as_millis() as u64,
                        error = %err,
                        "pchannel manager recovery failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.notified() => return Err(AllocError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = backoff.next(delay);
                }
            }
        }
        unreachable!("backoff loop only exits by return")
    }

    fn build_partition(
        &self,
        vchannel: &str,
        collection_id: CollectionId,
        partition_id: PartitionId,
        segments: Vec<Arc<Segment>>,
    ) -> PartitionManager {
        PartitionManager::new(
            self.info.name.clone(),
            vchannel,
            collection_id,
            partition_id,
            self.resources.clone(),
            self.announcer.clone(),
            self.persister.clone(),
            segments,
        )
    }

    /// Rebuild a partition's in-memory segments from persisted records.
    /// Growing and Sealed restore directly; Pending never reached the WAL,
    /// so its CreateSegment message is appended now.
    async fn restore_segments(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
        metas: Vec<SegmentAssignmentMeta>,
    ) -> Result<Vec<Arc<Segment>>> {
        let config = &self.resources.config;
        let mut segments = Vec::with_capacity(metas.len());
        for meta in metas {
            let belongs = SegmentBelongs {
                pchannel: self.info.name.clone(),
                vchannel: meta.vchannel.clone(),
                collection_id,
                partition_id,
                segment_id: meta.segment_id,
            };
            let proportion = config.seal_proportion
                * (1.0 - config.seal_proportion_jitter * rand::random::<f64>());
            let segment = match (meta.state, meta.stat) {
                (SegmentAssignmentState::Pending, _) => {
                    let append = self
                        .announcer
                        .announce_create(&belongs, config.max_binary_size())
                        .await?;
                    let segment = Arc::new(Segment::new(
                        belongs,
                        config.max_binary_size(),
                        proportion,
                        append.time_tick,
                    ));
                    self.persister.save(segment.to_meta()).await?;
                    segment
                }
                (SegmentAssignmentState::Growing, Some(stat)) => Arc::new(Segment::restore(
                    belongs,
                    stat,
                    SegmentState::Growing,
                    proportion,
                )),
                (SegmentAssignmentState::Sealed, Some(stat)) => Arc::new(Segment::restore(
                    belongs,
                    stat,
                    SegmentState::Sealed,
                    proportion,
                )),
                (state, stat) => {
                    warn!(
                        segment_id = meta.segment_id,
                        state = ?state,
                        has_stat = stat.is_some(),
                        "inconsistent persisted assignment skipped"
                    );
                    continue;
                }
            };
            let stat = segment.snapshot_stat();
            self.resources.stats.register(
                segment.segment_id(),
                InsertMetrics {
                    rows: stat.inserted_rows,
                    binary_size: stat.inserted_binary_size,
                },
            );
            segments.push(segment);
        }
        Ok(segments)
    }

    pub fn pchannel_name(&self) -> &str {
        &self.info.name
    }

    /// Inspector wake capability, handed in at registration.
    pub fn attach_seal_waker(&self, waker: SealWaker) {
        *self.seal_waker.lock() = Some(waker);
    }

    fn wake_inspector(&self) {
        if let Some(waker) = self.seal_waker.lock().as_ref() {
            waker.wake();
        }
    }

    /// Create partition managers for a new collection. Idempotent.
    pub fn new_collection(
        &self,
        collection_id: CollectionId,
        vchannel: &str,
        partition_ids: &[PartitionId],
    ) {
        let mut index = self.index.write();
        let entry = index.entry(collection_id).or_insert_with(|| CollectionEntry {
            vchannel: vchannel.to_string(),
            partitions: HashMap::new(),
            fence: 0,
            watermark: 0,
        });
        for &partition_id in partition_ids {
            entry.partitions.entry(partition_id).or_insert_with(|| {
                Arc::new(self.build_partition(vchannel, collection_id, partition_id, Vec::new()))
            });
        }
        debug!(collection_id, partitions = partition_ids.len(), "collection registered");
    }

    /// Create one partition manager. The collection must exist. Idempotent.
    pub fn new_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> Result<()> {
        let mut index = self.index.write();
        let entry = index
            .get_mut(&collection_id)
            .ok_or(AllocError::CollectionNotFound(collection_id))?;
        let vchannel = entry.vchannel.clone();
        entry.partitions.entry(partition_id).or_insert_with(|| {
            Arc::new(self.build_partition(&vchannel, collection_id, partition_id, Vec::new()))
        });
        Ok(())
    }

    /// Assign the insert to a growing segment of its partition.
    ///
    /// Validation order: collection exists, partition exists, time-tick not
    /// stale, time-tick above the collection fence. Policy rejections are
    /// expected and cheap; they are not logged above debug.
    pub async fn assign_segment(
        &self,
        req: &AssignSegmentRequest,
    ) -> Result<AssignSegmentResult> {
        let partition = {
            let index = self.index.read();
            let entry = index
                .get(&req.collection_id)
                .ok_or(AllocError::CollectionNotFound(req.collection_id))?;
            let partition = entry
                .partitions
                .get(&req.partition_id)
                .cloned()
                .ok_or(AllocError::PartitionNotFound(req.partition_id))?;
            if req.time_tick < entry.watermark {
                debug!(
                    collection_id = req.collection_id,
                    time_tick = req.time_tick,
                    watermark = entry.watermark,
                    "stale time tick rejected"
                );
                return Err(AllocError::TimeTickTooOld);
            }
            if req.time_tick <= entry.fence {
                debug!(
                    collection_id = req.collection_id,
                    time_tick = req.time_tick,
                    fence = entry.fence,
                    "fenced assignment rejected"
                );
                return Err(AllocError::FencedAssign);
            }
            partition
        };

        let result = partition.assign_segment(req).await?;

        let mut index = self.index.write();
        if let Some(entry) = index.get_mut(&req.collection_id) {
            entry.watermark = entry.watermark.max(req.time_tick);
        }
        Ok(result)
    }

    /// Non-blocking seal pass. Without hints, every partition is examined
    /// against the seal policies; with hints, only the hinted partitions,
    /// and a hinted segment id that exists is force-sealed. Finishes with an
    /// announcement pass over whatever became ready.
    pub async fn try_to_seal_segments(&self, hints: &[SegmentBelongs]) {
        self.rebuild_poisoned_partitions().await;

        if hints.is_empty() {
            for partition in self.all_partitions() {
                let candidates = partition.collect_seal_candidates().await;
                if !candidates.is_empty() {
                    partition.seal_segments(candidates).await;
                }
            }
        } else {
            for hint in hints {
                let Some(partition) = self.partition(hint.collection_id, hint.partition_id)
                else {
                    continue;
                };
                if partition.owns_segment(hint.segment_id).await {
                    let _ = partition.must_seal(hint.segment_id).await;
                }
                let candidates = partition.collect_seal_candidates().await;
                partition.seal_segments(candidates).await;
            }
        }

        self.try_to_seal_waited_segment().await;
    }

    /// Re-examine segments previously sealed but deferred for outstanding
    /// assignments or open transactions, and announce those now ready.
    pub async fn try_to_seal_waited_segment(&self) {
        let mut any_flushed = false;
        for partition in self.all_partitions() {
            if !partition.try_flush_ready().await.is_empty() {
                any_flushed = true;
            }
        }
        if any_flushed {
            self.flushed_notify.notify_waiters();
        }
    }

    /// Administrative seal of specific segments, bypassing policy.
    pub async fn must_seal_segments(&self, belongs: &[SegmentBelongs]) {
        for b in belongs {
            let Some(partition) = self.partition(b.collection_id, b.partition_id) else {
                warn!(
                    collection_id = b.collection_id,
                    partition_id = b.partition_id,
                    "must-seal for unknown partition ignored"
                );
                continue;
            };
            if let Err(err) = partition.must_seal(b.segment_id).await {
                warn!(segment_id = b.segment_id, error = %err, "must-seal skipped");
            }
        }
        self.try_to_seal_waited_segment().await;
    }

    /// Raise the collection fence to `time_tick` and seal every segment
    /// created at or before it, then wait until each of those is flushed.
    ///
    /// The fence is raised before the first suspension point: it is the
    /// commitment, the wait is the convenience. Dropping the future (e.g. a
    /// caller-imposed deadline) leaves the fence up and the sealed segments
    /// queued for the inspector. Returns the sealed segment ids wrapped as
    /// the extra response the caller piggy-backs on its ManualFlush reply.
    pub async fn seal_and_fence_segment_until(
        &self,
        collection_id: CollectionId,
        time_tick: TimeTick,
    ) -> Result<ManualFlushExtraResponse> {
        let partitions: Vec<Arc<PartitionManager>> = {
            let mut index = self.index.write();
            let entry = index
                .get_mut(&collection_id)
                .ok_or(AllocError::CollectionNotFound(collection_id))?;
            entry.fence = entry.fence.max(time_tick);
            entry.partitions.values().cloned().collect()
        };
        info!(collection_id, fence = time_tick, "collection fenced for manual flush");

        let mut waits: Vec<(Arc<PartitionManager>, SegmentId)> = Vec::new();
        for partition in &partitions {
            partition.seal_created_until(time_tick).await;
            for segment_id in partition.ids_created_until(time_tick).await {
                waits.push((partition.clone(), segment_id));
            }
        }

        // The flushes themselves are driven by the inspector's next tick;
        // wait here.
        loop {
            let notified = self.flushed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut pending = false;
            for (partition, segment_id) in &waits {
                if partition.owns_segment(*segment_id).await {
                    pending = true;
                    break;
                }
            }
            if !pending {
                break;
            }
            notified.await;
        }

        let mut segment_ids: Vec<SegmentId> = waits.into_iter().map(|(_, id)| id).collect();
        segment_ids.sort_unstable();
        segment_ids.dedup();
        Ok(ManualFlushExtraResponse { segment_ids })
    }

    /// Seal all segments of a partition and delete its manager once drained.
    pub async fn remove_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> Result<()> {
        let partition = self
            .partition(collection_id, partition_id)
            .ok_or(AllocError::PartitionNotFound(partition_id))?;

        partition.mark_dropped(SealPolicy::PartitionRemoved).await;
        self.wake_inspector();
        self.drain_partition(&partition).await;

        let mut index = self.index.write();
        if let Some(entry) = index.get_mut(&collection_id) {
            entry.partitions.remove(&partition_id);
        }
        info!(collection_id, partition_id, "partition removed");
        Ok(())
    }

    /// Seal all segments in all partitions of a collection and delete the
    /// collection entry once drained.
    pub async fn remove_collection(&self, collection_id: CollectionId) -> Result<()> {
        let partitions: Vec<Arc<PartitionManager>> = {
            let index = self.index.read();
            index
                .get(&collection_id)
                .ok_or(AllocError::CollectionNotFound(collection_id))?
                .partitions
                .values()
                .cloned()
                .collect()
        };

        for partition in &partitions {
            partition.mark_dropped(SealPolicy::CollectionRemoved).await;
        }
        self.wake_inspector();
        for partition in &partitions {
            self.drain_partition(partition).await;
        }

        self.index.write().remove(&collection_id);
        info!(collection_id, "collection removed");
        Ok(())
    }

    /// True iff no segment anywhere is in Sealed-but-not-Flushed state.
    pub async fn is_no_wait_seal(&self) -> bool {
        for partition in self.all_partitions() {
            if partition.wait_seal_count().await > 0 {
                return false;
            }
        }
        true
    }

    /// Seal everything, wait for the drain, flush staged metadata, and
    /// unregister from the inspector. Callers bound the wait with a timeout.
    pub async fn close(&self) {
        info!(pchannel = %self.info.name, "closing segment allocation manager");
        self.resources.inspector.unregister(&self.info.name).await;

        let partitions = self.all_partitions();
        for partition in &partitions {
            partition.seal_all(SealPolicy::Force).await;
        }
        for partition in &partitions {
            self.drain_partition(partition).await;
        }
        if let Err(err) = self.persister.flush().await {
            warn!(error = %err, "failed to flush staged assignments on close");
        }
    }

    /// Self-driven drain: announce ready flushes and wait for stragglers
    /// (unacked assignments, open transactions) until the partition holds
    /// nothing. Runs without a registered inspector.
    async fn drain_partition(&self, partition: &Arc<PartitionManager>) {
        loop {
            if !partition.try_flush_ready().await.is_empty() {
                self.flushed_notify.notify_waiters();
            }
            if partition.is_empty().await {
                return;
            }
            let notified = self.flushed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(DRAIN_RECHECK_INTERVAL) => {}
            }
        }
    }

    fn all_partitions(&self) -> Vec<Arc<PartitionManager>> {
        let index = self.index.read();
        index
            .values()
            .flat_map(|entry| entry.partitions.values().cloned())
            .collect()
    }

    fn partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> Option<Arc<PartitionManager>> {
        let index = self.index.read();
        index
            .get(&collection_id)?
            .partitions
            .get(&partition_id)
            .cloned()
    }

    /// Replace poisoned partition managers with fresh ones rebuilt from the
    /// catalog's persisted assignments.
    async fn rebuild_poisoned_partitions(&self) {
        let poisoned: Vec<(CollectionId, PartitionId, VChannel)> = {
            let index = self.index.read();
            index
                .iter()
                .flat_map(|(cid, entry)| {
                    entry
                        .partitions
                        .iter()
                        .filter(|(_, p)| p.is_poisoned())
                        .map(|(pid, _)| (*cid, *pid, entry.vchannel.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (collection_id, partition_id, vchannel) in poisoned {
            warn!(collection_id, partition_id, "rebuilding poisoned partition from catalog");
            let metas = match self.persister.list().await {
                Ok(metas) => metas
                    .into_iter()
                    .filter(|m| {
                        m.collection_id == collection_id && m.partition_id == partition_id
                    })
                    .collect::<Vec<_>>(),
                Err(err) => {
                    warn!(error = %err, "partition rebuild deferred: catalog list failed");
                    continue;
                }
            };
            let segments = match self
                .restore_segments(collection_id, partition_id, metas)
                .await
            {
                Ok(segments) => segments,
                Err(err) => {
                    warn!(error = %err, "partition rebuild deferred");
                    continue;
                }
            };
            let rebuilt = Arc::new(self.build_partition(
                &vchannel,
                collection_id,
                partition_id,
                segments,
            ));
            let mut index = self.index.write();
            if let Some(entry) = index.get_mut(&collection_id) {
                entry.partitions.insert(partition_id, rebuilt);
            }
        }
    }

    /// Persisted view of the current in-memory state, sorted by segment id.
    pub async fn snapshot_metas(&self) -> Vec<SegmentAssignmentMeta> {
        let mut metas = Vec::new();
        for partition in self.all_partitions() {
            metas.extend(partition.snapshot_metas().await);
        }
        metas.sort_by_key(|m| m.segment_id);
        metas
    }
}
