//! Per-(collection, partition) segment manager.
//!
//! Owns the partition's non-flushed segments and serializes assign/seal for
//! the partition behind one async lock: the assign critical section spans
//! the ID RPC, the WAL announcement, and the metastore save when a new
//! growing segment is needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use lode_common::{
    CollectionId, PartitionId, SegmentAssignmentState, SegmentId, TimeTick, VChannel,
};

use crate::error::{AllocError, Result};
use crate::persist::AssignmentPersister;
use crate::resource::Resources;
use crate::segment::{AssignSegmentResult, SealPolicy, Segment, SegmentState};
use crate::stats::{InsertMetrics, SegmentBelongs};
use crate::txn::TxnSession;
use crate::wal::SegmentAnnouncer;

/// One insert's assignment request for a single (collection, partition).
///
/// A multi-partition insert message issues one request per partition; a
/// failure part-way leaves earlier partitions' assignments in place (no
/// rollback). The stale growing segments carry the unused capacity charge,
/// which later policy seals amortize.
#[derive(Clone)]
pub struct AssignSegmentRequest {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub insert_metrics: InsertMetrics,
    pub time_tick: TimeTick,
    pub txn_session: Option<Arc<TxnSession>>,
}

struct PartitionInner {
    segments: HashMap<SegmentId, Arc<Segment>>,
    /// Current first-choice growing segment for new inserts.
    preferred: Option<SegmentId>,
    /// Set by partition removal: no further assigns.
    dropped: bool,
}

pub struct PartitionManager {
    pchannel: String,
    vchannel: VChannel,
    collection_id: CollectionId,
    partition_id: PartitionId,
    resources: Arc<Resources>,
    announcer: Arc<SegmentAnnouncer>,
    persister: Arc<AssignmentPersister>,
    inner: Mutex<PartitionInner>,
    /// Tripped by a state-invariant violation; assigns fail until the
    /// pchannel manager rebuilds this partition from the catalog.
    poisoned: AtomicBool,
}

impl PartitionManager {
    pub fn new(
        pchannel: impl Into<String>,
        vchannel: impl Into<VChannel>,
        collection_id: CollectionId,
        partition_id: PartitionId,
        resources: Arc<Resources>,
        announcer: Arc<SegmentAnnouncer>,
        persister: Arc<AssignmentPersister>,
        segments: Vec<Arc<Segment>>,
    ) -> Self {
        let segments: HashMap<SegmentId, Arc<Segment>> = segments
            .into_iter()
            .map(|s| (s.segment_id(), s))
            .collect();
        Self {
            pchannel: pchannel.into(),
            vchannel: vchannel.into(),
            collection_id,
            partition_id,
            resources,
            announcer,
            persister,
            inner: Mutex::new(PartitionInner {
                segments,
                preferred: None,
                dropped: false,
            }),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn poison(&self, err: &AllocError) {
        error!(
            collection_id = self.collection_id,
            partition_id = self.partition_id,
            error = %err,
            "partition manager poisoned by invariant violation"
        );
        self.poisoned.store(true, Ordering::Release);
    }

    fn belongs_for(&self, segment_id: SegmentId) -> SegmentBelongs {
        SegmentBelongs {
            pchannel: self.pchannel.clone(),
            vchannel: self.vchannel.clone(),
            collection_id: self.collection_id,
            partition_id: self.partition_id,
            segment_id,
        }
    }

    /// Effective seal proportion for a new segment, jittered downwards so
    /// that co-created segments do not all seal on the same tick.
    fn sample_seal_proportion(&self) -> f64 {
        let config = &self.resources.config;
        config.seal_proportion * (1.0 - config.seal_proportion_jitter * rand::random::<f64>())
    }

    /// Assign the insert to a growing segment, creating one if necessary.
    pub async fn assign_segment(
        &self,
        req: &AssignSegmentRequest,
    ) -> Result<AssignSegmentResult> {
        if self.is_poisoned() {
            return Err(AllocError::Internal(format!(
                "partition {} awaiting rebuild",
                self.partition_id
            )));
        }
        let max_binary_size = self.resources.config.max_binary_size();
        if req.insert_metrics.binary_size > max_binary_size {
            return Err(AllocError::TooLargeInsert {
                binary_size: req.insert_metrics.binary_size,
                max_binary_size,
            });
        }

        let mut inner = self.inner.lock().await;
        if inner.dropped {
            return Err(AllocError::PartitionNotFound(self.partition_id));
        }

        // Settle the capacity invariant first: a growing segment pushed over
        // its seal threshold by the previous assign transitions to Sealed
        // before this one is serviced. The flush announcement stays deferred.
        let over_threshold: Vec<Arc<Segment>> = inner
            .segments
            .values()
            .filter(|s| s.state() == SegmentState::Growing && s.is_full())
            .cloned()
            .collect();
        for segment in over_threshold {
            self.seal_in_memory(&mut inner, &segment, SealPolicy::Capacity)
                .await?;
        }

        let segment = match self.select_segment(&mut inner, req.insert_metrics.binary_size) {
            Some(segment) => segment,
            None => self.allocate_growing_segment(&mut inner).await?,
        };

        segment.add_insert(req.insert_metrics, req.time_tick, req.txn_session.clone());
        self.resources
            .stats
            .update_on_insert(segment.segment_id(), req.insert_metrics);
        inner.preferred = Some(segment.segment_id());
        let result = AssignSegmentResult::new(segment.clone());
        drop(inner);

        // Staged, not saved: counter updates ride the coalesced dirty set.
        // A failed threshold flush re-stages the batch, so the record is
        // retained either way.
        if let Err(err) = self.persister.stage(segment.to_meta()).await {
            warn!(
                segment_id = segment.segment_id(),
                error = %err,
                "assignment stat staging deferred"
            );
        }
        Ok(result)
    }

    /// Bin-packing selection: the preferred segment if it still fits,
    /// otherwise the fullest fitting segment, ties to the smallest id.
    fn select_segment(
        &self,
        inner: &mut PartitionInner,
        binary_size: u64,
    ) -> Option<Arc<Segment>> {
        if let Some(preferred) = inner.preferred.and_then(|id| inner.segments.get(&id)) {
            if preferred.can_fit(binary_size) {
                return Some(preferred.clone());
            }
        }
        inner
            .segments
            .values()
            .filter(|s| s.can_fit(binary_size))
            .max_by(|a, b| {
                a.inserted_binary_size()
                    .cmp(&b.inserted_binary_size())
                    .then(b.segment_id().cmp(&a.segment_id()))
            })
            .cloned()
    }

    /// The five-step allocation of a new growing segment. All-or-nothing:
    /// any failure leaves no in-memory trace, and the caller retries with a
    /// fresh time-tick. A persisted Pending record may survive a failure
    /// between the intent save and the Growing save; recovery re-announces
    /// it.
    async fn allocate_growing_segment(
        &self,
        inner: &mut PartitionInner,
    ) -> Result<Arc<Segment>> {
        let max_binary_size = self.resources.config.max_binary_size();

        // 1. segment id from the external allocator
        let segment_id = self
            .resources
            .id_allocator
            .alloc_segment(self.collection_id, self.partition_id)
            .await
            .map_err(|e| AllocError::IdAllocation(e.to_string()))?;
        let belongs = self.belongs_for(segment_id);

        // 2. durable intent: "allocated id but never reached WAL"
        self.persister
            .save(lode_common::SegmentAssignmentMeta {
                collection_id: self.collection_id,
                partition_id: self.partition_id,
                segment_id,
                vchannel: self.vchannel.clone(),
                state: SegmentAssignmentState::Pending,
                stat: None,
            })
            .await?;

        // 3. announce through the WAL; the returned time-tick is the
        //    segment's creation point
        let append = self
            .announcer
            .announce_create(&belongs, max_binary_size)
            .await?;

        let segment = Arc::new(Segment::new(
            belongs,
            max_binary_size,
            self.sample_seal_proportion(),
            append.time_tick,
        ));

        // 4. persist the Growing record
        self.persister.save(segment.to_meta()).await?;

        // 5. publish into the growing set
        inner.segments.insert(segment_id, segment.clone());
        self.resources
            .stats
            .register(segment_id, InsertMetrics::default());
        debug!(
            collection_id = self.collection_id,
            partition_id = self.partition_id,
            segment_id,
            create_time_tick = append.time_tick,
            "allocated new growing segment"
        );
        Ok(segment)
    }

    /// Transition a segment to Sealed in memory and stage the record. The
    /// FlushSegment announcement is deferred to [`PartitionManager::try_flush_ready`].
    async fn seal_in_memory(
        &self,
        _inner: &mut PartitionInner,
        segment: &Arc<Segment>,
        policy: SealPolicy,
    ) -> Result<()> {
        if let Err(err) = segment.transition_to(SegmentState::Sealed) {
            self.poison(&err);
            return Err(err);
        }
        debug!(
            segment_id = segment.segment_id(),
            policy = ?policy,
            "segment sealed"
        );
        // The dirty set retains the record even when the threshold flush
        // fails; the seal announcement flushes it durably.
        if let Err(err) = self.persister.stage(segment.to_meta()).await {
            warn!(
                segment_id = segment.segment_id(),
                error = %err,
                "sealed-state staging deferred"
            );
        }
        Ok(())
    }

    /// Growing segments that should seal by any policy: capacity, stats
    /// threshold, or a force flag (fence, drop, administrative).
    pub async fn collect_seal_candidates(&self) -> Vec<(Arc<Segment>, SealPolicy)> {
        let inner = self.inner.lock().await;
        inner
            .segments
            .values()
            .filter(|s| s.state() == SegmentState::Growing)
            .filter_map(|s| {
                if let Some(policy) = s.seal_flag() {
                    Some((s.clone(), policy))
                } else if s.is_full() {
                    Some((s.clone(), SealPolicy::Capacity))
                } else if self.resources.stats.should_seal(s.segment_id()) {
                    Some((s.clone(), SealPolicy::BinlogCounter))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Seal the given candidates. Transient persistence failures are
    /// swallowed; the inspector retries on its next tick.
    pub async fn seal_segments(&self, candidates: Vec<(Arc<Segment>, SealPolicy)>) {
        let mut inner = self.inner.lock().await;
        for (segment, policy) in candidates {
            if segment.state() != SegmentState::Growing {
                continue;
            }
            // Transition failures poison the partition inside seal_in_memory;
            // nothing to do here but stop touching this segment.
            let _ = self.seal_in_memory(&mut inner, &segment, policy).await;
        }
    }

    /// Unconditional seal request from recovery or an administrator.
    pub async fn must_seal(&self, segment_id: SegmentId) -> Result<()> {
        let segment = {
            let inner = self.inner.lock().await;
            inner
                .segments
                .get(&segment_id)
                .cloned()
                .ok_or(AllocError::SegmentNotFound(segment_id))?
        };
        segment.flag_seal(SealPolicy::Force);
        self.seal_segments(vec![(segment, SealPolicy::Force)]).await;
        Ok(())
    }

    /// Flag every growing segment for a forced seal (partition drop,
    /// collection drop, close) and seal immediately.
    pub async fn seal_all(&self, policy: SealPolicy) {
        let candidates: Vec<(Arc<Segment>, SealPolicy)> = {
            let inner = self.inner.lock().await;
            inner
                .segments
                .values()
                .filter(|s| s.state() == SegmentState::Growing)
                .map(|s| {
                    s.flag_seal(policy);
                    (s.clone(), policy)
                })
                .collect()
        };
        self.seal_segments(candidates).await;
    }

    /// Seal every growing segment created at or before the fence tick.
    pub async fn seal_created_until(&self, time_tick: TimeTick) {
        let candidates: Vec<(Arc<Segment>, SealPolicy)> = {
            let inner = self.inner.lock().await;
            inner
                .segments
                .values()
                .filter(|s| {
                    s.state() == SegmentState::Growing && s.create_timestamp() <= time_tick
                })
                .map(|s| {
                    s.flag_seal(SealPolicy::Fenced);
                    (s.clone(), SealPolicy::Fenced)
                })
                .collect()
        };
        self.seal_segments(candidates).await;
    }

    /// Announce and persist the flush of every sealed segment whose
    /// outstanding assignments are acked and whose transactions are done.
    /// Returns the flushed segment ids. WAL or metastore failures leave the
    /// segment Sealed for the next pass.
    pub async fn try_flush_ready(&self) -> Vec<SegmentId> {
        let ready: Vec<Arc<Segment>> = {
            let inner = self.inner.lock().await;
            inner
                .segments
                .values()
                .filter(|s| s.seal_ready())
                .cloned()
                .collect()
        };

        let mut flushed = Vec::new();
        for segment in ready {
            match self.flush_segment(&segment).await {
                Ok(()) => flushed.push(segment.segment_id()),
                Err(err) if err.is_transient() => {
                    warn!(
                        segment_id = segment.segment_id(),
                        error = %err,
                        "flush announcement deferred"
                    );
                }
                Err(err) => {
                    self.poison(&err);
                }
            }
        }
        flushed
    }

    async fn flush_segment(&self, segment: &Arc<Segment>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        // Re-check under the lock; an ack cannot regress readiness but a
        // concurrent pass may already have flushed it.
        if !inner.segments.contains_key(&segment.segment_id()) || !segment.seal_ready() {
            return Ok(());
        }

        self.announcer.announce_flush(segment.belongs()).await?;
        segment.transition_to(SegmentState::Flushed)?;
        // The WAL already carries the flush; a failed catalog write leaves
        // the Flushed record in the dirty set for the next batch.
        if let Err(err) = self.persister.save(segment.to_meta()).await {
            warn!(
                segment_id = segment.segment_id(),
                error = %err,
                "flushed-state persistence deferred"
            );
        }

        inner.segments.remove(&segment.segment_id());
        if inner.preferred == Some(segment.segment_id()) {
            inner.preferred = None;
        }
        self.resources.stats.unregister(segment.segment_id());
        debug!(
            collection_id = self.collection_id,
            partition_id = self.partition_id,
            segment_id = segment.segment_id(),
            "segment flushed"
        );
        Ok(())
    }

    /// Mark dropped: reject further assigns and force-seal everything.
    pub async fn mark_dropped(&self, policy: SealPolicy) {
        {
            let mut inner = self.inner.lock().await;
            inner.dropped = true;
        }
        self.seal_all(policy).await;
    }

    /// True when this manager owns zero non-flushed segments.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.segments.is_empty()
    }

    /// Count of segments sealed but not yet flushed.
    pub async fn wait_seal_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .segments
            .values()
            .filter(|s| s.state() == SegmentState::Sealed)
            .count()
    }

    /// Ids of non-flushed segments created at or before the given tick.
    pub async fn ids_created_until(&self, time_tick: TimeTick) -> Vec<SegmentId> {
        let inner = self.inner.lock().await;
        inner
            .segments
            .values()
            .filter(|s| s.create_timestamp() <= time_tick)
            .map(|s| s.segment_id())
            .collect()
    }

    /// Whether the segment is still owned here (i.e. not yet flushed).
    pub async fn owns_segment(&self, segment_id: SegmentId) -> bool {
        self.inner.lock().await.segments.contains_key(&segment_id)
    }

    /// Persisted view of every owned segment, for snapshot comparison.
    pub async fn snapshot_metas(&self) -> Vec<lode_common::SegmentAssignmentMeta> {
        let inner = self.inner.lock().await;
        inner.segments.values().map(|s| s.to_meta()).collect()
    }
}
