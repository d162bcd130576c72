//! Segment entity and stat accumulator.
//!
//! A segment is the single source of truth for "is this segment full?". Its
//! counters are guarded by the innermost lock of the hierarchy; mutations
//! never suspend.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use lode_common::{
    SegmentAssignmentMeta, SegmentAssignmentState, SegmentAssignmentStat, SegmentId, TimeTick,
};

use crate::error::{AllocError, Result};
use crate::stats::{InsertMetrics, SegmentBelongs};
use crate::txn::TxnSession;

/// In-memory lifecycle state, mirrored one-for-one by
/// [`SegmentAssignmentState`] in the metastore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentState {
    Pending,
    Growing,
    Sealed,
    Flushed,
}

impl SegmentState {
    fn rank(self) -> u8 {
        match self {
            SegmentState::Pending => 0,
            SegmentState::Growing => 1,
            SegmentState::Sealed => 2,
            SegmentState::Flushed => 3,
        }
    }

    /// Transitions are strictly monotonic; no back edges, no skips past
    /// Growing -> Sealed -> Flushed.
    fn can_transition_to(self, next: SegmentState) -> bool {
        next.rank() == self.rank() + 1
    }
}

impl From<SegmentState> for SegmentAssignmentState {
    fn from(state: SegmentState) -> Self {
        match state {
            SegmentState::Pending => SegmentAssignmentState::Pending,
            SegmentState::Growing => SegmentAssignmentState::Growing,
            SegmentState::Sealed => SegmentAssignmentState::Sealed,
            SegmentState::Flushed => SegmentAssignmentState::Flushed,
        }
    }
}

impl From<SegmentAssignmentState> for SegmentState {
    fn from(state: SegmentAssignmentState) -> Self {
        match state {
            SegmentAssignmentState::Pending => SegmentState::Pending,
            SegmentAssignmentState::Growing => SegmentState::Growing,
            SegmentAssignmentState::Sealed => SegmentState::Sealed,
            SegmentAssignmentState::Flushed => SegmentState::Flushed,
        }
    }
}

/// Why a segment was (or should be) sealed. Carried for logging and for
/// force-seal flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealPolicy {
    /// Inserted size reached the jittered seal proportion of the capacity.
    Capacity,
    /// Synced binlog increments crossed the configured threshold.
    BinlogCounter,
    /// Sealed by a manual-flush fence.
    Fenced,
    PartitionRemoved,
    CollectionRemoved,
    /// Administrative or recovery-driven seal, bypassing policy.
    Force,
}

struct SegmentInner {
    state: SegmentState,
    inserted_rows: u64,
    inserted_binary_size: u64,
    last_modified_timestamp: TimeTick,
    /// Uncommitted transaction sessions that have written to this segment.
    txn_refs: Vec<Arc<TxnSession>>,
    /// Pending force-seal request, if any.
    seal_flag: Option<SealPolicy>,
}

/// A growing or sealed segment owned by one partition manager.
pub struct Segment {
    belongs: SegmentBelongs,
    max_binary_size: u64,
    /// Seal proportion after per-segment jitter, fixed at creation.
    effective_seal_proportion: f64,
    create_timestamp: TimeTick,
    /// Issued minus acked assignments.
    outstanding: AtomicU64,
    inner: Mutex<SegmentInner>,
}

impl Segment {
    /// A freshly announced growing segment. `create_timestamp` is the WAL
    /// time-tick of its CreateSegment message.
    pub fn new(
        belongs: SegmentBelongs,
        max_binary_size: u64,
        effective_seal_proportion: f64,
        create_timestamp: TimeTick,
    ) -> Self {
        Self {
            belongs,
            max_binary_size,
            effective_seal_proportion,
            create_timestamp,
            outstanding: AtomicU64::new(0),
            inner: Mutex::new(SegmentInner {
                state: SegmentState::Growing,
                inserted_rows: 0,
                inserted_binary_size: 0,
                last_modified_timestamp: create_timestamp,
                txn_refs: Vec::new(),
                seal_flag: None,
            }),
        }
    }

    /// Restore a segment from its persisted record. Pending records are not
    /// restorable here; they are re-announced and enter through [`Segment::new`].
    pub fn restore(
        belongs: SegmentBelongs,
        stat: SegmentAssignmentStat,
        state: SegmentState,
        effective_seal_proportion: f64,
    ) -> Self {
        Self {
            belongs,
            max_binary_size: stat.max_binary_size,
            effective_seal_proportion,
            create_timestamp: stat.create_timestamp,
            outstanding: AtomicU64::new(0),
            inner: Mutex::new(SegmentInner {
                state,
                inserted_rows: stat.inserted_rows,
                inserted_binary_size: stat.inserted_binary_size,
                last_modified_timestamp: stat.last_modified_timestamp,
                txn_refs: Vec::new(),
                seal_flag: None,
            }),
        }
    }

    pub fn belongs(&self) -> &SegmentBelongs {
        &self.belongs
    }

    pub fn segment_id(&self) -> SegmentId {
        self.belongs.segment_id
    }

    pub fn state(&self) -> SegmentState {
        self.inner.lock().state
    }

    pub fn create_timestamp(&self) -> TimeTick {
        self.create_timestamp
    }

    pub fn max_binary_size(&self) -> u64 {
        self.max_binary_size
    }

    pub fn inserted_binary_size(&self) -> u64 {
        self.inner.lock().inserted_binary_size
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Whether an insert of `binary_size` can be charged without exceeding
    /// the capacity limit.
    pub fn can_fit(&self, binary_size: u64) -> bool {
        let inner = self.inner.lock();
        inner.state == SegmentState::Growing
            && inner.inserted_binary_size + binary_size <= self.max_binary_size
    }

    /// Capacity seal policy: inserted size reached the jittered proportion
    /// of the limit.
    pub fn is_full(&self) -> bool {
        let threshold = (self.max_binary_size as f64 * self.effective_seal_proportion) as u64;
        self.inner.lock().inserted_binary_size >= threshold
    }

    /// Charge an insert and record its time-tick. The caller holds the
    /// partition lock and has already checked [`Segment::can_fit`].
    pub fn add_insert(
        &self,
        metrics: InsertMetrics,
        time_tick: TimeTick,
        txn: Option<Arc<TxnSession>>,
    ) {
        let mut inner = self.inner.lock();
        inner.inserted_rows += metrics.rows;
        inner.inserted_binary_size += metrics.binary_size;
        inner.last_modified_timestamp = time_tick;
        if let Some(session) = txn {
            if !inner.txn_refs.iter().any(|s| s.id() == session.id()) {
                inner.txn_refs.push(session);
            }
        }
    }

    pub(crate) fn inc_outstanding(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_outstanding(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Request a policy-bypassing seal; picked up by the next seal pass.
    pub fn flag_seal(&self, policy: SealPolicy) {
        let mut inner = self.inner.lock();
        if inner.state == SegmentState::Growing && inner.seal_flag.is_none() {
            inner.seal_flag = Some(policy);
        }
    }

    pub fn seal_flag(&self) -> Option<SealPolicy> {
        self.inner.lock().seal_flag
    }

    /// Validated lifecycle transition.
    pub fn transition_to(&self, next: SegmentState) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition_to(next) {
            return Err(AllocError::InvalidStateTransition {
                segment_id: self.belongs.segment_id,
                from: inner.state,
                to: next,
            });
        }
        debug!(
            segment_id = self.belongs.segment_id,
            from = ?inner.state,
            to = ?next,
            "segment state transition"
        );
        inner.state = next;
        Ok(())
    }

    /// A sealed segment may be flushed once every outstanding assignment is
    /// acked and no referencing transaction is still open. Done sessions are
    /// pruned as a side effect.
    pub fn seal_ready(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SegmentState::Sealed {
            return false;
        }
        inner.txn_refs.retain(|session| !session.is_done());
        inner.txn_refs.is_empty() && self.outstanding.load(Ordering::Acquire) == 0
    }

    /// Current counters in persisted form.
    pub fn snapshot_stat(&self) -> SegmentAssignmentStat {
        let inner = self.inner.lock();
        SegmentAssignmentStat {
            max_binary_size: self.max_binary_size,
            inserted_rows: inner.inserted_rows,
            inserted_binary_size: inner.inserted_binary_size,
            create_timestamp: self.create_timestamp,
            last_modified_timestamp: inner.last_modified_timestamp,
        }
    }

    /// Persisted record for the current state.
    pub fn to_meta(&self) -> SegmentAssignmentMeta {
        SegmentAssignmentMeta {
            collection_id: self.belongs.collection_id,
            partition_id: self.belongs.partition_id,
            segment_id: self.belongs.segment_id,
            vchannel: self.belongs.vchannel.clone(),
            state: self.state().into(),
            stat: Some(self.snapshot_stat()),
        }
    }
}

/// Handle returned to the caller of an assign.
///
/// [`AssignSegmentResult::ack`] signals that the assigned record reached
/// durable storage; it releases the outstanding reference exactly once and
/// is a no-op afterwards. Results are deliberately not acked on drop: the
/// ack is the caller's durability signal, not a liveness convenience.
pub struct AssignSegmentResult {
    segment: Arc<Segment>,
    acked: AtomicBool,
}

impl std::fmt::Debug for AssignSegmentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignSegmentResult")
            .field("segment_id", &self.segment.segment_id())
            .field("acked", &self.acked.load(Ordering::Acquire))
            .finish()
    }
}

impl AssignSegmentResult {
    pub(crate) fn new(segment: Arc<Segment>) -> Self {
        segment.inc_outstanding();
        Self {
            segment,
            acked: AtomicBool::new(false),
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment.segment_id()
    }

    /// Release the outstanding reference. Idempotent.
    pub fn ack(&self) {
        if !self.acked.swap(true, Ordering::AcqRel) {
            self.segment.dec_outstanding();
        }
    }
}
