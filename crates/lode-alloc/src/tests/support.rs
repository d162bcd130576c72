//! Shared fixtures and doubles for the integration suites.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use lode_common::metadata::{CounterIdAllocator, MemoryCatalog};
use lode_common::{
    CollectionInfo, FutureCell, PChannelInfo, SegmentAssignmentMeta, SegmentAssignmentState,
    SegmentAssignmentStat, TimeTick,
};

use crate::config::AllocConfig;
use crate::error::{AllocError, Result};
use crate::message::SegmentMessage;
use crate::partition::AssignSegmentRequest;
use crate::pchannel::PChannelManager;
use crate::resource::Resources;
use crate::stats::InsertMetrics;
use crate::wal::{AppendResult, Wal, WalFuture};

pub const PCHANNEL: &str = "v1";

/// WAL double: hands out monotonic time-ticks, records every appended
/// message, and can be told to fail appends.
pub struct MockWal {
    next_tick: AtomicU64,
    next_message_id: AtomicI64,
    appended: Mutex<Vec<SegmentMessage>>,
    fail: AtomicBool,
}

impl MockWal {
    pub fn new(first_tick: TimeTick) -> Self {
        Self {
            next_tick: AtomicU64::new(first_tick),
            next_message_id: AtomicI64::new(1),
            appended: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub fn appended(&self) -> Vec<SegmentMessage> {
        self.appended.lock().clone()
    }
}

#[async_trait]
impl Wal for MockWal {
    async fn append(&self, msg: SegmentMessage) -> Result<AppendResult> {
        if self.fail.load(Ordering::Acquire) {
            return Err(AllocError::Wal("append rejected by test".to_string()));
        }
        let time_tick = self.next_tick.fetch_add(1, Ordering::Relaxed) + 1;
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        self.appended.lock().push(msg);
        Ok(AppendResult {
            message_id,
            time_tick,
        })
    }
}

pub struct TestEnv {
    pub manager: Arc<PChannelManager>,
    pub resources: Arc<Resources>,
    pub catalog: Arc<MemoryCatalog>,
    pub wal: Arc<MockWal>,
}

pub fn test_config(inspector_interval_ms: u64) -> AllocConfig {
    AllocConfig {
        segment_max_size_mb: 1,
        seal_proportion: 1.0,
        seal_proportion_jitter: 0.0,
        inspector_interval_ms,
        ..AllocConfig::default()
    }
}

pub fn fixture_stat(inserted: u64, max: u64) -> SegmentAssignmentStat {
    SegmentAssignmentStat {
        max_binary_size: max,
        inserted_rows: inserted,
        inserted_binary_size: inserted,
        create_timestamp: 500,
        last_modified_timestamp: 600,
    }
}

fn fixture_meta(
    partition_id: i64,
    segment_id: i64,
    state: SegmentAssignmentState,
    stat: Option<SegmentAssignmentStat>,
) -> SegmentAssignmentMeta {
    SegmentAssignmentMeta {
        collection_id: 1,
        partition_id,
        segment_id,
        vchannel: PCHANNEL.to_string(),
        state,
        stat,
    }
}

/// The standard recovery fixture:
///
/// ```text
/// c 1
///   p 1: s 1000 pending
///   p 2: s 2000 growing(1000/1000), 3000 growing(100/1000),
///        s 4000 sealed(900/1000),   5000 growing(900/1000)
///   p 3: s 6000 growing(100/1000)
/// ```
pub fn standard_fixture() -> Vec<SegmentAssignmentMeta> {
    use SegmentAssignmentState::*;
    vec![
        fixture_meta(1, 1000, Pending, None),
        fixture_meta(2, 2000, Growing, Some(fixture_stat(1000, 1000))),
        fixture_meta(2, 3000, Growing, Some(fixture_stat(100, 1000))),
        fixture_meta(2, 4000, Sealed, Some(fixture_stat(900, 1000))),
        fixture_meta(2, 5000, Growing, Some(fixture_stat(900, 1000))),
        fixture_meta(3, 6000, Growing, Some(fixture_stat(100, 1000))),
    ]
}

pub async fn seed_catalog(catalog: &MemoryCatalog, metas: Vec<SegmentAssignmentMeta>) {
    catalog
        .put_collections(
            PCHANNEL,
            vec![CollectionInfo {
                collection_id: 1,
                vchannel: PCHANNEL.to_string(),
                partitions: vec![1, 2, 3],
            }],
        )
        .await;
    catalog.put_assignments(PCHANNEL, metas).await;
}

/// Recover a manager over the standard fixture. The inspector interval is
/// effectively infinite so tests drive seal passes by hand.
pub async fn setup() -> TestEnv {
    setup_with(test_config(3_600_000), standard_fixture()).await
}

pub async fn setup_with(config: AllocConfig, metas: Vec<SegmentAssignmentMeta>) -> TestEnv {
    let catalog = Arc::new(MemoryCatalog::new());
    seed_catalog(&catalog, metas).await;
    setup_on_catalog(config, catalog).await
}

pub async fn setup_on_catalog(config: AllocConfig, catalog: Arc<MemoryCatalog>) -> TestEnv {
    let resources = Resources::builder()
        .config(config)
        .catalog(catalog.clone())
        .id_allocator(Arc::new(CounterIdAllocator::new(10_000)))
        .build();

    let wal = Arc::new(MockWal::new(1000));
    let wal_future: WalFuture = Arc::new(FutureCell::ready(wal.clone() as Arc<dyn Wal>));

    let manager = PChannelManager::recover(
        resources.clone(),
        PChannelInfo::new(PCHANNEL),
        wal_future,
    )
    .await
    .expect("recovery over the in-memory catalog cannot fail");

    TestEnv {
        manager,
        resources,
        catalog,
        wal,
    }
}

pub fn assign_req(
    collection_id: i64,
    partition_id: i64,
    rows: u64,
    binary_size: u64,
    time_tick: TimeTick,
) -> AssignSegmentRequest {
    AssignSegmentRequest {
        collection_id,
        partition_id,
        insert_metrics: InsertMetrics { rows, binary_size },
        time_tick,
        txn_session: None,
    }
}

pub const MB: u64 = 1024 * 1024;
