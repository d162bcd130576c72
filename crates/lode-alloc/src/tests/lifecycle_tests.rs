//! Policy, persistence, and failure-path suites.

use std::sync::Arc;
use std::time::Duration;

use lode_common::metadata::MemoryCatalog;
use lode_common::{current_time_tick, SegmentAssignmentState, StreamingCatalog};

use crate::error::AllocError;
use crate::stats::SyncOperationMetrics;
use crate::tests::support::*;
use crate::txn::TxnManager;

#[tokio::test]
async fn stats_policy_seals_after_sync_feedback() {
    let env = setup().await;

    // An unacked assignment keeps the eventual flush deferred.
    let r = env
        .manager
        .assign_segment(&assign_req(1, 3, 100, 100, current_time_tick()))
        .await
        .unwrap();
    assert_eq!(r.segment_id(), 6000);

    // Downstream flushers report enough binlog increments for segment 6000;
    // crossing the threshold also wakes the inspector.
    env.resources.stats.update_on_sync(
        6000,
        SyncOperationMetrics {
            binlog_counter_incr: 100,
        },
    );

    env.manager.try_to_seal_segments(&[]).await;
    assert!(!env.manager.is_no_wait_seal().await);

    r.ack();
    env.manager.try_to_seal_segments(&[]).await;
    assert!(env.manager.is_no_wait_seal().await);
}

#[tokio::test]
async fn seal_path_swallows_wal_failure_and_requeues() {
    let env = setup().await;
    env.wal.set_fail(true);

    // Sealing succeeds in memory; every flush announcement fails.
    env.manager.try_to_seal_segments(&[]).await;
    assert!(!env.manager.is_no_wait_seal().await);

    // Next pass with a healthy WAL drains the queue.
    env.wal.set_fail(false);
    env.manager.try_to_seal_waited_segment().await;
    assert!(env.manager.is_no_wait_seal().await);
}

#[tokio::test]
async fn failed_allocation_leaves_no_memory_trace() {
    let env = setup().await;

    let r = env
        .manager
        .assign_segment(&assign_req(1, 1, 1024, MB, current_time_tick()))
        .await
        .unwrap();
    r.ack();

    // The next assign needs a fresh segment; the CreateSegment append fails.
    env.wal.set_fail(true);
    let err = env
        .manager
        .assign_segment(&assign_req(1, 1, 1024, MB, current_time_tick()))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocError::Wal(_)));

    // All-or-nothing: the caller retries with a fresh tick and succeeds.
    env.wal.set_fail(false);
    let r = env
        .manager
        .assign_segment(&assign_req(1, 1, 1024, MB, current_time_tick()))
        .await
        .unwrap();
    r.ack();

    // The durable Pending intent of the failed attempt is left for the next
    // recovery to re-announce.
    let orphan = env
        .catalog
        .dump_assignments(PCHANNEL)
        .await
        .into_iter()
        .find(|m| m.segment_id == 10_000)
        .unwrap();
    assert_eq!(orphan.state, SegmentAssignmentState::Pending);
}

#[tokio::test]
async fn too_large_insert_is_unrecoverable() {
    let env = setup().await;
    let err = env
        .manager
        .assign_segment(&assign_req(1, 1, 1, MB + 1, current_time_tick()))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocError::TooLargeInsert { .. }));
}

#[tokio::test]
async fn recovery_round_trips_persisted_records() {
    // Growing/Sealed only: recovery must not touch them.
    let fixture: Vec<_> = standard_fixture()
        .into_iter()
        .filter(|m| m.state != SegmentAssignmentState::Pending)
        .collect();
    let env = setup_with(test_config(3_600_000), fixture.clone()).await;

    let snapshot = env.manager.snapshot_metas().await;
    assert_eq!(snapshot, fixture);
}

#[tokio::test]
async fn collection_and_partition_creation_is_idempotent() {
    let env = setup().await;

    env.manager.new_collection(1, PCHANNEL, &[1, 2, 3]);
    env.manager.new_partition(1, 2).unwrap();

    // The recovered fixture is untouched by the duplicate registrations.
    let snapshot = env.manager.snapshot_metas().await;
    let ids: Vec<i64> = snapshot.iter().map(|m| m.segment_id).collect();
    assert_eq!(ids, vec![1000, 2000, 3000, 4000, 5000, 6000]);

    let r = env
        .manager
        .assign_segment(&assign_req(1, 2, 10, 100, current_time_tick()))
        .await
        .unwrap();
    r.ack();
}

#[tokio::test]
async fn multi_partition_failure_is_not_rolled_back() {
    let env = setup().await;

    // First partition of the message assigns and charges segment 5000
    // (fullest fitting segment wins the bin-packing tie).
    let r = env
        .manager
        .assign_segment(&assign_req(1, 2, 10, 100, current_time_tick()))
        .await
        .unwrap();
    assert_eq!(r.segment_id(), 5000);
    r.ack();

    // Second partition of the message fails; the earlier charge stays.
    let err = env
        .manager
        .assign_segment(&assign_req(1, 999, 10, 100, current_time_tick()))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocError::PartitionNotFound(999)));

    let charged = env
        .manager
        .snapshot_metas()
        .await
        .into_iter()
        .find(|m| m.segment_id == 5000)
        .unwrap();
    assert_eq!(charged.stat.unwrap().inserted_binary_size, 1000);
    // The process-wide stats manager carries the same authoritative charge:
    // the recovered 900 plus this message's 100.
    assert_eq!(env.resources.stats.inserted_binary_size(5000), Some(1000));
}

#[tokio::test]
async fn must_seal_bypasses_policy() {
    let env = setup().await;

    // Segment 3000 is far from any policy threshold; seal it anyway. The
    // recovered-sealed 4000 drains in the same announcement pass, while the
    // capacity-full 2000 is left alone: no policy pass runs here.
    env.manager
        .must_seal_segments(&[crate::stats::SegmentBelongs {
            pchannel: PCHANNEL.to_string(),
            vchannel: PCHANNEL.to_string(),
            collection_id: 1,
            partition_id: 2,
            segment_id: 3000,
        }])
        .await;

    let ids: Vec<i64> = env
        .manager
        .snapshot_metas()
        .await
        .into_iter()
        .map(|m| m.segment_id)
        .collect();
    assert!(!ids.contains(&3000));
    assert!(!ids.contains(&4000));
    assert!(ids.contains(&2000));
}

#[tokio::test]
async fn inspector_drives_seals_in_background() {
    let env = setup_with(test_config(10), standard_fixture()).await;

    let r1 = env
        .manager
        .assign_segment(&assign_req(1, 1, 1024, MB, current_time_tick()))
        .await
        .unwrap();
    let r2 = env
        .manager
        .assign_segment(&assign_req(1, 1, 1024, MB, current_time_tick()))
        .await
        .unwrap();
    r1.ack();
    r2.ack();

    // No manual seal calls: the background loop collects, seals, announces.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(env.manager.is_no_wait_seal().await);
}

#[tokio::test]
async fn expired_txn_no_longer_pins_segments() {
    let env = setup().await;
    let txn_manager = TxnManager::new();
    let session = txn_manager.begin(Duration::ZERO);

    let mut req = assign_req(1, 1, 1024, MB, current_time_tick());
    req.txn_session = Some(session);
    let r = env.manager.assign_segment(&req).await.unwrap();
    r.ack();

    env.manager.try_to_seal_segments(&[]).await;
    assert!(env.manager.is_no_wait_seal().await);
}

#[tokio::test]
async fn close_drains_and_flushes_metadata() {
    let env = setup().await;

    let r = env
        .manager
        .assign_segment(&assign_req(1, 1, 100, 100, current_time_tick()))
        .await
        .unwrap();
    r.ack();

    tokio::time::timeout(Duration::from_secs(5), env.manager.close())
        .await
        .expect("close should drain promptly with acked assignments");

    assert!(env.manager.is_no_wait_seal().await);
    // Everything reached Flushed, and flushed records are deleted.
    assert!(env.catalog.dump_assignments(PCHANNEL).await.is_empty());
    assert_eq!(env.resources.stats.tracked_segments(), 0);
}

/// Catalog wrapper that fails its first few coordinator lookups.
struct FlakyCatalog {
    inner: MemoryCatalog,
    remaining_failures: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl lode_common::StreamingCatalog for FlakyCatalog {
    async fn list_pchannel_collections(
        &self,
        pchannel: &str,
    ) -> lode_common::metadata::Result<Vec<lode_common::CollectionInfo>> {
        use std::sync::atomic::Ordering;
        if self
            .remaining_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(lode_common::MetadataError::Storage(
                "coordinator unavailable".to_string(),
            ));
        }
        self.inner.list_pchannel_collections(pchannel).await
    }

    async fn list_segment_assignments(
        &self,
        pchannel: &str,
    ) -> lode_common::metadata::Result<Vec<lode_common::SegmentAssignmentMeta>> {
        self.inner.list_segment_assignments(pchannel).await
    }

    async fn save_segment_assignments(
        &self,
        pchannel: &str,
        metas: Vec<lode_common::SegmentAssignmentMeta>,
    ) -> lode_common::metadata::Result<()> {
        self.inner.save_segment_assignments(pchannel, metas).await
    }
}

#[tokio::test]
async fn recovery_with_backoff_retries_catalog_failures() {
    let catalog = Arc::new(FlakyCatalog {
        inner: MemoryCatalog::new(),
        remaining_failures: std::sync::atomic::AtomicUsize::new(2),
    });
    let resources = crate::resource::Resources::builder()
        .config(test_config(3_600_000))
        .catalog(catalog)
        .id_allocator(Arc::new(
            lode_common::metadata::CounterIdAllocator::new(10_000),
        ))
        .build();
    let wal: crate::wal::WalFuture = Arc::new(lode_common::FutureCell::ready(
        Arc::new(MockWal::new(1000)) as Arc<dyn crate::wal::Wal>,
    ));
    let shutdown = Arc::new(tokio::sync::Notify::new());

    let manager = crate::pchannel::PChannelManager::recover_with_backoff(
        resources,
        lode_common::PChannelInfo::new(PCHANNEL),
        wal,
        shutdown,
    )
    .await
    .unwrap();
    assert!(manager.is_no_wait_seal().await);
}
