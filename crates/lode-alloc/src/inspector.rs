//! Background seal inspector.
//!
//! A single task shared by every registered pchannel manager. Each round it
//! re-examines segments whose flush was deferred, then runs a policy seal
//! pass, by calling the managers' public entry points only; locking stays
//! scoped per partition inside the managers. The write path never blocks on
//! this task.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

use crate::pchannel::PChannelManager;

/// Wake capability handed to managers and the stats manager at wiring time.
///
/// Holding only this (rather than the inspector itself) keeps the
/// manager/inspector reference cycle broken: the inspector finds managers by
/// pchannel name, managers reach the inspector through this handle alone.
#[derive(Clone)]
pub struct SealWaker {
    notify: Arc<Notify>,
}

impl SealWaker {
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

/// Background loop driving policy-based sealing for all pchannel managers.
pub struct SegmentSealInspector {
    managers: Arc<DashMap<String, Arc<PChannelManager>>>,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
    _task: tokio::task::JoinHandle<()>,
}

impl SegmentSealInspector {
    pub fn new(tick_interval: Duration) -> Self {
        let managers: Arc<DashMap<String, Arc<PChannelManager>>> = Arc::new(DashMap::new());
        let wake = Arc::new(Notify::new());
        let shutdown = Arc::new(Notify::new());

        let task = Self::start_inspect_task(
            tick_interval,
            managers.clone(),
            wake.clone(),
            shutdown.clone(),
        );

        Self {
            managers,
            wake,
            shutdown,
            _task: task,
        }
    }

    /// The wake handle for this inspector.
    pub fn waker(&self) -> SealWaker {
        SealWaker {
            notify: self.wake.clone(),
        }
    }

    /// Register a recovered manager and hand it the wake capability.
    pub fn register(&self, manager: Arc<PChannelManager>) {
        manager.attach_seal_waker(self.waker());
        info!(pchannel = %manager.pchannel_name(), "pchannel manager registered with seal inspector");
        self.managers
            .insert(manager.pchannel_name().to_string(), manager);
    }

    /// Remove a manager, draining its pending seal work first.
    pub async fn unregister(&self, pchannel: &str) {
        if let Some((_, manager)) = self.managers.remove(pchannel) {
            Self::inspect_manager(&manager).await;
            info!(pchannel, "pchannel manager unregistered from seal inspector");
        }
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    async fn inspect_manager(manager: &Arc<PChannelManager>) {
        manager.try_to_seal_waited_segment().await;
        manager.try_to_seal_segments(&[]).await;
    }

    fn start_inspect_task(
        tick_interval: Duration,
        managers: Arc<DashMap<String, Arc<PChannelManager>>>,
        wake: Arc<Notify>,
        shutdown: Arc<Notify>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // Wait a full interval before the first pass.
            let mut timer = interval_at(Instant::now() + tick_interval, tick_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            debug!(interval_ms = tick_interval.as_millis() as u64, "seal inspector started");

            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = wake.notified() => {}
                    _ = shutdown.notified() => {
                        // Final drain before release.
                        for entry in managers.iter() {
                            Self::inspect_manager(entry.value()).await;
                        }
                        debug!("seal inspector shut down");
                        break;
                    }
                }

                let snapshot: Vec<Arc<PChannelManager>> =
                    managers.iter().map(|e| e.value().clone()).collect();
                for manager in snapshot {
                    Self::inspect_manager(&manager).await;
                }
            }
        })
    }
}

impl Drop for SegmentSealInspector {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}
