//! Process-wide resource container.
//!
//! The stats manager and the seal inspector are singletons by necessity
//! (cross-pchannel aggregation, one background worker). They are injected
//! through this container rather than module-scoped statics, so tests build
//! per-case instances and lifecycle stays explicit: construct on node
//! start, drop on node stop.

use std::sync::Arc;

use lode_common::{SegmentIdAllocator, StreamingCatalog};

use crate::config::AllocConfig;
use crate::inspector::SegmentSealInspector;
use crate::stats::SegmentAssignStatsManager;

pub struct Resources {
    pub config: AllocConfig,
    pub catalog: Arc<dyn StreamingCatalog>,
    pub id_allocator: Arc<dyn SegmentIdAllocator>,
    pub stats: Arc<SegmentAssignStatsManager>,
    pub inspector: Arc<SegmentSealInspector>,
}

impl Resources {
    pub fn builder() -> ResourcesBuilder {
        ResourcesBuilder::default()
    }
}

#[derive(Default)]
pub struct ResourcesBuilder {
    config: Option<AllocConfig>,
    catalog: Option<Arc<dyn StreamingCatalog>>,
    id_allocator: Option<Arc<dyn SegmentIdAllocator>>,
}

impl ResourcesBuilder {
    pub fn config(mut self, config: AllocConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn StreamingCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn id_allocator(mut self, id_allocator: Arc<dyn SegmentIdAllocator>) -> Self {
        self.id_allocator = Some(id_allocator);
        self
    }

    /// Build the container, wiring the stats manager's wake capability to
    /// the inspector.
    ///
    /// # Panics
    ///
    /// Panics if the catalog or id allocator were not provided; both are
    /// mandatory collaborators.
    pub fn build(self) -> Arc<Resources> {
        let config = self.config.unwrap_or_default();
        let catalog = self.catalog.expect("resources require a streaming catalog");
        let id_allocator = self
            .id_allocator
            .expect("resources require a segment id allocator");

        let stats = Arc::new(SegmentAssignStatsManager::new(
            config.seal_policy_binlog_counter_threshold,
        ));
        let inspector = Arc::new(SegmentSealInspector::new(config.inspector_interval()));
        stats.set_waker(inspector.waker());

        Arc::new(Resources {
            config,
            catalog,
            id_allocator,
            stats,
            inspector,
        })
    }
}
