//! Segment allocation configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocConfig {
    /// Maximum segment size in megabytes.
    #[serde(default = "default_segment_max_size_mb")]
    pub segment_max_size_mb: u64,

    /// Fraction of the capacity at which a growing segment becomes a seal
    /// candidate.
    #[serde(default = "default_seal_proportion")]
    pub seal_proportion: f64,

    /// Downward jitter applied per segment: each segment samples its
    /// effective proportion in `[seal_proportion * (1 - jitter), seal_proportion]`.
    #[serde(default = "default_seal_proportion_jitter")]
    pub seal_proportion_jitter: f64,

    /// Synced binlog increments after which the stats policy requests a seal.
    #[serde(default = "default_binlog_counter_threshold")]
    pub seal_policy_binlog_counter_threshold: u64,

    /// Background seal inspector tick interval.
    #[serde(default = "default_inspector_interval_ms")]
    pub inspector_interval_ms: u64,

    /// Dirty-record count at which staged metastore writes are flushed.
    #[serde(default = "default_meta_dirty_threshold")]
    pub meta_dirty_threshold: usize,

    /// Recovery retry schedule.
    #[serde(default)]
    pub alloc_backoff: BackoffConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl AllocConfig {
    /// Segment capacity limit in bytes.
    pub fn max_binary_size(&self) -> u64 {
        self.segment_max_size_mb * 1024 * 1024
    }

    pub fn inspector_interval(&self) -> Duration {
        Duration::from_millis(self.inspector_interval_ms)
    }
}

impl BackoffConfig {
    /// Next backoff step, saturating at `max_ms`.
    pub fn next(&self, current: Duration) -> Duration {
        let next = current.as_millis() as f64 * self.multiplier;
        Duration::from_millis((next as u64).min(self.max_ms))
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            segment_max_size_mb: default_segment_max_size_mb(),
            seal_proportion: default_seal_proportion(),
            seal_proportion_jitter: default_seal_proportion_jitter(),
            seal_policy_binlog_counter_threshold: default_binlog_counter_threshold(),
            inspector_interval_ms: default_inspector_interval_ms(),
            meta_dirty_threshold: default_meta_dirty_threshold(),
            alloc_backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

// Default value functions
fn default_segment_max_size_mb() -> u64 { 1 }
fn default_seal_proportion() -> f64 { 0.25 }
fn default_seal_proportion_jitter() -> f64 { 0.1 }
fn default_binlog_counter_threshold() -> u64 { 100 }
fn default_inspector_interval_ms() -> u64 { 100 }
fn default_meta_dirty_threshold() -> usize { 16 }
fn default_backoff_initial_ms() -> u64 { 10 }
fn default_backoff_max_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
