//! Settings tree with compiled defaults.
//!
//! Every section and field carries a `#[serde(default)]` so a partial
//! settings file only overrides what it mentions.

use atlas_core::RetryConfig;
use serde::{Deserialize, Serialize};

/// Root settings for all Atlas sync processes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasSettings {
    /// Database location and pooling.
    pub database: DatabaseSettings,
    /// Stream and consumer-group names.
    pub broker: BrokerSettings,
    /// Consumer loop tuning.
    pub consumer: ConsumerSettings,
    /// Retry budget and backoff.
    pub retry: RetryConfig,
    /// Reconciliation job tuning.
    pub reconciliation: ReconciliationSettings,
    /// Logging filter.
    pub logging: LoggingSettings,
}

/// Database location and pooling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Path to the shared `SQLite` database file.
    pub path: String,
    /// Connection pool size per process.
    pub pool_size: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            path: format!("{home}/.atlas/atlas.db"),
            pool_size: 16,
        }
    }
}

/// Stream and consumer-group names.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Stream name events are appended to.
    pub stream: String,
    /// Consumer group shared by all consumer processes.
    pub group: String,
    /// Approximate cap on stored stream entries.
    pub max_len: i64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            stream: "atlas:sync:events".into(),
            group: "graph-sync".into(),
            max_len: 10_000,
        }
    }
}

/// Consumer loop tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Messages per batched read.
    pub batch_size: usize,
    /// Bounded blocking wait per poll, in milliseconds.
    pub block_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block_ms: 5_000,
        }
    }
}

/// Reconciliation job tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationSettings {
    /// Sleep between runs of the continuous loop, in seconds.
    pub interval_secs: u64,
    /// Entities per type examined by the drift sweep.
    pub batch_size: i64,
    /// Age after which an in-flight event counts as stuck, in seconds.
    pub stale_threshold_secs: i64,
    /// Whether the conflict sweep runs.
    pub conflict_detection: bool,
    /// Whether the drift sweep publishes repair events (vs. count only).
    pub auto_repair: bool,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            batch_size: 100,
            stale_threshold_secs: 600,
            conflict_detection: true,
            auto_repair: true,
        }
    }
}

/// Logging filter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing` env-filter directive (e.g. `info`, `atlas_sync=debug`).
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
