//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`AtlasSettings::default()`]
//! 2. If `~/.atlas/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `ATLAS_*` environment overrides (highest priority)
//!
//! Deep merge rules: objects merge recursively, arrays and primitives are
//! replaced entirely, nulls in the source are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::AtlasSettings;

/// Resolve the path to the settings file (`~/.atlas/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".atlas").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<AtlasSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<AtlasSettings> {
    let defaults = serde_json::to_value(AtlasSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: AtlasSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `ATLAS_*` environment overrides to loaded settings.
///
/// Invalid or out-of-range values are silently ignored (the file/default
/// value stays in effect).
pub fn apply_env_overrides(settings: &mut AtlasSettings) {
    if let Some(v) = read_env_string("ATLAS_DB_PATH") {
        settings.database.path = v;
    }
    if let Some(v) = read_env_u32("ATLAS_POOL_SIZE", 1, 256) {
        settings.database.pool_size = v;
    }
    if let Some(v) = read_env_string("ATLAS_STREAM") {
        settings.broker.stream = v;
    }
    if let Some(v) = read_env_string("ATLAS_GROUP") {
        settings.broker.group = v;
    }
    if let Some(v) = read_env_i64("ATLAS_STREAM_MAX_LEN", 1, 100_000_000) {
        settings.broker.max_len = v;
    }
    if let Some(v) = read_env_u32("ATLAS_BATCH_SIZE", 1, 10_000) {
        settings.consumer.batch_size = v as usize;
    }
    if let Some(v) = read_env_u64("ATLAS_BLOCK_MS", 0, 600_000) {
        settings.consumer.block_ms = v;
    }
    if let Some(v) = read_env_u32("ATLAS_MAX_RETRIES", 0, 100) {
        settings.retry.max_retries = v;
    }
    if let Some(v) = read_env_u64("ATLAS_RETRY_BASE_DELAY_MS", 1, 3_600_000) {
        settings.retry.base_delay_ms = v;
    }
    if let Some(v) = read_env_f64("ATLAS_BACKOFF_MULTIPLIER", 1.0, 100.0) {
        settings.retry.backoff_multiplier = v;
    }
    if let Some(v) = read_env_u64("ATLAS_RECONCILE_INTERVAL_SECS", 1, 86_400) {
        settings.reconciliation.interval_secs = v;
    }
    if let Some(v) = read_env_i64("ATLAS_RECONCILE_BATCH_SIZE", 1, 100_000) {
        settings.reconciliation.batch_size = v;
    }
    if let Some(v) = read_env_i64("ATLAS_STALE_THRESHOLD_SECS", 1, 604_800) {
        settings.reconciliation.stale_threshold_secs = v;
    }
    if let Some(v) = read_env_bool("ATLAS_CONFLICT_DETECTION") {
        settings.reconciliation.conflict_detection = v;
    }
    if let Some(v) = read_env_bool("ATLAS_AUTO_REPAIR") {
        settings.reconciliation.auto_repair = v;
    }
    if let Some(v) = read_env_string("ATLAS_LOG") {
        settings.logging.filter = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as an `i64` within a range.
pub fn parse_i64_range(val: &str, min: i64, max: i64) -> Option<i64> {
    let n: i64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as an `f64` within a range.
pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| parse_bool(&v))
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| parse_u32_range(&v, min, max))
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| parse_u64_range(&v, min, max))
}

fn read_env_i64(name: &str, min: i64, max: i64) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| parse_i64_range(&v, min, max))
}

fn read_env_f64(name: &str, min: f64, max: f64) -> Option<f64> {
    std::env::var(name).ok().and_then(|v| parse_f64_range(&v, min, max))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
