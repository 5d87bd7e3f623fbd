//! Prefixed ID generation.
//!
//! Every durable record gets a UUID v7 (time-ordered) with a short type
//! prefix, so an ID read out of a log line or a database row is
//! self-describing. Correlation IDs group related events across the
//! publisher, consumer, and reconciliation paths.

use uuid::Uuid;

fn prefixed(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7())
}

/// Generate a sync event ID (`evt_…`).
#[must_use]
pub fn event_id() -> String {
    prefixed("evt")
}

/// Generate a correlation ID (`cor_…`).
#[must_use]
pub fn correlation_id() -> String {
    prefixed("cor")
}

/// Generate a conflict record ID (`cfl_…`).
#[must_use]
pub fn conflict_id() -> String {
    prefixed("cfl")
}

/// Generate a reconciliation run ID (`run_…`).
#[must_use]
pub fn run_id() -> String {
    prefixed("run")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
