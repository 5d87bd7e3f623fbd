//! Error types for the audit/status store.

use atlas_core::EventLogStatus;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Which migration failed and why.
        message: String,
    },

    /// Requested event log row was not found.
    #[error("event not found: {0}")]
    EventNotFound(String),

    /// Requested conflict record was not found.
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    /// Requested reconciliation run was not found.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// A compare-and-swap update lost a race with a concurrent writer.
    #[error("concurrent modification of event {event_id} (expected row_version {expected})")]
    RowVersionConflict {
        /// The contested event log row.
        event_id: String,
        /// The row version the caller held.
        expected: i64,
    },

    /// A status transition violated the event log state machine.
    #[error("illegal status transition for {event_id}: {from} -> {to}")]
    IllegalTransition {
        /// The event log row.
        event_id: String,
        /// Current status.
        from: EventLogStatus,
        /// Requested status.
        to: EventLogStatus,
    },

    /// A stored value failed to parse back into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
