//! Error types for the broker boundary.

use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The consumer group does not exist on the stream.
    #[error("unknown group '{group}' on stream '{stream}'")]
    UnknownGroup {
        /// Stream name.
        stream: String,
        /// Group name.
        group: String,
    },
}

/// Convenience type alias for broker results.
pub type Result<T> = std::result::Result<T, BrokerError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
