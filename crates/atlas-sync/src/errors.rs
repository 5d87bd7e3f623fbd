//! The engine's error taxonomy.
//!
//! Outcomes the loops need to tell apart:
//!
//! - [`SyncError::Transient`] — infrastructure unreachable; the event stays
//!   in its current status and reconciliation re-drives it later
//! - [`SyncError::MalformedEvent`] — unparsable payload or unknown type;
//!   the event is SKIPPED with a reason and never retried
//! - [`SyncError::RetriesExhausted`] — terminal FAILED; operator territory
//! - [`SyncError::ReverseSyncUnsupported`] — a resolution failure, surfaced
//!   distinctly from processing errors
//!
//! A stale-version skip is *not* an error — it is a normal
//! [`ApplyOutcome::Skipped`](crate::consumer::ApplyOutcome) result.

use atlas_broker::BrokerError;
use atlas_store::StoreError;
use thiserror::Error;

/// Errors produced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Broker or store temporarily unreachable.
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// Unparsable payload, unknown event type, or missing required fields.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Retry budget exhausted for an event.
    #[error("retries exhausted for event {0}")]
    RetriesExhausted(String),

    /// Reverse synchronization (graph → source) was requested but is
    /// disallowed: the source store is authoritative.
    #[error("reverse synchronization is not supported; source store is authoritative")]
    ReverseSyncUnsupported,

    /// Audit store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Broker failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Event construction failure.
    #[error(transparent)]
    Event(#[from] atlas_core::EventError),
}

impl SyncError {
    /// Whether retrying later can plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Store(_) | Self::Broker(_)
        )
    }
}

/// Convenience type alias for engine results.
pub type Result<T> = std::result::Result<T, SyncError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(SyncError::Transient("graph down".into()).is_retryable());
    }

    #[test]
    fn malformed_is_not_retryable() {
        assert!(!SyncError::MalformedEvent("bad json".into()).is_retryable());
        assert!(!SyncError::ReverseSyncUnsupported.is_retryable());
        assert!(!SyncError::RetriesExhausted("evt_1".into()).is_retryable());
    }

    #[test]
    fn store_errors_convert() {
        let err: SyncError = StoreError::EventNotFound("evt_1".into()).into();
        assert!(matches!(err, SyncError::Store(_)));
        assert!(err.to_string().contains("evt_1"));
    }

    #[test]
    fn reverse_sync_display_names_the_authority() {
        assert!(SyncError::ReverseSyncUnsupported
            .to_string()
            .contains("authoritative"));
    }
}
