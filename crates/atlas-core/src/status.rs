//! The [`EventLogStatus`] state machine for outbox rows.
//!
//! `PENDING → PUBLISHED → PROCESSING → {COMPLETED | FAILED | SKIPPED}`,
//! plus the retry edge `PROCESSING → PUBLISHED` (a failed apply below its
//! retry budget goes back to PUBLISHED so the reconciliation sweep can
//! re-drive it). Terminal states have no outgoing edges. Every repository
//! transition validates against [`EventLogStatus::can_transition_to`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::event::ParseEventTypeError;

/// Lifecycle status of an outbox (event log) row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventLogStatus {
    /// Written to the outbox, not yet on the stream.
    Pending,
    /// Appended to the stream, awaiting a consumer.
    Published,
    /// Claimed by a consumer, apply in flight.
    Processing,
    /// Applied to the secondary store.
    Completed,
    /// Retry budget exhausted; operator intervention required.
    Failed,
    /// Deliberately not applied (stale version or malformed payload).
    Skipped,
}

/// All status variants, for exhaustive testing.
pub const ALL_STATUSES: &[EventLogStatus] = &[
    EventLogStatus::Pending,
    EventLogStatus::Published,
    EventLogStatus::Processing,
    EventLogStatus::Completed,
    EventLogStatus::Failed,
    EventLogStatus::Skipped,
];

impl EventLogStatus {
    /// Stable string form (stored in the database, matched in SQL filters).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Published => "PUBLISHED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Whether the status has no outgoing transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether a transition to `to` is legal.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        match self {
            Self::Pending => matches!(to, Self::Published | Self::Processing | Self::Skipped),
            Self::Published => matches!(to, Self::Processing | Self::Published),
            Self::Processing => matches!(
                to,
                Self::Completed | Self::Failed | Self::Skipped | Self::Published
            ),
            Self::Completed | Self::Failed | Self::Skipped => false,
        }
    }
}

impl fmt::Display for EventLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLogStatus {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STATUSES
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ParseEventTypeError(s.to_owned()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
