//! Reconciliation run vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::event::ParseEventTypeError;

/// What triggered a reconciliation run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// Fired by the background loop on its interval.
    Scheduled,
    /// Started by an operator (one-shot invocation).
    Manual,
    /// Kicked off programmatically by another component.
    Triggered,
}

impl RunType {
    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Triggered => "triggered",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            "triggered" => Ok(Self::Triggered),
            other => Err(ParseEventTypeError(other.to_owned())),
        }
    }
}

/// Lifecycle status of a reconciliation run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// In progress.
    Running,
    /// All phases executed (individual entities may still have failed).
    Completed,
    /// A phase error aborted the run.
    Failed,
}

impl RunStatus {
    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseEventTypeError(other.to_owned())),
        }
    }
}

/// Counters accumulated across the three reconciliation phases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Entities examined by the drift sweep.
    pub entities_checked: i64,
    /// Drift instances found (missing or stale in the graph).
    pub inconsistencies_found: i64,
    /// Drift instances for which a repair event was published.
    pub inconsistencies_repaired: i64,
    /// Conflicts detected or refreshed by the conflict sweep.
    pub conflicts_detected: i64,
    /// Conflict flags cleared because the sides had converged.
    pub conflicts_resolved: i64,
    /// Entities that errored during a sweep.
    pub failed_entities: i64,
}

impl RunCounters {
    /// Sum another counter set into this one.
    pub fn absorb(&mut self, other: Self) {
        self.entities_checked += other.entities_checked;
        self.inconsistencies_found += other.inconsistencies_found;
        self.inconsistencies_repaired += other.inconsistencies_repaired;
        self.conflicts_detected += other.conflicts_detected;
        self.conflicts_resolved += other.conflicts_resolved;
        self.failed_entities += other.failed_entities;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
