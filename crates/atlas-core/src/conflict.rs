//! Conflict classification and resolution vocabulary.
//!
//! A conflict exists when both stores were modified independently since the
//! last successful sync. Detection produces a [`ConflictType`]; resolution
//! applies a [`ResolutionStrategy`] and lands the record in a terminal
//! [`ResolutionStatus`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::event::ParseEventTypeError;

/// How the two stores diverged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Both sides modified since the last sync (timestamps both newer).
    VersionMismatch,
    /// Semantic field values differ between the two snapshots.
    DataDivergence,
    /// One side deleted what the other side modified.
    DeletionConflict,
    /// Edge endpoints or relationship metadata disagree.
    RelationshipConflict,
    /// Snapshot shapes are structurally incompatible.
    SchemaMismatch,
}

impl ConflictType {
    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::DataDivergence => "DATA_DIVERGENCE",
            Self::DeletionConflict => "DELETION_CONFLICT",
            Self::RelationshipConflict => "RELATIONSHIP_CONFLICT",
            Self::SchemaMismatch => "SCHEMA_MISMATCH",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictType {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VERSION_MISMATCH" => Ok(Self::VersionMismatch),
            "DATA_DIVERGENCE" => Ok(Self::DataDivergence),
            "DELETION_CONFLICT" => Ok(Self::DeletionConflict),
            "RELATIONSHIP_CONFLICT" => Ok(Self::RelationshipConflict),
            "SCHEMA_MISMATCH" => Ok(Self::SchemaMismatch),
            other => Err(ParseEventTypeError(other.to_owned())),
        }
    }
}

/// How a conflict should be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// Newest `updated_at` wins; ties go to the source store.
    LastWriteWins,
    /// Field-level merge. Degrades to [`Self::LastWriteWins`] — no
    /// field-level merge is implemented at record granularity.
    Merge,
    /// Push the source snapshot into the graph unconditionally.
    SourceWins,
    /// Push the graph snapshot back into the source store. Disallowed:
    /// the source store is authoritative and reverse sync is not built.
    TargetWins,
    /// Park for a human; no data is touched.
    Manual,
    /// Acknowledge and ignore; no data is touched.
    Ignore,
}

impl ResolutionStrategy {
    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastWriteWins => "LAST_WRITE_WINS",
            Self::Merge => "MERGE",
            Self::SourceWins => "SOURCE_WINS",
            Self::TargetWins => "TARGET_WINS",
            Self::Manual => "MANUAL",
            Self::Ignore => "IGNORE",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LAST_WRITE_WINS" => Ok(Self::LastWriteWins),
            "MERGE" => Ok(Self::Merge),
            "SOURCE_WINS" => Ok(Self::SourceWins),
            "TARGET_WINS" => Ok(Self::TargetWins),
            "MANUAL" => Ok(Self::Manual),
            "IGNORE" => Ok(Self::Ignore),
            other => Err(ParseEventTypeError(other.to_owned())),
        }
    }
}

/// Lifecycle status of a conflict record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    /// Recorded, not yet acted on.
    Detected,
    /// A strategy was applied and data converged.
    Resolved,
    /// Parked for operator review.
    ManualReview,
    /// Deliberately left as-is.
    Ignored,
}

impl ResolutionStatus {
    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "DETECTED",
            Self::Resolved => "RESOLVED",
            Self::ManualReview => "MANUAL_REVIEW",
            Self::Ignored => "IGNORED",
        }
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStatus {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DETECTED" => Ok(Self::Detected),
            "RESOLVED" => Ok(Self::Resolved),
            "MANUAL_REVIEW" => Ok(Self::ManualReview),
            "IGNORED" => Ok(Self::Ignored),
            other => Err(ParseEventTypeError(other.to_owned())),
        }
    }
}

/// Default resolution strategy for a conflict type.
///
/// Version mismatches resolve by recency, data divergence by merge (which
/// currently degrades to last-write-wins), and everything else is parked
/// for a human.
#[must_use]
pub fn default_strategy(conflict_type: ConflictType) -> ResolutionStrategy {
    match conflict_type {
        ConflictType::VersionMismatch => ResolutionStrategy::LastWriteWins,
        ConflictType::DataDivergence => ResolutionStrategy::Merge,
        ConflictType::DeletionConflict
        | ConflictType::RelationshipConflict
        | ConflictType::SchemaMismatch => ResolutionStrategy::Manual,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_type_string_roundtrip() {
        for s in [
            "VERSION_MISMATCH",
            "DATA_DIVERGENCE",
            "DELETION_CONFLICT",
            "RELATIONSHIP_CONFLICT",
            "SCHEMA_MISMATCH",
        ] {
            assert_eq!(s.parse::<ConflictType>().unwrap().as_str(), s);
        }
    }

    #[test]
    fn strategy_string_roundtrip() {
        for s in [
            "LAST_WRITE_WINS",
            "MERGE",
            "SOURCE_WINS",
            "TARGET_WINS",
            "MANUAL",
            "IGNORE",
        ] {
            assert_eq!(s.parse::<ResolutionStrategy>().unwrap().as_str(), s);
        }
    }

    #[test]
    fn resolution_status_string_roundtrip() {
        for s in ["DETECTED", "RESOLVED", "MANUAL_REVIEW", "IGNORED"] {
            assert_eq!(s.parse::<ResolutionStatus>().unwrap().as_str(), s);
        }
    }

    #[test]
    fn defaults_by_conflict_type() {
        assert_eq!(
            default_strategy(ConflictType::VersionMismatch),
            ResolutionStrategy::LastWriteWins
        );
        assert_eq!(
            default_strategy(ConflictType::DataDivergence),
            ResolutionStrategy::Merge
        );
        assert_eq!(
            default_strategy(ConflictType::DeletionConflict),
            ResolutionStrategy::Manual
        );
        assert_eq!(
            default_strategy(ConflictType::SchemaMismatch),
            ResolutionStrategy::Manual
        );
    }

    #[test]
    fn serde_matches_as_str() {
        let json = serde_json::to_string(&ConflictType::VersionMismatch).unwrap();
        assert_eq!(json, "\"VERSION_MISMATCH\"");
        let json = serde_json::to_string(&ResolutionStatus::ManualReview).unwrap();
        assert_eq!(json, "\"MANUAL_REVIEW\"");
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!("COIN_FLIP".parse::<ResolutionStrategy>().is_err());
        assert!("MAYBE".parse::<ResolutionStatus>().is_err());
    }
}
