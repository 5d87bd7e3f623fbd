//! Raw database row structs for `rusqlite` row mapping.
//!
//! These mirror the table shapes exactly; conversion to domain types
//! (e.g. [`EventLogRow::to_event`]) happens on demand.

use atlas_core::{EventLogStatus, SyncEvent};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};

/// Raw row from the `sync_event_log` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogRow {
    /// Event ID.
    pub id: String,
    /// Correlation ID.
    pub correlation_id: String,
    /// Event type wire string.
    pub event_type: String,
    /// Entity business key.
    pub entity_id: String,
    /// Entity family string.
    pub entity_type: String,
    /// Entity snapshot JSON.
    pub payload: String,
    /// Source version (epoch seconds).
    pub source_version: i64,
    /// Status wire string.
    pub status: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Last recorded error.
    pub error_message: Option<String>,
    /// Broker-assigned message ID from the last publish.
    pub broker_message_id: Option<String>,
    /// Compare-and-swap counter.
    pub row_version: i64,
    /// Creation timestamp.
    pub created_at: String,
    /// Last modification timestamp.
    pub updated_at: String,
}

impl EventLogRow {
    /// Parse the stored status string.
    pub fn parsed_status(&self) -> Result<EventLogStatus> {
        self.status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad status '{}' on {}", self.status, self.id)))
    }

    /// Rehydrate the row into a [`SyncEvent`] (for republishing).
    pub fn to_event(&self) -> Result<SyncEvent> {
        Ok(SyncEvent {
            event_id: self.id.clone(),
            correlation_id: self.correlation_id.clone(),
            event_type: self.event_type.parse().map_err(|_| {
                StoreError::Corrupt(format!("bad event_type '{}' on {}", self.event_type, self.id))
            })?,
            entity_id: self.entity_id.clone(),
            entity_type: self.entity_type.parse().map_err(|_| {
                StoreError::Corrupt(format!("bad entity_type '{}' on {}", self.entity_type, self.id))
            })?,
            timestamp: self.created_at.clone(),
            payload: serde_json::from_str(&self.payload)?,
            source_version: self.source_version,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            error_message: self.error_message.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        })
    }
}

/// Raw row from the `sync_status` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncStatusRow {
    /// Entity business key.
    pub entity_id: String,
    /// Entity family string.
    pub entity_type: String,
    /// Whether the last apply succeeded and nothing newer is pending.
    pub is_synced: bool,
    /// Timestamp of the last successful apply.
    pub last_synced_at: Option<String>,
    /// Version applied at the last successful sync.
    pub last_synced_version: Option<i64>,
    /// Latest source version observed.
    pub source_version: Option<i64>,
    /// Version currently stored in the graph.
    pub target_version: Option<i64>,
    /// Optional checksum of the graph-side record.
    pub target_checksum: Option<String>,
    /// An event for this entity is in flight.
    pub has_pending_changes: bool,
    /// An unresolved conflict exists.
    pub has_conflict: bool,
    /// Conflicts detected over the entity's lifetime.
    pub conflict_count: i64,
    /// Last apply error.
    pub last_error: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last modification timestamp.
    pub updated_at: String,
}

/// Raw row from the `sync_conflicts` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConflictRow {
    /// Conflict record ID.
    pub id: String,
    /// Entity business key.
    pub entity_id: String,
    /// Entity family string.
    pub entity_type: String,
    /// Conflict classification wire string.
    pub conflict_type: String,
    /// Source-side version at detection.
    pub source_version: Option<i64>,
    /// Target-side version at detection.
    pub target_version: Option<i64>,
    /// Full source snapshot JSON.
    pub source_snapshot: String,
    /// Full target snapshot JSON.
    pub target_snapshot: String,
    /// JSON map of field → [source value, target value].
    pub difference_summary: String,
    /// Resolution status wire string.
    pub resolution_status: String,
    /// Strategy applied, if resolved.
    pub resolution_strategy: Option<String>,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// When it was resolved.
    pub resolved_at: Option<String>,
    /// Event log row that surfaced the conflict, if any.
    pub event_log_id: Option<String>,
    /// Detection timestamp.
    pub detected_at: String,
}

/// Raw row from the `reconciliation_runs` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRow {
    /// Run ID.
    pub id: String,
    /// Trigger kind string.
    pub run_type: String,
    /// Status wire string.
    pub status: String,
    /// Entities examined.
    pub entities_checked: i64,
    /// Drift instances found.
    pub inconsistencies_found: i64,
    /// Drift instances repaired.
    pub inconsistencies_repaired: i64,
    /// Conflicts detected.
    pub conflicts_detected: i64,
    /// Conflict flags cleared.
    pub conflicts_resolved: i64,
    /// Entities that errored.
    pub failed_entities: i64,
    /// Batch size parameter for this run.
    pub batch_size: i64,
    /// Run-level error, if the run failed.
    pub error: Option<String>,
    /// Start timestamp.
    pub started_at: String,
    /// Finish timestamp.
    pub finished_at: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<i64>,
}

/// Raw row from the `leases` table.
#[derive(Clone, Debug)]
pub struct LeaseRow {
    /// Lease name.
    pub name: String,
    /// Current holder identity.
    pub holder: String,
    /// Expiry timestamp.
    pub expires_at: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::{EntityType, EventType};

    fn sample_row() -> EventLogRow {
        EventLogRow {
            id: "evt_1".into(),
            correlation_id: "cor_1".into(),
            event_type: "CONCEPT_CREATED".into(),
            entity_id: "c1".into(),
            entity_type: "concept".into(),
            payload: r#"{"concept_id":"c1","name":"Recursion"}"#.into(),
            source_version: 10,
            status: "PENDING".into(),
            retry_count: 0,
            max_retries: 3,
            error_message: None,
            broker_message_id: None,
            row_version: 0,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn to_event_rehydrates() {
        let event = sample_row().to_event().unwrap();
        assert_eq!(event.event_type, EventType::ConceptCreated);
        assert_eq!(event.entity_type, EntityType::Concept);
        assert_eq!(event.payload["name"], "Recursion");
        assert_eq!(event.source_version, 10);
    }

    #[test]
    fn to_event_rejects_bad_event_type() {
        let mut row = sample_row();
        row.event_type = "CONCEPT_IMPLODED".into();
        assert!(matches!(row.to_event(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn to_event_rejects_bad_payload() {
        let mut row = sample_row();
        row.payload = "not json".into();
        assert!(matches!(row.to_event(), Err(StoreError::Serde(_))));
    }

    #[test]
    fn parsed_status() {
        assert_eq!(
            sample_row().parsed_status().unwrap(),
            EventLogStatus::Pending
        );
        let mut row = sample_row();
        row.status = "LIMBO".into();
        assert!(matches!(row.parsed_status(), Err(StoreError::Corrupt(_))));
    }
}
