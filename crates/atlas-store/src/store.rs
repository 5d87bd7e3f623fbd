//! High-level transactional [`SyncStore`] API.
//!
//! Composes the repositories into the operations the engine needs. Every
//! multi-step write runs inside a single `SQLite` transaction, and every
//! event log status change validates the state machine before a
//! compare-and-swap update.

use atlas_core::{
    ids, ConflictType, EntityType, EventLogStatus, ResolutionStatus, ResolutionStrategy,
    RunCounters, RunStatus, RunType, SyncEvent,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::Connection;
use serde_json::Value;
use tracing::warn;

use crate::connection::{ConnectionPool, PooledConnection};
use crate::errors::{Result, StoreError};
use crate::repositories::conflict::{ConflictRepo, InsertConflict};
use crate::repositories::event_log::EventLogRepo;
use crate::repositories::lease::LeaseRepo;
use crate::repositories::run::RunRepo;
use crate::repositories::status::StatusRepo;
use crate::row_types::{ConflictRow, EventLogRow, RunRow, SyncStatusRow};

/// Current UTC timestamp in the store's canonical fixed-width form.
#[must_use]
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// What happened to a failed apply attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retry budget remains — the row went back to PUBLISHED for re-drive.
    Retrying {
        /// The retry count after this failure.
        attempt: u32,
    },
    /// Budget spent — the row is terminal FAILED.
    Exhausted,
}

/// Fields for recording a newly detected conflict.
#[derive(Clone, Debug)]
pub struct NewConflict {
    /// Entity family.
    pub entity_type: EntityType,
    /// Entity business key.
    pub entity_id: String,
    /// Classification.
    pub conflict_type: ConflictType,
    /// Source-side version at detection.
    pub source_version: Option<i64>,
    /// Target-side version at detection.
    pub target_version: Option<i64>,
    /// Full source snapshot.
    pub source_snapshot: Value,
    /// Full target snapshot.
    pub target_snapshot: Value,
    /// Map of field → [source value, target value].
    pub difference_summary: Value,
    /// Event log row that surfaced the conflict, if any.
    pub event_log_id: Option<String>,
}

/// Audit/status store over a connection pool.
pub struct SyncStore {
    pool: ConnectionPool,
}

impl SyncStore {
    /// Create a new store over the given pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Get the underlying pool (for callers sharing the database file).
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbox writes
    // ─────────────────────────────────────────────────────────────────────

    /// Write a PENDING outbox row and flag the entity as having pending
    /// changes, atomically.
    pub fn create_event(&self, event: &SyncEvent) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        Self::create_event_inner(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    /// Write the outbox row on a caller-supplied connection.
    ///
    /// This is the outbox-pattern hook: a producer whose business tables
    /// live in the same database passes the connection of its own open
    /// transaction, and the event insert commits or rolls back with the
    /// mutation it records.
    pub fn create_event_on(conn: &Connection, event: &SyncEvent) -> Result<()> {
        Self::create_event_inner(conn, event)
    }

    fn create_event_inner(conn: &Connection, event: &SyncEvent) -> Result<()> {
        EventLogRepo::insert(conn, event)?;
        StatusRepo::mark_pending(
            conn,
            event.entity_type,
            &event.entity_id,
            event.source_version,
            &now_iso(),
        )
    }

    /// Get an event log row.
    pub fn get_event(&self, event_id: &str) -> Result<Option<EventLogRow>> {
        EventLogRepo::get(&*self.conn()?, event_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Status transitions
    // ─────────────────────────────────────────────────────────────────────

    /// PENDING/PUBLISHED → PUBLISHED with the broker message ID recorded.
    pub fn mark_published(&self, event_id: &str, message_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let row = Self::require(&conn, event_id)?;
        Self::check_transition(&row, EventLogStatus::Published)?;
        EventLogRepo::set_published(&conn, event_id, row.row_version, message_id, &now_iso())
    }

    /// PUBLISHED → PROCESSING (consumer claimed the message).
    pub fn mark_processing(&self, event_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let row = Self::require(&conn, event_id)?;
        Self::check_transition(&row, EventLogStatus::Processing)?;
        EventLogRepo::set_status(
            &conn,
            event_id,
            row.row_version,
            EventLogStatus::Processing,
            &now_iso(),
        )
    }

    /// PROCESSING → COMPLETED plus the entity's status upsert, atomically.
    pub fn mark_completed(&self, event: &SyncEvent) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let row = Self::require(&tx, &event.event_id)?;
        Self::check_transition(&row, EventLogStatus::Completed)?;
        let now = now_iso();
        EventLogRepo::set_status(
            &tx,
            &event.event_id,
            row.row_version,
            EventLogStatus::Completed,
            &now,
        )?;
        StatusRepo::mark_synced(
            &tx,
            event.entity_type,
            &event.entity_id,
            event.source_version,
            &now,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// → SKIPPED with a reason (stale version or malformed payload).
    pub fn mark_skipped(&self, event_id: &str, reason: &str) -> Result<()> {
        let conn = self.conn()?;
        let row = Self::require(&conn, event_id)?;
        Self::check_transition(&row, EventLogStatus::Skipped)?;
        EventLogRepo::set_skipped(&conn, event_id, row.row_version, reason, &now_iso())
    }

    /// Record a publish failure; the row stays PENDING for retry.
    pub fn record_publish_failure(&self, event_id: &str, error: &str) -> Result<()> {
        let conn = self.conn()?;
        let row = Self::require(&conn, event_id)?;
        EventLogRepo::record_error(&conn, event_id, row.row_version, error, &now_iso())
    }

    /// Record an apply failure: increment the retry count and either revert
    /// to PUBLISHED (budget remaining) or go terminal FAILED, updating the
    /// entity status either way.
    pub fn record_apply_failure(
        &self,
        event_id: &str,
        error: &str,
    ) -> Result<FailureDisposition> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let row = Self::require(&tx, event_id)?;

        let attempt = row.retry_count + 1;
        let exhausted = attempt >= row.max_retries;
        let to = if exhausted {
            EventLogStatus::Failed
        } else {
            EventLogStatus::Published
        };
        Self::check_transition(&row, to)?;

        let now = now_iso();
        EventLogRepo::set_failure(&tx, event_id, row.row_version, to, attempt, error, &now)?;
        if let Ok(entity_type) = row.entity_type.parse::<EntityType>() {
            StatusRepo::record_error(&tx, entity_type, &row.entity_id, error, &now)?;
        } else {
            warn!(event_id, entity_type = %row.entity_type, "unparseable entity type on failure");
        }
        tx.commit()?;

        Ok(if exhausted {
            FailureDisposition::Exhausted
        } else {
            FailureDisposition::Retrying { attempt }
        })
    }

    /// Increment the retry count on a republish attempt; returns the new count.
    pub fn bump_retry(&self, event_id: &str) -> Result<u32> {
        let conn = self.conn()?;
        let row = Self::require(&conn, event_id)?;
        let attempt = row.retry_count + 1;
        EventLogRepo::set_retry_count(&conn, event_id, row.row_version, attempt, &now_iso())?;
        Ok(attempt)
    }

    /// Reset the retry count (stuck-event sweep, before republishing).
    pub fn reset_retries(&self, event_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let row = Self::require(&conn, event_id)?;
        EventLogRepo::set_retry_count(&conn, event_id, row.row_version, 0, &now_iso())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries for retry and reconciliation
    // ─────────────────────────────────────────────────────────────────────

    /// In-flight rows with retry budget remaining, oldest first.
    pub fn retryable_events(&self, limit: i64) -> Result<Vec<EventLogRow>> {
        EventLogRepo::retryable(&*self.conn()?, limit)
    }

    /// In-flight rows untouched for longer than `threshold`.
    pub fn stale_events(&self, threshold: Duration, limit: i64) -> Result<Vec<EventLogRow>> {
        let cutoff = (Utc::now() - threshold).to_rfc3339_opts(SecondsFormat::Micros, true);
        EventLogRepo::stale(&*self.conn()?, &cutoff, limit)
    }

    /// Count event log rows in a status (observability and tests).
    pub fn count_events(&self, status: EventLogStatus) -> Result<i64> {
        EventLogRepo::count_by_status(&*self.conn()?, status)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Entity status
    // ─────────────────────────────────────────────────────────────────────

    /// Status row for an entity.
    pub fn sync_status(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<SyncStatusRow>> {
        StatusRepo::get(&*self.conn()?, entity_type, entity_id)
    }

    /// Entities flagged with an unresolved conflict.
    pub fn conflicted_entities(&self, limit: i64) -> Result<Vec<SyncStatusRow>> {
        StatusRepo::conflicted(&*self.conn()?, limit)
    }

    /// Lower an entity's conflict flag.
    pub fn clear_conflict_flag(&self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        StatusRepo::clear_conflict(&*self.conn()?, entity_type, entity_id, &now_iso())
    }

    /// Record a successful out-of-band apply (conflict resolution pushing
    /// the source snapshot into the graph).
    pub fn mark_entity_synced(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        version: i64,
    ) -> Result<()> {
        StatusRepo::mark_synced(&*self.conn()?, entity_type, entity_id, version, &now_iso())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Conflicts
    // ─────────────────────────────────────────────────────────────────────

    /// Record a detected conflict and flag the entity, atomically.
    pub fn record_conflict(&self, new: &NewConflict) -> Result<ConflictRow> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let id = ids::conflict_id();
        let now = now_iso();
        ConflictRepo::insert(
            &tx,
            &InsertConflict {
                id: &id,
                entity_type: new.entity_type,
                entity_id: &new.entity_id,
                conflict_type: new.conflict_type,
                source_version: new.source_version,
                target_version: new.target_version,
                source_snapshot: &new.source_snapshot,
                target_snapshot: &new.target_snapshot,
                difference_summary: &new.difference_summary,
                event_log_id: new.event_log_id.as_deref(),
            },
            &now,
        )?;
        StatusRepo::flag_conflict(&tx, new.entity_type, &new.entity_id, &now)?;
        tx.commit()?;

        ConflictRepo::get(&*self.conn()?, &id)?.ok_or(StoreError::ConflictNotFound(id))
    }

    /// Get a conflict record.
    pub fn get_conflict(&self, conflict_id: &str) -> Result<Option<ConflictRow>> {
        ConflictRepo::get(&*self.conn()?, conflict_id)
    }

    /// Latest unresolved conflict for an entity.
    pub fn open_conflict_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<ConflictRow>> {
        ConflictRepo::open_for_entity(&*self.conn()?, entity_type, entity_id)
    }

    /// Unresolved conflicts, oldest first.
    pub fn open_conflicts(&self, limit: i64) -> Result<Vec<ConflictRow>> {
        ConflictRepo::open(&*self.conn()?, limit)
    }

    /// Record a resolution outcome on a conflict record.
    pub fn set_conflict_resolution(
        &self,
        conflict_id: &str,
        status: ResolutionStatus,
        strategy: Option<ResolutionStrategy>,
        resolved_by: &str,
    ) -> Result<bool> {
        ConflictRepo::set_resolution(
            &*self.conn()?,
            conflict_id,
            status,
            strategy,
            resolved_by,
            &now_iso(),
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reconciliation runs
    // ─────────────────────────────────────────────────────────────────────

    /// Insert a RUNNING run row and return it.
    pub fn begin_run(&self, run_type: RunType, batch_size: i64) -> Result<RunRow> {
        let conn = self.conn()?;
        let id = ids::run_id();
        RunRepo::create(&conn, &id, run_type, batch_size, &now_iso())?;
        RunRepo::get(&conn, &id)?.ok_or(StoreError::RunNotFound(id))
    }

    /// Finalize a run, computing its duration from the stored start time.
    pub fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        counters: RunCounters,
        error: Option<&str>,
    ) -> Result<RunRow> {
        let conn = self.conn()?;
        let row = RunRepo::get(&conn, run_id)?.ok_or_else(|| StoreError::RunNotFound(run_id.to_owned()))?;

        let finished = Utc::now();
        let duration_ms = DateTime::parse_from_rfc3339(&row.started_at)
            .map(|started| (finished.with_timezone(&started.timezone()) - started).num_milliseconds())
            .unwrap_or(0)
            .max(0);

        let _ = RunRepo::finalize(
            &conn,
            run_id,
            status,
            counters,
            error,
            &finished.to_rfc3339_opts(SecondsFormat::Micros, true),
            duration_ms,
        )?;
        RunRepo::get(&conn, run_id)?.ok_or_else(|| StoreError::RunNotFound(run_id.to_owned()))
    }

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, limit: i64) -> Result<Vec<RunRow>> {
        RunRepo::recent(&*self.conn()?, limit)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Leases
    // ─────────────────────────────────────────────────────────────────────

    /// Try to acquire (or renew) a named lease for `ttl`.
    pub fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        LeaseRepo::try_acquire(
            &*self.conn()?,
            name,
            holder,
            &(now + ttl).to_rfc3339_opts(SecondsFormat::Micros, true),
            &now.to_rfc3339_opts(SecondsFormat::Micros, true),
        )
    }

    /// Release a lease held by `holder`.
    pub fn release_lease(&self, name: &str, holder: &str) -> Result<bool> {
        LeaseRepo::release(&*self.conn()?, name, holder)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internal
    // ─────────────────────────────────────────────────────────────────────

    fn require(conn: &Connection, event_id: &str) -> Result<EventLogRow> {
        EventLogRepo::get(conn, event_id)?
            .ok_or_else(|| StoreError::EventNotFound(event_id.to_owned()))
    }

    fn check_transition(row: &EventLogRow, to: EventLogStatus) -> Result<()> {
        let from = row.parsed_status()?;
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(StoreError::IllegalTransition {
                event_id: row.id.clone(),
                from,
                to,
            })
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{self, ConnectionConfig};
    use crate::migrations::run_migrations;
    use assert_matches::assert_matches;
    use atlas_core::EventType;
    use serde_json::json;

    fn setup() -> SyncStore {
        let pool = connection::new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            let _ = run_migrations(&conn).unwrap();
        }
        SyncStore::new(pool)
    }

    fn sample_event(max_retries: u32) -> SyncEvent {
        SyncEvent::new(
            EventType::ConceptCreated,
            None,
            json!({"concept_id": "c1", "name": "Recursion"}),
            1,
            None,
            max_retries,
        )
        .unwrap()
    }

    #[test]
    fn create_event_writes_log_and_status() {
        let store = setup();
        let event = sample_event(3);
        store.create_event(&event).unwrap();

        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.status, "PENDING");

        let status = store
            .sync_status(EntityType::Concept, "c1")
            .unwrap()
            .unwrap();
        assert!(status.has_pending_changes);
        assert_eq!(status.source_version, Some(1));
    }

    #[test]
    fn create_event_on_participates_in_caller_transaction() {
        let store = setup();
        let event = sample_event(3);

        let conn = store.pool().get().unwrap();
        let tx = conn.unchecked_transaction().unwrap();
        SyncStore::create_event_on(&tx, &event).unwrap();
        // Roll back: the outbox row must vanish with the caller's work.
        drop(tx);

        assert!(store.get_event(&event.event_id).unwrap().is_none());
    }

    #[test]
    fn happy_path_to_completed() {
        let store = setup();
        let event = sample_event(3);
        store.create_event(&event).unwrap();

        store.mark_published(&event.event_id, "3-1").unwrap();
        store.mark_processing(&event.event_id).unwrap();
        store.mark_completed(&event).unwrap();

        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.status, "COMPLETED");

        let status = store
            .sync_status(EntityType::Concept, "c1")
            .unwrap()
            .unwrap();
        assert!(status.is_synced);
        assert!(!status.has_pending_changes);
        assert_eq!(status.last_synced_version, Some(1));
    }

    #[test]
    fn illegal_transition_rejected() {
        let store = setup();
        let event = sample_event(3);
        store.create_event(&event).unwrap();

        // PENDING → COMPLETED skips the machine.
        let err = store.mark_completed(&event).unwrap_err();
        assert_matches!(err, StoreError::IllegalTransition { .. });
    }

    #[test]
    fn apply_failure_under_budget_reverts_to_published() {
        let store = setup();
        let event = sample_event(3);
        store.create_event(&event).unwrap();
        store.mark_published(&event.event_id, "1-1").unwrap();
        store.mark_processing(&event.event_id).unwrap();

        let disposition = store
            .record_apply_failure(&event.event_id, "graph unavailable")
            .unwrap();
        assert_eq!(disposition, FailureDisposition::Retrying { attempt: 1 });

        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.status, "PUBLISHED");
        assert_eq!(row.retry_count, 1);

        let status = store
            .sync_status(EntityType::Concept, "c1")
            .unwrap()
            .unwrap();
        assert_eq!(status.last_error.as_deref(), Some("graph unavailable"));
    }

    #[test]
    fn apply_failure_exhausts_exactly_at_max_retries() {
        let store = setup();
        let event = sample_event(2);
        store.create_event(&event).unwrap();
        store.mark_published(&event.event_id, "1-1").unwrap();

        // Attempt 1 of 2.
        store.mark_processing(&event.event_id).unwrap();
        assert_eq!(
            store.record_apply_failure(&event.event_id, "e1").unwrap(),
            FailureDisposition::Retrying { attempt: 1 }
        );

        // Attempt 2 of 2 — retry_count reaches max_retries, terminal FAILED.
        store.mark_processing(&event.event_id).unwrap();
        assert_eq!(
            store.record_apply_failure(&event.event_id, "e2").unwrap(),
            FailureDisposition::Exhausted
        );

        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.status, "FAILED");
        assert_eq!(row.retry_count, row.max_retries);
    }

    #[test]
    fn publish_failure_keeps_pending() {
        let store = setup();
        let event = sample_event(3);
        store.create_event(&event).unwrap();
        store
            .record_publish_failure(&event.event_id, "broker refused")
            .unwrap();

        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.status, "PENDING");
        assert_eq!(row.error_message.as_deref(), Some("broker refused"));
    }

    #[test]
    fn skip_records_reason() {
        let store = setup();
        let event = sample_event(3);
        store.create_event(&event).unwrap();
        store.mark_published(&event.event_id, "1-1").unwrap();
        store.mark_processing(&event.event_id).unwrap();
        store
            .mark_skipped(&event.event_id, "stale: stored=100 incoming=90")
            .unwrap();

        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.status, "SKIPPED");
        assert!(row.error_message.unwrap().contains("stale"));
    }

    #[test]
    fn stale_events_respect_threshold() {
        let store = setup();
        let event = sample_event(3);
        store.create_event(&event).unwrap();

        // Nothing is stale under a generous threshold…
        assert!(store.stale_events(Duration::hours(1), 10).unwrap().is_empty());
        // …but everything is under a negative one (cutoff in the future).
        assert_eq!(
            store.stale_events(Duration::seconds(-60), 10).unwrap().len(),
            1
        );
    }

    #[test]
    fn reset_and_bump_retry() {
        let store = setup();
        let event = sample_event(3);
        store.create_event(&event).unwrap();

        assert_eq!(store.bump_retry(&event.event_id).unwrap(), 1);
        assert_eq!(store.bump_retry(&event.event_id).unwrap(), 2);
        store.reset_retries(&event.event_id).unwrap();
        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.retry_count, 0);
    }

    #[test]
    fn record_conflict_flags_entity() {
        let store = setup();
        let conflict = store
            .record_conflict(&NewConflict {
                entity_type: EntityType::Concept,
                entity_id: "c1".into(),
                conflict_type: ConflictType::VersionMismatch,
                source_version: Some(10),
                target_version: Some(9),
                source_snapshot: json!({"name": "A"}),
                target_snapshot: json!({"name": "B"}),
                difference_summary: json!({"name": ["A", "B"]}),
                event_log_id: None,
            })
            .unwrap();
        assert_eq!(conflict.resolution_status, "DETECTED");

        let status = store
            .sync_status(EntityType::Concept, "c1")
            .unwrap()
            .unwrap();
        assert!(status.has_conflict);
        assert_eq!(status.conflict_count, 1);

        let open = store.open_conflicts(10).unwrap();
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn run_lifecycle() {
        let store = setup();
        let run = store.begin_run(RunType::Manual, 100).unwrap();
        assert_eq!(run.status, "RUNNING");

        let finished = store
            .finish_run(
                &run.id,
                RunStatus::Completed,
                RunCounters {
                    entities_checked: 12,
                    ..RunCounters::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(finished.status, "COMPLETED");
        assert_eq!(finished.entities_checked, 12);
        assert!(finished.duration_ms.is_some());
        assert!(finished.finished_at.is_some());
    }

    #[test]
    fn lease_roundtrip() {
        let store = setup();
        assert!(store
            .acquire_lease("reconciler", "host-a", Duration::seconds(30))
            .unwrap());
        assert!(!store
            .acquire_lease("reconciler", "host-b", Duration::seconds(30))
            .unwrap());
        assert!(store.release_lease("reconciler", "host-a").unwrap());
    }
}
