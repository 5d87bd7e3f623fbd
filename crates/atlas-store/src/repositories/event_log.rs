//! Event log repository — the outbox table.
//!
//! Rows are append-only audit records; the only mutations are status
//! transitions and retry bookkeeping, and every one of them is a
//! compare-and-swap on `(id, row_version)`. A lost race surfaces as
//! [`StoreError::RowVersionConflict`] instead of a silent overwrite.

use atlas_core::{EventLogStatus, SyncEvent};
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{Result, StoreError};
use crate::row_types::EventLogRow;

const COLUMNS: &str = "id, correlation_id, event_type, entity_id, entity_type, payload,
     source_version, status, retry_count, max_retries, error_message,
     broker_message_id, row_version, created_at, updated_at";

/// Event log repository — stateless, every method takes `&Connection`.
pub struct EventLogRepo;

impl EventLogRepo {
    /// Insert a new PENDING outbox row for an event.
    pub fn insert(conn: &Connection, event: &SyncEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        let _ = conn.execute(
            "INSERT INTO sync_event_log (id, correlation_id, event_type, entity_id,
                entity_type, payload, source_version, status, retry_count, max_retries,
                error_message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event.event_id,
                event.correlation_id,
                event.event_type.as_str(),
                event.entity_id,
                event.entity_type.as_str(),
                payload,
                event.source_version,
                EventLogStatus::Pending.as_str(),
                event.retry_count,
                event.max_retries,
                event.error_message,
                event.created_at,
                event.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a single row by event ID.
    pub fn get(conn: &Connection, event_id: &str) -> Result<Option<EventLogRow>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM sync_event_log WHERE id = ?1"),
                params![event_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// CAS transition to a new status.
    pub fn set_status(
        conn: &Connection,
        event_id: &str,
        row_version: i64,
        to: EventLogStatus,
        now: &str,
    ) -> Result<()> {
        let changed = conn.execute(
            "UPDATE sync_event_log
             SET status = ?1, updated_at = ?2, row_version = row_version + 1
             WHERE id = ?3 AND row_version = ?4",
            params![to.as_str(), now, event_id, row_version],
        )?;
        Self::check_cas(conn, event_id, row_version, changed)
    }

    /// CAS transition to PUBLISHED, recording the broker message ID.
    pub fn set_published(
        conn: &Connection,
        event_id: &str,
        row_version: i64,
        message_id: &str,
        now: &str,
    ) -> Result<()> {
        let changed = conn.execute(
            "UPDATE sync_event_log
             SET status = ?1, broker_message_id = ?2, error_message = NULL,
                 updated_at = ?3, row_version = row_version + 1
             WHERE id = ?4 AND row_version = ?5",
            params![
                EventLogStatus::Published.as_str(),
                message_id,
                now,
                event_id,
                row_version
            ],
        )?;
        Self::check_cas(conn, event_id, row_version, changed)
    }

    /// CAS failure bookkeeping: set retry count, error, and the resulting
    /// status (PUBLISHED for re-drive, FAILED when the budget is spent).
    pub fn set_failure(
        conn: &Connection,
        event_id: &str,
        row_version: i64,
        to: EventLogStatus,
        retry_count: u32,
        error: &str,
        now: &str,
    ) -> Result<()> {
        let changed = conn.execute(
            "UPDATE sync_event_log
             SET status = ?1, retry_count = ?2, error_message = ?3,
                 updated_at = ?4, row_version = row_version + 1
             WHERE id = ?5 AND row_version = ?6",
            params![to.as_str(), retry_count, error, now, event_id, row_version],
        )?;
        Self::check_cas(conn, event_id, row_version, changed)
    }

    /// CAS transition to SKIPPED with the skip reason.
    pub fn set_skipped(
        conn: &Connection,
        event_id: &str,
        row_version: i64,
        reason: &str,
        now: &str,
    ) -> Result<()> {
        let changed = conn.execute(
            "UPDATE sync_event_log
             SET status = ?1, error_message = ?2, updated_at = ?3,
                 row_version = row_version + 1
             WHERE id = ?4 AND row_version = ?5",
            params![
                EventLogStatus::Skipped.as_str(),
                reason,
                now,
                event_id,
                row_version
            ],
        )?;
        Self::check_cas(conn, event_id, row_version, changed)
    }

    /// CAS error recording without a status change (a failed publish leaves
    /// the row PENDING).
    pub fn record_error(
        conn: &Connection,
        event_id: &str,
        row_version: i64,
        error: &str,
        now: &str,
    ) -> Result<()> {
        let changed = conn.execute(
            "UPDATE sync_event_log
             SET error_message = ?1, updated_at = ?2, row_version = row_version + 1
             WHERE id = ?3 AND row_version = ?4",
            params![error, now, event_id, row_version],
        )?;
        Self::check_cas(conn, event_id, row_version, changed)
    }

    /// CAS retry-count bump without a status change (republish bookkeeping).
    pub fn set_retry_count(
        conn: &Connection,
        event_id: &str,
        row_version: i64,
        retry_count: u32,
        now: &str,
    ) -> Result<()> {
        let changed = conn.execute(
            "UPDATE sync_event_log
             SET retry_count = ?1, updated_at = ?2, row_version = row_version + 1
             WHERE id = ?3 AND row_version = ?4",
            params![retry_count, now, event_id, row_version],
        )?;
        Self::check_cas(conn, event_id, row_version, changed)
    }

    /// Rows still in flight (PENDING/PUBLISHED) with retry budget remaining,
    /// oldest first.
    pub fn retryable(conn: &Connection, limit: i64) -> Result<Vec<EventLogRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_event_log
             WHERE status IN ('PENDING', 'PUBLISHED') AND retry_count < max_retries
             ORDER BY created_at ASC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// In-flight rows untouched since `cutoff`, with retry budget remaining.
    pub fn stale(conn: &Connection, cutoff: &str, limit: i64) -> Result<Vec<EventLogRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_event_log
             WHERE status IN ('PENDING', 'PUBLISHED')
               AND retry_count < max_retries
               AND updated_at < ?1
             ORDER BY updated_at ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![cutoff, limit], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count rows in a given status.
    pub fn count_by_status(conn: &Connection, status: EventLogStatus) -> Result<i64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_event_log WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn check_cas(conn: &Connection, event_id: &str, expected: i64, changed: usize) -> Result<()> {
        if changed > 0 {
            return Ok(());
        }
        // Zero rows touched: either the row is gone or someone else won.
        if Self::get(conn, event_id)?.is_some() {
            Err(StoreError::RowVersionConflict {
                event_id: event_id.to_owned(),
                expected,
            })
        } else {
            Err(StoreError::EventNotFound(event_id.to_owned()))
        }
    }

    fn map_row(row: &rusqlite::Row<'_>) -> std::result::Result<EventLogRow, rusqlite::Error> {
        Ok(EventLogRow {
            id: row.get(0)?,
            correlation_id: row.get(1)?,
            event_type: row.get(2)?,
            entity_id: row.get(3)?,
            entity_type: row.get(4)?,
            payload: row.get(5)?,
            source_version: row.get(6)?,
            status: row.get(7)?,
            retry_count: row.get(8)?,
            max_retries: row.get(9)?,
            error_message: row.get(10)?,
            broker_message_id: row.get(11)?,
            row_version: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
