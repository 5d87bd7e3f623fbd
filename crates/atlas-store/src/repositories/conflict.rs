//! Conflict record repository.
//!
//! Append-only: every detection inserts a new row carrying both snapshots.
//! Resolution updates bookkeeping fields on the existing row; the record
//! itself is never deleted.

use atlas_core::{ConflictType, EntityType, ResolutionStatus, ResolutionStrategy};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::errors::Result;
use crate::row_types::ConflictRow;

const COLUMNS: &str = "id, entity_id, entity_type, conflict_type, source_version, target_version,
     source_snapshot, target_snapshot, difference_summary, resolution_status,
     resolution_strategy, resolved_by, resolved_at, event_log_id, detected_at";

/// Fields for a new conflict record.
#[derive(Debug)]
pub struct InsertConflict<'a> {
    /// Conflict record ID (`cfl_…`).
    pub id: &'a str,
    /// Entity family.
    pub entity_type: EntityType,
    /// Entity business key.
    pub entity_id: &'a str,
    /// Classification.
    pub conflict_type: ConflictType,
    /// Source-side version at detection.
    pub source_version: Option<i64>,
    /// Target-side version at detection.
    pub target_version: Option<i64>,
    /// Full source snapshot.
    pub source_snapshot: &'a Value,
    /// Full target snapshot.
    pub target_snapshot: &'a Value,
    /// Map of field → [source value, target value].
    pub difference_summary: &'a Value,
    /// Event log row that surfaced the conflict, if any.
    pub event_log_id: Option<&'a str>,
}

/// Conflict repository — stateless, every method takes `&Connection`.
pub struct ConflictRepo;

impl ConflictRepo {
    /// Insert a new DETECTED conflict record.
    pub fn insert(conn: &Connection, fields: &InsertConflict<'_>, now: &str) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sync_conflicts (id, entity_id, entity_type, conflict_type,
                source_version, target_version, source_snapshot, target_snapshot,
                difference_summary, resolution_status, event_log_id, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                fields.id,
                fields.entity_id,
                fields.entity_type.as_str(),
                fields.conflict_type.as_str(),
                fields.source_version,
                fields.target_version,
                serde_json::to_string(fields.source_snapshot)?,
                serde_json::to_string(fields.target_snapshot)?,
                serde_json::to_string(fields.difference_summary)?,
                ResolutionStatus::Detected.as_str(),
                fields.event_log_id,
                now,
            ],
        )?;
        Ok(())
    }

    /// Get a conflict record by ID.
    pub fn get(conn: &Connection, conflict_id: &str) -> Result<Option<ConflictRow>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM sync_conflicts WHERE id = ?1"),
                params![conflict_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Latest unresolved conflict for an entity, if any.
    pub fn open_for_entity(
        conn: &Connection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<ConflictRow>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM sync_conflicts
                     WHERE entity_id = ?1 AND entity_type = ?2 AND resolution_status = 'DETECTED'
                     ORDER BY detected_at DESC LIMIT 1"
                ),
                params![entity_id, entity_type.as_str()],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Unresolved conflicts, oldest first.
    pub fn open(conn: &Connection, limit: i64) -> Result<Vec<ConflictRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_conflicts
             WHERE resolution_status = 'DETECTED'
             ORDER BY detected_at ASC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record the outcome of a resolution attempt.
    pub fn set_resolution(
        conn: &Connection,
        conflict_id: &str,
        status: ResolutionStatus,
        strategy: Option<ResolutionStrategy>,
        resolved_by: &str,
        now: &str,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE sync_conflicts
             SET resolution_status = ?1, resolution_strategy = ?2,
                 resolved_by = ?3, resolved_at = ?4
             WHERE id = ?5",
            params![
                status.as_str(),
                strategy.map(ResolutionStrategy::as_str),
                resolved_by,
                now,
                conflict_id
            ],
        )?;
        Ok(changed > 0)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> std::result::Result<ConflictRow, rusqlite::Error> {
        Ok(ConflictRow {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            entity_type: row.get(2)?,
            conflict_type: row.get(3)?,
            source_version: row.get(4)?,
            target_version: row.get(5)?,
            source_snapshot: row.get(6)?,
            target_snapshot: row.get(7)?,
            difference_summary: row.get(8)?,
            resolution_status: row.get(9)?,
            resolution_strategy: row.get(10)?,
            resolved_by: row.get(11)?,
            resolved_at: row.get(12)?,
            event_log_id: row.get(13)?,
            detected_at: row.get(14)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn
    }

    fn insert_sample(conn: &Connection, id: &str, entity_id: &str) {
        let source = json!({"name": "A"});
        let target = json!({"name": "B"});
        let diff = json!({"name": ["A", "B"]});
        ConflictRepo::insert(
            conn,
            &InsertConflict {
                id,
                entity_type: EntityType::Concept,
                entity_id,
                conflict_type: ConflictType::DataDivergence,
                source_version: Some(10),
                target_version: Some(8),
                source_snapshot: &source,
                target_snapshot: &target,
                difference_summary: &diff,
                event_log_id: None,
            },
            "t1",
        )
        .unwrap();
    }

    #[test]
    fn insert_and_get() {
        let conn = setup();
        insert_sample(&conn, "cfl_1", "c1");

        let row = ConflictRepo::get(&conn, "cfl_1").unwrap().unwrap();
        assert_eq!(row.resolution_status, "DETECTED");
        assert_eq!(row.conflict_type, "DATA_DIVERGENCE");
        assert_eq!(row.source_version, Some(10));
        let diff: serde_json::Value = serde_json::from_str(&row.difference_summary).unwrap();
        assert_eq!(diff["name"][0], "A");
    }

    #[test]
    fn open_for_entity_returns_latest_detected() {
        let conn = setup();
        insert_sample(&conn, "cfl_1", "c1");
        insert_sample(&conn, "cfl_2", "c1");

        // Different detected_at so ordering is deterministic.
        let _ = conn
            .execute("UPDATE sync_conflicts SET detected_at = 't2' WHERE id = 'cfl_2'", [])
            .unwrap();

        let row = ConflictRepo::open_for_entity(&conn, EntityType::Concept, "c1")
            .unwrap()
            .unwrap();
        assert_eq!(row.id, "cfl_2");
    }

    #[test]
    fn resolution_closes_the_record() {
        let conn = setup();
        insert_sample(&conn, "cfl_1", "c1");

        assert!(ConflictRepo::set_resolution(
            &conn,
            "cfl_1",
            ResolutionStatus::Resolved,
            Some(ResolutionStrategy::LastWriteWins),
            "reconciler",
            "t2",
        )
        .unwrap());

        let row = ConflictRepo::get(&conn, "cfl_1").unwrap().unwrap();
        assert_eq!(row.resolution_status, "RESOLVED");
        assert_eq!(row.resolution_strategy.as_deref(), Some("LAST_WRITE_WINS"));
        assert_eq!(row.resolved_by.as_deref(), Some("reconciler"));

        assert!(ConflictRepo::open_for_entity(&conn, EntityType::Concept, "c1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn open_lists_only_detected() {
        let conn = setup();
        insert_sample(&conn, "cfl_1", "c1");
        insert_sample(&conn, "cfl_2", "c2");
        let _ = ConflictRepo::set_resolution(
            &conn,
            "cfl_1",
            ResolutionStatus::Ignored,
            None,
            "operator",
            "t2",
        )
        .unwrap();

        let rows = ConflictRepo::open(&conn, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "cfl_2");
    }

    #[test]
    fn set_resolution_on_missing_returns_false() {
        let conn = setup();
        assert!(!ConflictRepo::set_resolution(
            &conn,
            "cfl_ghost",
            ResolutionStatus::Resolved,
            None,
            "x",
            "t",
        )
        .unwrap());
    }
}
