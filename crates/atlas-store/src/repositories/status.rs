//! Per-entity sync status repository.
//!
//! Rows are created lazily on first sync attempt and updated after every
//! apply, skip, or conflict. All writes are upserts keyed on
//! `(entity_id, entity_type)`.

use atlas_core::EntityType;
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;
use crate::row_types::SyncStatusRow;

const COLUMNS: &str = "entity_id, entity_type, is_synced, last_synced_at, last_synced_version,
     source_version, target_version, target_checksum, has_pending_changes,
     has_conflict, conflict_count, last_error, created_at, updated_at";

/// Sync status repository — stateless, every method takes `&Connection`.
pub struct StatusRepo;

impl StatusRepo {
    /// Get the status row for an entity.
    pub fn get(
        conn: &Connection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<SyncStatusRow>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM sync_status
                     WHERE entity_id = ?1 AND entity_type = ?2"
                ),
                params![entity_id, entity_type.as_str()],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Record that a change for the entity is in flight.
    pub fn mark_pending(
        conn: &Connection,
        entity_type: EntityType,
        entity_id: &str,
        source_version: i64,
        now: &str,
    ) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sync_status (entity_id, entity_type, has_pending_changes,
                source_version, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?4)
             ON CONFLICT(entity_id, entity_type) DO UPDATE SET
                has_pending_changes = 1,
                source_version = MAX(COALESCE(sync_status.source_version, 0), excluded.source_version),
                updated_at = excluded.updated_at",
            params![entity_id, entity_type.as_str(), source_version, now],
        )?;
        Ok(())
    }

    /// Record a successful apply at `version`.
    pub fn mark_synced(
        conn: &Connection,
        entity_type: EntityType,
        entity_id: &str,
        version: i64,
        now: &str,
    ) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sync_status (entity_id, entity_type, is_synced, last_synced_at,
                last_synced_version, source_version, target_version,
                has_pending_changes, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?4, ?4, 0, ?3, ?3)
             ON CONFLICT(entity_id, entity_type) DO UPDATE SET
                is_synced = 1,
                last_synced_at = excluded.last_synced_at,
                last_synced_version = excluded.last_synced_version,
                source_version = excluded.source_version,
                target_version = excluded.target_version,
                has_pending_changes = 0,
                last_error = NULL,
                updated_at = excluded.updated_at",
            params![entity_id, entity_type.as_str(), now, version],
        )?;
        Ok(())
    }

    /// Record an apply failure.
    pub fn record_error(
        conn: &Connection,
        entity_type: EntityType,
        entity_id: &str,
        error: &str,
        now: &str,
    ) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sync_status (entity_id, entity_type, is_synced, last_error,
                created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?4)
             ON CONFLICT(entity_id, entity_type) DO UPDATE SET
                is_synced = 0,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![entity_id, entity_type.as_str(), error, now],
        )?;
        Ok(())
    }

    /// Raise the conflict flag and bump the lifetime conflict counter.
    pub fn flag_conflict(
        conn: &Connection,
        entity_type: EntityType,
        entity_id: &str,
        now: &str,
    ) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sync_status (entity_id, entity_type, has_conflict, conflict_count,
                created_at, updated_at)
             VALUES (?1, ?2, 1, 1, ?3, ?3)
             ON CONFLICT(entity_id, entity_type) DO UPDATE SET
                has_conflict = 1,
                conflict_count = sync_status.conflict_count + 1,
                updated_at = excluded.updated_at",
            params![entity_id, entity_type.as_str(), now],
        )?;
        Ok(())
    }

    /// Lower the conflict flag (the sides converged or a human resolved it).
    pub fn clear_conflict(
        conn: &Connection,
        entity_type: EntityType,
        entity_id: &str,
        now: &str,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE sync_status SET has_conflict = 0, updated_at = ?1
             WHERE entity_id = ?2 AND entity_type = ?3",
            params![now, entity_id, entity_type.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Entities currently flagged with an unresolved conflict.
    pub fn conflicted(conn: &Connection, limit: i64) -> Result<Vec<SyncStatusRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_status
             WHERE has_conflict = 1 ORDER BY updated_at ASC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> std::result::Result<SyncStatusRow, rusqlite::Error> {
        Ok(SyncStatusRow {
            entity_id: row.get(0)?,
            entity_type: row.get(1)?,
            is_synced: row.get(2)?,
            last_synced_at: row.get(3)?,
            last_synced_version: row.get(4)?,
            source_version: row.get(5)?,
            target_version: row.get(6)?,
            target_checksum: row.get(7)?,
            has_pending_changes: row.get(8)?,
            has_conflict: row.get(9)?,
            conflict_count: row.get(10)?,
            last_error: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
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

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn mark_pending_creates_lazily() {
        let conn = setup();
        StatusRepo::mark_pending(&conn, EntityType::Concept, "c1", 5, "t1").unwrap();

        let row = StatusRepo::get(&conn, EntityType::Concept, "c1").unwrap().unwrap();
        assert!(row.has_pending_changes);
        assert!(!row.is_synced);
        assert_eq!(row.source_version, Some(5));
    }

    #[test]
    fn mark_pending_keeps_highest_source_version() {
        let conn = setup();
        StatusRepo::mark_pending(&conn, EntityType::Concept, "c1", 9, "t1").unwrap();
        StatusRepo::mark_pending(&conn, EntityType::Concept, "c1", 5, "t2").unwrap();

        let row = StatusRepo::get(&conn, EntityType::Concept, "c1").unwrap().unwrap();
        assert_eq!(row.source_version, Some(9));
    }

    #[test]
    fn mark_synced_clears_pending_and_error() {
        let conn = setup();
        StatusRepo::mark_pending(&conn, EntityType::Concept, "c1", 5, "t1").unwrap();
        StatusRepo::record_error(&conn, EntityType::Concept, "c1", "boom", "t2").unwrap();
        StatusRepo::mark_synced(&conn, EntityType::Concept, "c1", 5, "t3").unwrap();

        let row = StatusRepo::get(&conn, EntityType::Concept, "c1").unwrap().unwrap();
        assert!(row.is_synced);
        assert!(!row.has_pending_changes);
        assert!(row.last_error.is_none());
        assert_eq!(row.last_synced_version, Some(5));
        assert_eq!(row.target_version, Some(5));
        assert_eq!(row.last_synced_at.as_deref(), Some("t3"));
    }

    #[test]
    fn record_error_flips_synced_off() {
        let conn = setup();
        StatusRepo::mark_synced(&conn, EntityType::Concept, "c1", 5, "t1").unwrap();
        StatusRepo::record_error(&conn, EntityType::Concept, "c1", "graph down", "t2").unwrap();

        let row = StatusRepo::get(&conn, EntityType::Concept, "c1").unwrap().unwrap();
        assert!(!row.is_synced);
        assert_eq!(row.last_error.as_deref(), Some("graph down"));
        // Versions from the earlier successful sync are preserved.
        assert_eq!(row.last_synced_version, Some(5));
    }

    #[test]
    fn conflict_flag_lifecycle() {
        let conn = setup();
        StatusRepo::flag_conflict(&conn, EntityType::Concept, "c1", "t1").unwrap();
        StatusRepo::flag_conflict(&conn, EntityType::Concept, "c1", "t2").unwrap();

        let row = StatusRepo::get(&conn, EntityType::Concept, "c1").unwrap().unwrap();
        assert!(row.has_conflict);
        assert_eq!(row.conflict_count, 2);

        assert!(StatusRepo::clear_conflict(&conn, EntityType::Concept, "c1", "t3").unwrap());
        let row = StatusRepo::get(&conn, EntityType::Concept, "c1").unwrap().unwrap();
        assert!(!row.has_conflict);
        // Lifetime counter survives the clear.
        assert_eq!(row.conflict_count, 2);
    }

    #[test]
    fn conflicted_lists_only_flagged() {
        let conn = setup();
        StatusRepo::flag_conflict(&conn, EntityType::Concept, "c1", "t1").unwrap();
        StatusRepo::mark_synced(&conn, EntityType::Concept, "c2", 1, "t1").unwrap();
        StatusRepo::flag_conflict(&conn, EntityType::LearningPath, "p1", "t2").unwrap();

        let rows = StatusRepo::conflicted(&conn, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entity_id, "c1");
        assert_eq!(rows[1].entity_id, "p1");
    }

    #[test]
    fn same_id_different_entity_types_are_distinct() {
        let conn = setup();
        StatusRepo::mark_synced(&conn, EntityType::Concept, "x", 1, "t1").unwrap();
        StatusRepo::mark_pending(&conn, EntityType::LearningPath, "x", 2, "t1").unwrap();

        let concept = StatusRepo::get(&conn, EntityType::Concept, "x").unwrap().unwrap();
        let path = StatusRepo::get(&conn, EntityType::LearningPath, "x").unwrap().unwrap();
        assert!(concept.is_synced);
        assert!(!path.is_synced);
    }
}
