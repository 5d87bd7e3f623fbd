//! Reconciliation run repository.

use atlas_core::{RunCounters, RunStatus, RunType};
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;
use crate::row_types::RunRow;

const COLUMNS: &str = "id, run_type, status, entities_checked, inconsistencies_found,
     inconsistencies_repaired, conflicts_detected, conflicts_resolved,
     failed_entities, batch_size, error, started_at, finished_at, duration_ms";

/// Reconciliation run repository — stateless, every method takes `&Connection`.
pub struct RunRepo;

impl RunRepo {
    /// Insert a new RUNNING run row.
    pub fn create(
        conn: &Connection,
        run_id: &str,
        run_type: RunType,
        batch_size: i64,
        now: &str,
    ) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO reconciliation_runs (id, run_type, status, batch_size, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, run_type.as_str(), RunStatus::Running.as_str(), batch_size, now],
        )?;
        Ok(())
    }

    /// Finalize a run with counters, terminal status, and timing.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize(
        conn: &Connection,
        run_id: &str,
        status: RunStatus,
        counters: RunCounters,
        error: Option<&str>,
        finished_at: &str,
        duration_ms: i64,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE reconciliation_runs
             SET status = ?1, entities_checked = ?2, inconsistencies_found = ?3,
                 inconsistencies_repaired = ?4, conflicts_detected = ?5,
                 conflicts_resolved = ?6, failed_entities = ?7, error = ?8,
                 finished_at = ?9, duration_ms = ?10
             WHERE id = ?11",
            params![
                status.as_str(),
                counters.entities_checked,
                counters.inconsistencies_found,
                counters.inconsistencies_repaired,
                counters.conflicts_detected,
                counters.conflicts_resolved,
                counters.failed_entities,
                error,
                finished_at,
                duration_ms,
                run_id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Get a run by ID.
    pub fn get(conn: &Connection, run_id: &str) -> Result<Option<RunRow>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM reconciliation_runs WHERE id = ?1"),
                params![run_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent runs, newest first.
    pub fn recent(conn: &Connection, limit: i64) -> Result<Vec<RunRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM reconciliation_runs
             ORDER BY started_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> std::result::Result<RunRow, rusqlite::Error> {
        Ok(RunRow {
            id: row.get(0)?,
            run_type: row.get(1)?,
            status: row.get(2)?,
            entities_checked: row.get(3)?,
            inconsistencies_found: row.get(4)?,
            inconsistencies_repaired: row.get(5)?,
            conflicts_detected: row.get(6)?,
            conflicts_resolved: row.get(7)?,
            failed_entities: row.get(8)?,
            batch_size: row.get(9)?,
            error: row.get(10)?,
            started_at: row.get(11)?,
            finished_at: row.get(12)?,
            duration_ms: row.get(13)?,
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
    fn create_and_get() {
        let conn = setup();
        RunRepo::create(&conn, "run_1", RunType::Scheduled, 100, "t1").unwrap();

        let row = RunRepo::get(&conn, "run_1").unwrap().unwrap();
        assert_eq!(row.status, "RUNNING");
        assert_eq!(row.run_type, "scheduled");
        assert_eq!(row.batch_size, 100);
        assert!(row.finished_at.is_none());
    }

    #[test]
    fn finalize_completed() {
        let conn = setup();
        RunRepo::create(&conn, "run_1", RunType::Manual, 50, "t1").unwrap();

        let counters = RunCounters {
            entities_checked: 40,
            inconsistencies_found: 3,
            inconsistencies_repaired: 3,
            ..RunCounters::default()
        };
        assert!(RunRepo::finalize(
            &conn,
            "run_1",
            RunStatus::Completed,
            counters,
            None,
            "t2",
            1500,
        )
        .unwrap());

        let row = RunRepo::get(&conn, "run_1").unwrap().unwrap();
        assert_eq!(row.status, "COMPLETED");
        assert_eq!(row.entities_checked, 40);
        assert_eq!(row.inconsistencies_repaired, 3);
        assert_eq!(row.duration_ms, Some(1500));
        assert!(row.error.is_none());
    }

    #[test]
    fn finalize_failed_captures_error() {
        let conn = setup();
        RunRepo::create(&conn, "run_1", RunType::Scheduled, 100, "t1").unwrap();

        assert!(RunRepo::finalize(
            &conn,
            "run_1",
            RunStatus::Failed,
            RunCounters::default(),
            Some("source store unreachable"),
            "t2",
            90,
        )
        .unwrap());

        let row = RunRepo::get(&conn, "run_1").unwrap().unwrap();
        assert_eq!(row.status, "FAILED");
        assert_eq!(row.error.as_deref(), Some("source store unreachable"));
    }

    #[test]
    fn recent_orders_newest_first() {
        let conn = setup();
        RunRepo::create(&conn, "run_1", RunType::Scheduled, 10, "t1").unwrap();
        RunRepo::create(&conn, "run_2", RunType::Scheduled, 10, "t2").unwrap();

        let rows = RunRepo::recent(&conn, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "run_2");
    }
}
