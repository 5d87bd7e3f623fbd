//! TTL lease repository.
//!
//! Backs the single-instance guarantee for the reconciliation loop: a
//! holder claims the lease before each cycle and renews it while running.
//! A lease is free when no row exists, the row has expired, or the caller
//! already holds it — claiming is a single conditional upsert, so two
//! competing holders cannot both win.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;
use crate::row_types::LeaseRow;

/// Lease repository — stateless, every method takes `&Connection`.
pub struct LeaseRepo;

impl LeaseRepo {
    /// Try to acquire (or renew) a lease.
    ///
    /// Returns `true` when `holder` now owns the lease until `expires_at`.
    pub fn try_acquire(
        conn: &Connection,
        name: &str,
        holder: &str,
        expires_at: &str,
        now: &str,
    ) -> Result<bool> {
        let changed = conn.execute(
            "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
             WHERE leases.holder = excluded.holder OR leases.expires_at < ?4",
            params![name, holder, expires_at, now],
        )?;
        Ok(changed > 0)
    }

    /// Release a lease if `holder` owns it.
    pub fn release(conn: &Connection, name: &str, holder: &str) -> Result<bool> {
        let changed = conn.execute(
            "DELETE FROM leases WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(changed > 0)
    }

    /// Current lease row, if any.
    pub fn get(conn: &Connection, name: &str) -> Result<Option<LeaseRow>> {
        let row = conn
            .query_row(
                "SELECT name, holder, expires_at FROM leases WHERE name = ?1",
                params![name],
                |row| {
                    Ok(LeaseRow {
                        name: row.get(0)?,
                        holder: row.get(1)?,
                        expires_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
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
    fn acquire_free_lease() {
        let conn = setup();
        assert!(LeaseRepo::try_acquire(&conn, "reconciler", "host-a", "t10", "t0").unwrap());
        let row = LeaseRepo::get(&conn, "reconciler").unwrap().unwrap();
        assert_eq!(row.holder, "host-a");
    }

    #[test]
    fn second_holder_is_rejected_while_live() {
        let conn = setup();
        assert!(LeaseRepo::try_acquire(&conn, "reconciler", "host-a", "t10", "t0").unwrap());
        assert!(!LeaseRepo::try_acquire(&conn, "reconciler", "host-b", "t20", "t1").unwrap());

        let row = LeaseRepo::get(&conn, "reconciler").unwrap().unwrap();
        assert_eq!(row.holder, "host-a");
    }

    #[test]
    fn holder_can_renew() {
        let conn = setup();
        assert!(LeaseRepo::try_acquire(&conn, "reconciler", "host-a", "t10", "t0").unwrap());
        assert!(LeaseRepo::try_acquire(&conn, "reconciler", "host-a", "t20", "t5").unwrap());

        let row = LeaseRepo::get(&conn, "reconciler").unwrap().unwrap();
        assert_eq!(row.expires_at, "t20");
    }

    #[test]
    fn expired_lease_can_be_stolen() {
        let conn = setup();
        assert!(LeaseRepo::try_acquire(&conn, "reconciler", "host-a", "t10", "t0").unwrap());
        // now ("t15") is past the expiry ("t10").
        assert!(LeaseRepo::try_acquire(&conn, "reconciler", "host-b", "t30", "t15").unwrap());

        let row = LeaseRepo::get(&conn, "reconciler").unwrap().unwrap();
        assert_eq!(row.holder, "host-b");
    }

    #[test]
    fn release_requires_ownership() {
        let conn = setup();
        assert!(LeaseRepo::try_acquire(&conn, "reconciler", "host-a", "t10", "t0").unwrap());
        assert!(!LeaseRepo::release(&conn, "reconciler", "host-b").unwrap());
        assert!(LeaseRepo::release(&conn, "reconciler", "host-a").unwrap());
        assert!(LeaseRepo::get(&conn, "reconciler").unwrap().is_none());
    }

    #[test]
    fn leases_are_independent_by_name() {
        let conn = setup();
        assert!(LeaseRepo::try_acquire(&conn, "reconciler", "host-a", "t10", "t0").unwrap());
        assert!(LeaseRepo::try_acquire(&conn, "compactor", "host-b", "t10", "t0").unwrap());
    }
}
