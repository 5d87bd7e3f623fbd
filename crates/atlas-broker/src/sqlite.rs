//! [`SqliteBroker`] — a durable stream backed by `SQLite`.
//!
//! Three tables: `broker_messages` (the log), `broker_groups` (per-group
//! delivery cursor), and `broker_pending` (claimed-but-unacked entries with
//! delivery counts). Claims run inside an IMMEDIATE transaction, so two
//! consumers in one group can never claim the same message. Blocking reads
//! poll at a short interval up to the caller's `block_ms`.

use std::time::{Duration, Instant};

use atlas_store::ConnectionPool;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::broker::{Broker, StreamMessage};
use crate::errors::{BrokerError, Result};

const POLL_INTERVAL_MS: u64 = 50;

/// Durable SQLite-backed stream with consumer-group delivery.
pub struct SqliteBroker {
    pool: ConnectionPool,
}

impl SqliteBroker {
    /// Create a broker over the given pool, ensuring its tables exist.
    pub fn new(pool: ConnectionPool) -> Result<Self> {
        {
            let conn = pool.get()?;
            ensure_schema(&conn)?;
        }
        Ok(Self { pool })
    }

    /// Number of messages currently stored for a stream.
    pub fn stream_len(&self, stream: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM broker_messages WHERE stream = ?1",
            params![stream],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Number of claimed-but-unacked messages for a group.
    pub fn pending_len(&self, stream: &str, group: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM broker_pending WHERE stream = ?1 AND group_name = ?2",
            params![stream, group],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// One claim attempt: returns the claimed batch (possibly empty).
    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last_delivered: i64 = tx
            .query_row(
                "SELECT last_delivered FROM broker_groups
                 WHERE stream = ?1 AND group_name = ?2",
                params![stream, group],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| BrokerError::UnknownGroup {
                stream: stream.to_owned(),
                group: group.to_owned(),
            })?;

        let batch: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT seq, body FROM broker_messages
                 WHERE stream = ?1 AND seq > ?2
                 ORDER BY seq ASC LIMIT ?3",
            )?;
            #[allow(clippy::cast_possible_wrap)]
            let rows = stmt
                .query_map(params![stream, last_delivered, count as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        if batch.is_empty() {
            tx.commit()?;
            return Ok(Vec::new());
        }

        let max_seq = batch.last().map_or(last_delivered, |(seq, _)| *seq);
        let _ = tx.execute(
            "UPDATE broker_groups SET last_delivered = ?1
             WHERE stream = ?2 AND group_name = ?3",
            params![max_seq, stream, group],
        )?;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        for (seq, _) in &batch {
            let _ = tx.execute(
                "INSERT INTO broker_pending (stream, group_name, seq, consumer,
                    delivered_at, delivery_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(stream, group_name, seq) DO UPDATE SET
                    consumer = excluded.consumer,
                    delivered_at = excluded.delivered_at,
                    delivery_count = broker_pending.delivery_count + 1",
                params![stream, group, seq, consumer, now],
            )?;
        }
        tx.commit()?;

        debug!(stream, group, consumer, claimed = batch.len(), "claimed batch");
        Ok(batch
            .into_iter()
            .map(|(seq, body)| StreamMessage {
                id: seq.to_string(),
                body,
            })
            .collect())
    }
}

impl Broker for SqliteBroker {
    fn ensure_stream(&self, stream: &str, group: &str) -> Result<()> {
        let conn = self.pool.get()?;
        // New groups start at the beginning of the stream.
        let _ = conn.execute(
            "INSERT OR IGNORE INTO broker_groups (stream, group_name, last_delivered)
             VALUES (?1, ?2, 0)",
            params![stream, group],
        )?;
        Ok(())
    }

    fn append(&self, stream: &str, body: &str, max_len: i64) -> Result<String> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let _ = tx.execute(
            "INSERT INTO broker_messages (stream, body, appended_at) VALUES (?1, ?2, ?3)",
            params![stream, body, now],
        )?;
        let seq = tx.last_insert_rowid();

        // Trim everything older than the newest `max_len` entries.
        if max_len > 0 {
            let _ = tx.execute(
                "DELETE FROM broker_messages
                 WHERE stream = ?1 AND seq <= (
                    SELECT seq FROM broker_messages WHERE stream = ?1
                    ORDER BY seq DESC LIMIT 1 OFFSET ?2)",
                params![stream, max_len],
            )?;
        }
        tx.commit()?;

        Ok(seq.to_string())
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let batch = self.claim(stream, group, consumer, count)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }
    }

    fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<bool> {
        let Ok(seq) = message_id.parse::<i64>() else {
            return Ok(false);
        };
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "DELETE FROM broker_pending
             WHERE stream = ?1 AND group_name = ?2 AND seq = ?3",
            params![stream, group, seq],
        )?;
        Ok(changed > 0)
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS broker_messages (
           seq         INTEGER PRIMARY KEY AUTOINCREMENT,
           stream      TEXT    NOT NULL,
           body        TEXT    NOT NULL,
           appended_at TEXT    NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_broker_messages_stream
           ON broker_messages(stream, seq);
         CREATE TABLE IF NOT EXISTS broker_groups (
           stream         TEXT    NOT NULL,
           group_name     TEXT    NOT NULL,
           last_delivered INTEGER NOT NULL DEFAULT 0,
           PRIMARY KEY (stream, group_name)
         );
         CREATE TABLE IF NOT EXISTS broker_pending (
           stream         TEXT    NOT NULL,
           group_name     TEXT    NOT NULL,
           seq            INTEGER NOT NULL,
           consumer       TEXT    NOT NULL,
           delivered_at   TEXT    NOT NULL,
           delivery_count INTEGER NOT NULL DEFAULT 1,
           PRIMARY KEY (stream, group_name, seq)
         );",
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
