//! Read-only source store adapter over the application's relational tables.

use atlas_core::EntityType;
use atlas_store::ConnectionPool;
use atlas_sync::{SourceEntity, SourceStore, SyncError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

type Result<T> = std::result::Result<T, SyncError>;

const CONCEPT_COLUMNS: &str =
    "concept_id, name, display_name, description, category, difficulty, updated_at";
const PATH_COLUMNS: &str = "path_id, name, description, category, updated_at";

/// Source-of-truth adapter reading `concepts` and `learning_paths` tables.
pub struct SqliteSourceStore {
    pool: ConnectionPool,
}

impl SqliteSourceStore {
    /// Create the adapter over the shared pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Create the application tables if they do not exist.
    ///
    /// Real deployments own these tables elsewhere; this keeps a fresh
    /// database runnable end-to-end.
    pub fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS concepts (
               concept_id   TEXT PRIMARY KEY,
               name         TEXT NOT NULL,
               display_name TEXT,
               description  TEXT,
               category     TEXT,
               difficulty   INTEGER,
               updated_at   TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_concepts_updated ON concepts(updated_at);
             CREATE TABLE IF NOT EXISTS learning_paths (
               path_id     TEXT PRIMARY KEY,
               name        TEXT NOT NULL,
               description TEXT,
               category    TEXT,
               updated_at  TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_paths_updated ON learning_paths(updated_at);",
        )
        .map_err(transient)?;
        Ok(())
    }

    fn conn(&self) -> Result<atlas_store::PooledConnection> {
        self.pool.get().map_err(|e| SyncError::Transient(e.to_string()))
    }

    fn concept_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<(serde_json::Value, String)> {
        let concept_id: String = row.get(0)?;
        let name: String = row.get(1)?;
        let display_name: Option<String> = row.get(2)?;
        let description: Option<String> = row.get(3)?;
        let category: Option<String> = row.get(4)?;
        let difficulty: Option<i64> = row.get(5)?;
        let updated_at: String = row.get(6)?;
        let payload = json!({
            "concept_id": concept_id,
            "name": name,
            "display_name": display_name,
            "description": description,
            "category": category,
            "difficulty": difficulty,
        });
        Ok((payload, updated_at))
    }

    fn path_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<(serde_json::Value, String)> {
        let path_id: String = row.get(0)?;
        let name: String = row.get(1)?;
        let description: Option<String> = row.get(2)?;
        let category: Option<String> = row.get(3)?;
        let updated_at: String = row.get(4)?;
        let payload = json!({
            "path_id": path_id,
            "name": name,
            "description": description,
            "category": category,
        });
        Ok((payload, updated_at))
    }

    fn to_entity(
        entity_type: EntityType,
        payload: serde_json::Value,
        updated_at: &str,
    ) -> Result<SourceEntity> {
        let key_field = entity_type
            .key_field()
            .expect("source adapter serves node entity types only");
        let entity_id = payload
            .get(key_field)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let updated_at = parse_timestamp(updated_at)?;
        Ok(SourceEntity {
            entity_id,
            payload,
            updated_at,
        })
    }

    fn query_one(
        conn: &Connection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<SourceEntity>> {
        let row = match entity_type {
            EntityType::Concept => conn
                .query_row(
                    &format!("SELECT {CONCEPT_COLUMNS} FROM concepts WHERE concept_id = ?1"),
                    params![entity_id],
                    Self::concept_entity,
                )
                .optional(),
            EntityType::LearningPath => conn
                .query_row(
                    &format!("SELECT {PATH_COLUMNS} FROM learning_paths WHERE path_id = ?1"),
                    params![entity_id],
                    Self::path_entity,
                )
                .optional(),
            EntityType::Relationship => return Ok(None),
        }
        .map_err(transient)?;

        row.map(|(payload, updated_at)| Self::to_entity(entity_type, payload, &updated_at))
            .transpose()
    }
}

impl SourceStore for SqliteSourceStore {
    fn get_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<SourceEntity>> {
        let conn = self.conn()?;
        Self::query_one(&conn, entity_type, entity_id)
    }

    fn list_recent(&self, entity_type: EntityType, limit: i64) -> Result<Vec<SourceEntity>> {
        let conn = self.conn()?;
        let rows: Vec<(serde_json::Value, String)> = match entity_type {
            EntityType::Concept => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {CONCEPT_COLUMNS} FROM concepts
                         ORDER BY updated_at DESC LIMIT ?1"
                    ))
                    .map_err(transient)?;
                let rows = stmt
                    .query_map(params![limit], Self::concept_entity)
                    .map_err(transient)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(transient)?;
                rows
            }
            EntityType::LearningPath => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {PATH_COLUMNS} FROM learning_paths
                         ORDER BY updated_at DESC LIMIT ?1"
                    ))
                    .map_err(transient)?;
                let rows = stmt
                    .query_map(params![limit], Self::path_entity)
                    .map_err(transient)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(transient)?;
                rows
            }
            EntityType::Relationship => Vec::new(),
        };

        rows.into_iter()
            .map(|(payload, updated_at)| Self::to_entity(entity_type, payload, &updated_at))
            .collect()
    }
}

fn transient(err: rusqlite::Error) -> SyncError {
    SyncError::Transient(err.to_string())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Transient(format!("bad timestamp '{raw}': {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
