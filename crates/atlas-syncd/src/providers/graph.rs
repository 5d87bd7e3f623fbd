//! Graph store adapter: node/edge tables with JSON properties.
//!
//! Nodes are addressed `(label, key)` and edges
//! `(source_key, relationship_type, target_key)`. Upserts merge incoming
//! properties over the stored object and stamp `updated_at`; node deletion
//! detaches edges touching the node.

use atlas_store::ConnectionPool;
use atlas_sync::{EdgeSpec, GraphStore, NodeRef, SyncError};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};

type Result<T> = std::result::Result<T, SyncError>;

/// Materialized-view adapter over `graph_nodes` and `graph_edges` tables.
pub struct SqliteGraphStore {
    pool: ConnectionPool,
}

impl SqliteGraphStore {
    /// Create the adapter over the shared pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Create the graph tables if they do not exist.
    pub fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS graph_nodes (
               label      TEXT NOT NULL,
               node_key   TEXT NOT NULL,
               properties TEXT NOT NULL,
               updated_at TEXT NOT NULL,
               PRIMARY KEY (label, node_key)
             );
             CREATE TABLE IF NOT EXISTS graph_edges (
               source_key        TEXT NOT NULL,
               relationship_type TEXT NOT NULL,
               target_key        TEXT NOT NULL,
               source_label      TEXT NOT NULL,
               target_label      TEXT NOT NULL,
               properties        TEXT NOT NULL,
               updated_at        TEXT NOT NULL,
               PRIMARY KEY (source_key, relationship_type, target_key)
             );
             CREATE INDEX IF NOT EXISTS idx_graph_edges_target ON graph_edges(target_key);",
        )
        .map_err(transient)?;
        Ok(())
    }

    /// Number of stored nodes (observability and tests).
    pub fn node_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM graph_nodes", [], |row| row.get(0))
            .map_err(transient)
    }

    /// Number of stored edges (observability and tests).
    pub fn edge_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM graph_edges", [], |row| row.get(0))
            .map_err(transient)
    }

    fn conn(&self) -> Result<atlas_store::PooledConnection> {
        self.pool.get().map_err(|e| SyncError::Transient(e.to_string()))
    }

    fn now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn merge_props(existing: Option<String>, incoming: &Value, now: &str) -> Result<String> {
        let mut merged: Map<String, Value> = match existing {
            Some(raw) => serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default(),
            None => Map::new(),
        };
        if let Value::Object(incoming) = incoming {
            for (k, v) in incoming {
                let _ = merged.insert(k.clone(), v.clone());
            }
        }
        let _ = merged.insert("updated_at".into(), Value::String(now.to_owned()));
        serde_json::to_string(&Value::Object(merged))
            .map_err(|e| SyncError::Transient(e.to_string()))
    }
}

impl GraphStore for SqliteGraphStore {
    fn upsert_node(&self, node: &NodeRef, properties: &Value) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(transient)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT properties FROM graph_nodes WHERE label = ?1 AND node_key = ?2",
                params![node.label, node.key],
                |row| row.get(0),
            )
            .optional()
            .map_err(transient)?;

        let now = Self::now();
        let props = Self::merge_props(existing, properties, &now)?;
        let _ = tx
            .execute(
                "INSERT INTO graph_nodes (label, node_key, properties, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(label, node_key) DO UPDATE SET
                    properties = excluded.properties,
                    updated_at = excluded.updated_at",
                params![node.label, node.key, props, now],
            )
            .map_err(transient)?;
        tx.commit().map_err(transient)
    }

    fn delete_node(&self, node: &NodeRef) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(transient)?;

        let removed = tx
            .execute(
                "DELETE FROM graph_nodes WHERE label = ?1 AND node_key = ?2",
                params![node.label, node.key],
            )
            .map_err(transient)?;
        // Detach: edges touching the node go with it.
        let _ = tx
            .execute(
                "DELETE FROM graph_edges WHERE source_key = ?1 OR target_key = ?1",
                params![node.key],
            )
            .map_err(transient)?;
        tx.commit().map_err(transient)?;
        Ok(removed > 0)
    }

    fn get_node(&self, node: &NodeRef) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT properties FROM graph_nodes WHERE label = ?1 AND node_key = ?2",
                params![node.label, node.key],
                |row| row.get(0),
            )
            .optional()
            .map_err(transient)?;
        raw.map(|s| serde_json::from_str(&s).map_err(|e| SyncError::Transient(e.to_string())))
            .transpose()
    }

    fn node_version(&self, node: &NodeRef) -> Result<Option<i64>> {
        Ok(self
            .get_node(node)?
            .and_then(|props| props.get("source_version").and_then(Value::as_i64)))
    }

    fn upsert_edge(&self, edge: &EdgeSpec, properties: &Value) -> Result<()> {
        let conn = self.conn()?;
        let now = Self::now();
        let props = Self::merge_props(None, properties, &now)?;
        let _ = conn
            .execute(
                "INSERT INTO graph_edges (source_key, relationship_type, target_key,
                    source_label, target_label, properties, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(source_key, relationship_type, target_key) DO UPDATE SET
                    source_label = excluded.source_label,
                    target_label = excluded.target_label,
                    properties = excluded.properties,
                    updated_at = excluded.updated_at",
                params![
                    edge.source.key,
                    edge.relationship_type,
                    edge.target.key,
                    edge.source.label,
                    edge.target.label,
                    props,
                    now
                ],
            )
            .map_err(transient)?;
        Ok(())
    }

    fn delete_edge(&self, edge: &EdgeSpec) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM graph_edges
                 WHERE source_key = ?1 AND relationship_type = ?2 AND target_key = ?3",
                params![edge.source.key, edge.relationship_type, edge.target.key],
            )
            .map_err(transient)?;
        Ok(removed > 0)
    }

    fn edge_version(&self, edge: &EdgeSpec) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT properties FROM graph_edges
                 WHERE source_key = ?1 AND relationship_type = ?2 AND target_key = ?3",
                params![edge.source.key, edge.relationship_type, edge.target.key],
                |row| row.get(0),
            )
            .optional()
            .map_err(transient)?;
        Ok(raw
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
            .and_then(|props| props.get("source_version").and_then(Value::as_i64)))
    }
}

fn transient(err: rusqlite::Error) -> SyncError {
    SyncError::Transient(err.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::EntityType;
    use atlas_store::{new_in_memory, ConnectionConfig};
    use serde_json::json;

    fn setup() -> SqliteGraphStore {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let store = SqliteGraphStore::new(pool);
        store.ensure_schema().unwrap();
        store
    }

    fn concept(key: &str) -> NodeRef {
        NodeRef::for_entity(EntityType::Concept, key).unwrap()
    }

    fn edge(source: &str, target: &str) -> EdgeSpec {
        EdgeSpec {
            source: concept(source),
            target: concept(target),
            relationship_type: "PREREQUISITE".into(),
        }
    }

    #[test]
    fn upsert_creates_then_merges() {
        let store = setup();
        let node = concept("c1");
        store
            .upsert_node(&node, &json!({"name": "A", "source_version": 1}))
            .unwrap();
        store.upsert_node(&node, &json!({"name": "B"})).unwrap();

        let props = store.get_node(&node).unwrap().unwrap();
        assert_eq!(props["name"], "B");
        assert_eq!(props["source_version"], 1);
        assert!(props.get("updated_at").is_some());
        assert_eq!(store.node_count().unwrap(), 1);
    }

    #[test]
    fn upsert_twice_same_input_is_idempotent() {
        let store = setup();
        let node = concept("c1");
        let props = json!({"name": "A", "source_version": 5, "synced_at": "t"});
        store.upsert_node(&node, &props).unwrap();
        store.upsert_node(&node, &props).unwrap();

        let stored = store.get_node(&node).unwrap().unwrap();
        assert_eq!(stored["name"], "A");
        assert_eq!(store.node_version(&node).unwrap(), Some(5));
        assert_eq!(store.node_count().unwrap(), 1);
    }

    #[test]
    fn node_version_absent_without_property() {
        let store = setup();
        let node = concept("c1");
        store.upsert_node(&node, &json!({"name": "A"})).unwrap();
        assert_eq!(store.node_version(&node).unwrap(), None);
        assert_eq!(store.node_version(&concept("ghost")).unwrap(), None);
    }

    #[test]
    fn delete_node_detaches_edges() {
        let store = setup();
        store.upsert_node(&concept("c1"), &json!({})).unwrap();
        store.upsert_node(&concept("c2"), &json!({})).unwrap();
        store.upsert_edge(&edge("c1", "c2"), &json!({})).unwrap();
        assert_eq!(store.edge_count().unwrap(), 1);

        assert!(store.delete_node(&concept("c2")).unwrap());
        assert_eq!(store.edge_count().unwrap(), 0);
        assert!(!store.delete_node(&concept("c2")).unwrap());
    }

    #[test]
    fn labels_partition_the_key_space() {
        let store = setup();
        let concept_node = concept("x1");
        let path_node = NodeRef::for_entity(EntityType::LearningPath, "x1").unwrap();
        store.upsert_node(&concept_node, &json!({"name": "c"})).unwrap();
        store.upsert_node(&path_node, &json!({"name": "p"})).unwrap();

        assert_eq!(store.get_node(&concept_node).unwrap().unwrap()["name"], "c");
        assert_eq!(store.get_node(&path_node).unwrap().unwrap()["name"], "p");
    }

    #[test]
    fn edge_version_tracks_property() {
        let store = setup();
        let e = edge("c1", "c2");
        store
            .upsert_edge(&e, &json!({"source_version": 9}))
            .unwrap();
        assert_eq!(store.edge_version(&e).unwrap(), Some(9));

        assert!(store.delete_edge(&e).unwrap());
        assert_eq!(store.edge_version(&e).unwrap(), None);
        assert!(!store.delete_edge(&e).unwrap());
    }
}
