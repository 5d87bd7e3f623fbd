//! In-memory boundary fakes for engine tests.
//!
//! [`MemorySourceStore`] and [`MemoryGraphStore`] implement the boundary
//! traits over maps, with write-failure injection for retry-path tests.
//! They live in the crate (not behind `cfg(test)`) so downstream crates
//! can drive the engine without a database.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use atlas_core::EntityType;

use crate::errors::{Result, SyncError};
use crate::traits::{EdgeSpec, GraphStore, NodeRef, SourceEntity, SourceStore};

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Source store fake
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory [`SourceStore`].
#[derive(Default)]
pub struct MemorySourceStore {
    entities: Mutex<BTreeMap<(String, String), SourceEntity>>,
    fail_reads: Mutex<bool>,
}

impl MemorySourceStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity.
    pub fn insert(&self, entity_type: EntityType, entity: SourceEntity) {
        let _ = self
            .entities
            .lock()
            .insert((entity_type.as_str().to_owned(), entity.entity_id.clone()), entity);
    }

    /// Remove an entity.
    pub fn remove(&self, entity_type: EntityType, entity_id: &str) {
        let _ = self
            .entities
            .lock()
            .remove(&(entity_type.as_str().to_owned(), entity_id.to_owned()));
    }

    /// When enabled, every read returns [`SyncError::Transient`].
    pub fn fail_reads(&self, on: bool) {
        *self.fail_reads.lock() = on;
    }

    fn check_readable(&self) -> Result<()> {
        if *self.fail_reads.lock() {
            Err(SyncError::Transient("source store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl SourceStore for MemorySourceStore {
    fn get_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<SourceEntity>> {
        self.check_readable()?;
        Ok(self
            .entities
            .lock()
            .get(&(entity_type.as_str().to_owned(), entity_id.to_owned()))
            .cloned())
    }

    fn list_recent(&self, entity_type: EntityType, limit: i64) -> Result<Vec<SourceEntity>> {
        self.check_readable()?;
        let mut entities: Vec<SourceEntity> = self
            .entities
            .lock()
            .iter()
            .filter(|((t, _), _)| t == entity_type.as_str())
            .map(|(_, e)| e.clone())
            .collect();
        entities.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entities.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(entities)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Graph store fake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct GraphInner {
    nodes: BTreeMap<(String, String), Value>,
    edges: BTreeMap<(String, String, String), Value>,
    fail_writes: bool,
}

/// In-memory [`GraphStore`] with write-failure injection.
#[derive(Default)]
pub struct MemoryGraphStore {
    inner: Mutex<GraphInner>,
}

impl MemoryGraphStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// When enabled, every write returns [`SyncError::Transient`].
    pub fn fail_writes(&self, on: bool) {
        self.inner.lock().fail_writes = on;
    }

    /// Set node properties verbatim, bypassing the `updated_at` stamp.
    /// For tests that need full control over graph-side timestamps.
    pub fn put_node_raw(&self, node: &NodeRef, properties: Value) {
        let _ = self
            .inner
            .lock()
            .nodes
            .insert((node.label.clone(), node.key.clone()), properties);
    }

    /// Number of stored nodes.
    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Number of stored edges.
    pub fn edge_count(&self) -> usize {
        self.inner.lock().edges.len()
    }

    fn check_writable(inner: &GraphInner) -> Result<()> {
        if inner.fail_writes {
            Err(SyncError::Transient("graph store unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn edge_key(edge: &EdgeSpec) -> (String, String, String) {
        (
            edge.source.key.clone(),
            edge.relationship_type.clone(),
            edge.target.key.clone(),
        )
    }
}

impl GraphStore for MemoryGraphStore {
    fn upsert_node(&self, node: &NodeRef, properties: &Value) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;

        let key = (node.label.clone(), node.key.clone());
        let mut merged = match inner.nodes.get(&key) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Map::new(),
        };
        if let Value::Object(incoming) = properties {
            for (k, v) in incoming {
                let _ = merged.insert(k.clone(), v.clone());
            }
        }
        let _ = merged.insert("updated_at".into(), Value::String(now_iso()));
        let _ = inner.nodes.insert(key, Value::Object(merged));
        Ok(())
    }

    fn delete_node(&self, node: &NodeRef) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;
        let removed = inner
            .nodes
            .remove(&(node.label.clone(), node.key.clone()))
            .is_some();
        // Detach: drop edges touching the node.
        inner
            .edges
            .retain(|(s, _, t), _| s != &node.key && t != &node.key);
        Ok(removed)
    }

    fn get_node(&self, node: &NodeRef) -> Result<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .nodes
            .get(&(node.label.clone(), node.key.clone()))
            .cloned())
    }

    fn node_version(&self, node: &NodeRef) -> Result<Option<i64>> {
        Ok(self
            .get_node(node)?
            .and_then(|props| props.get("source_version").and_then(Value::as_i64)))
    }

    fn upsert_edge(&self, edge: &EdgeSpec, properties: &Value) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;
        let mut props = match properties {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let _ = props.insert("updated_at".into(), Value::String(now_iso()));
        let _ = inner.edges.insert(Self::edge_key(edge), Value::Object(props));
        Ok(())
    }

    fn delete_edge(&self, edge: &EdgeSpec) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;
        Ok(inner.edges.remove(&Self::edge_key(edge)).is_some())
    }

    fn edge_version(&self, edge: &EdgeSpec) -> Result<Option<i64>> {
        Ok(self
            .inner
            .lock()
            .edges
            .get(&Self::edge_key(edge))
            .and_then(|props| props.get("source_version").and_then(Value::as_i64)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn concept(key: &str) -> NodeRef {
        NodeRef::for_entity(EntityType::Concept, key).unwrap()
    }

    #[test]
    fn upsert_merges_and_stamps() {
        let graph = MemoryGraphStore::new();
        let node = concept("c1");
        graph
            .upsert_node(&node, &json!({"name": "A", "source_version": 1}))
            .unwrap();
        graph.upsert_node(&node, &json!({"name": "B"})).unwrap();

        let props = graph.get_node(&node).unwrap().unwrap();
        assert_eq!(props["name"], "B");
        // Unoverwritten field survives the merge.
        assert_eq!(props["source_version"], 1);
        assert!(props.get("updated_at").is_some());
    }

    #[test]
    fn delete_node_detaches_edges() {
        let graph = MemoryGraphStore::new();
        graph.upsert_node(&concept("c1"), &json!({})).unwrap();
        graph.upsert_node(&concept("c2"), &json!({})).unwrap();
        let edge = EdgeSpec {
            source: concept("c1"),
            target: concept("c2"),
            relationship_type: "PREREQUISITE".into(),
        };
        graph.upsert_edge(&edge, &json!({})).unwrap();
        assert_eq!(graph.edge_count(), 1);

        assert!(graph.delete_node(&concept("c1")).unwrap());
        assert_eq!(graph.edge_count(), 0);
        assert!(!graph.delete_node(&concept("c1")).unwrap());
    }

    #[test]
    fn fail_writes_injects_transient() {
        let graph = MemoryGraphStore::new();
        graph.fail_writes(true);
        let err = graph.upsert_node(&concept("c1"), &json!({})).unwrap_err();
        assert_matches!(err, SyncError::Transient(_));

        graph.fail_writes(false);
        graph.upsert_node(&concept("c1"), &json!({})).unwrap();
    }

    #[test]
    fn source_list_recent_orders_and_limits() {
        let source = MemorySourceStore::new();
        for (id, ts) in [("c1", "2026-01-01T00:00:00Z"), ("c2", "2026-01-03T00:00:00Z"), ("c3", "2026-01-02T00:00:00Z")] {
            source.insert(
                EntityType::Concept,
                SourceEntity {
                    entity_id: id.into(),
                    payload: json!({"concept_id": id}),
                    updated_at: chrono::DateTime::parse_from_rfc3339(ts)
                        .unwrap()
                        .with_timezone(&Utc),
                },
            );
        }

        let recent = source.list_recent(EntityType::Concept, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].entity_id, "c2");
        assert_eq!(recent[1].entity_id, "c3");
    }
}
