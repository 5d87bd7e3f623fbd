//! Boundaries to the two stores the engine synchronizes.
//!
//! The engine never talks to a database directly — it is generic over
//! [`SourceStore`] (the relational store of record, read-only here) and
//! [`GraphStore`] (the materialized view). Implementations are constructed
//! at process start and injected.

use atlas_core::EntityType;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::{Result, SyncError};

/// A snapshot of an entity read from the source store.
#[derive(Clone, Debug)]
pub struct SourceEntity {
    /// Business key.
    pub entity_id: String,
    /// Row snapshot, including the key field.
    pub payload: Value,
    /// The row's last-modified timestamp.
    pub updated_at: DateTime<Utc>,
}

impl SourceEntity {
    /// The integer version derived from `updated_at` (epoch seconds).
    #[must_use]
    pub fn version(&self) -> i64 {
        self.updated_at.timestamp()
    }
}

/// The relational store of record — read-only contract.
pub trait SourceStore: Send + Sync {
    /// Fetch one entity by business key.
    fn get_entity(&self, entity_type: EntityType, entity_id: &str)
        -> Result<Option<SourceEntity>>;

    /// Most recently modified entities of a type, newest first.
    /// Feeds the reconciliation drift sweep.
    fn list_recent(&self, entity_type: EntityType, limit: i64) -> Result<Vec<SourceEntity>>;
}

/// Address of a node in the graph: label plus business-key field/value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRef {
    /// Node label (`"Concept"`, `"LearningPath"`).
    pub label: String,
    /// Key property name (`"concept_id"`, `"path_id"`).
    pub key_field: String,
    /// Key property value.
    pub key: String,
}

impl NodeRef {
    /// The node address for a node-shaped entity, or `None` for
    /// relationships.
    #[must_use]
    pub fn for_entity(entity_type: EntityType, entity_id: &str) -> Option<Self> {
        let label = entity_type.node_label()?;
        let key_field = entity_type.key_field()?;
        Some(Self {
            label: label.to_owned(),
            key_field: key_field.to_owned(),
            key: entity_id.to_owned(),
        })
    }
}

/// Address of an edge: two node endpoints plus a relationship type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeSpec {
    /// Source endpoint.
    pub source: NodeRef,
    /// Target endpoint.
    pub target: NodeRef,
    /// Relationship type (`"PREREQUISITE"`, `"PART_OF"`, …).
    pub relationship_type: String,
}

impl EdgeSpec {
    /// Build an edge address from a relationship event payload.
    ///
    /// Required payload fields: `source_id`, `target_id`,
    /// `relationship_type`. Optional `source_type`/`target_type` select the
    /// endpoint entity family (default: concept).
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let field = |name: &str| -> Result<&str> {
            payload
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| SyncError::MalformedEvent(format!("missing payload field '{name}'")))
        };
        let endpoint = |id: &str, type_field: &str| -> Result<NodeRef> {
            let entity_type = match payload.get(type_field).and_then(Value::as_str) {
                Some(s) => s
                    .parse::<EntityType>()
                    .map_err(|e| SyncError::MalformedEvent(e.to_string()))?,
                None => EntityType::Concept,
            };
            NodeRef::for_entity(entity_type, id).ok_or_else(|| {
                SyncError::MalformedEvent(format!("'{type_field}' is not a node entity type"))
            })
        };

        Ok(Self {
            source: endpoint(field("source_id")?, "source_type")?,
            target: endpoint(field("target_id")?, "target_type")?,
            relationship_type: field("relationship_type")?.to_owned(),
        })
    }
}

/// The graph-shaped materialized view — idempotent write contract.
///
/// Implementations maintain an `updated_at` property on every write and
/// must accept `source_version` and `synced_at` properties from the
/// consumer.
pub trait GraphStore: Send + Sync {
    /// Merge-or-create a node, overwriting the supplied properties.
    fn upsert_node(&self, node: &NodeRef, properties: &Value) -> Result<()>;

    /// Detach and remove a node. Returns `false` if it did not exist.
    fn delete_node(&self, node: &NodeRef) -> Result<bool>;

    /// Node properties, if present.
    fn get_node(&self, node: &NodeRef) -> Result<Option<Value>>;

    /// The node's stored `source_version`, if present.
    fn node_version(&self, node: &NodeRef) -> Result<Option<i64>>;

    /// Merge-or-create an edge with the given properties.
    fn upsert_edge(&self, edge: &EdgeSpec, properties: &Value) -> Result<()>;

    /// Remove an edge. Returns `false` if it did not exist.
    fn delete_edge(&self, edge: &EdgeSpec) -> Result<bool>;

    /// The edge's stored `source_version`, if present.
    fn edge_version(&self, edge: &EdgeSpec) -> Result<Option<i64>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn node_ref_for_concept() {
        let node = NodeRef::for_entity(EntityType::Concept, "c1").unwrap();
        assert_eq!(node.label, "Concept");
        assert_eq!(node.key_field, "concept_id");
        assert_eq!(node.key, "c1");
    }

    #[test]
    fn node_ref_for_relationship_is_none() {
        assert!(NodeRef::for_entity(EntityType::Relationship, "x").is_none());
    }

    #[test]
    fn edge_spec_defaults_to_concept_endpoints() {
        let edge = EdgeSpec::from_payload(&json!({
            "source_id": "c1",
            "target_id": "c2",
            "relationship_type": "PREREQUISITE",
        }))
        .unwrap();
        assert_eq!(edge.source.label, "Concept");
        assert_eq!(edge.target.key, "c2");
        assert_eq!(edge.relationship_type, "PREREQUISITE");
    }

    #[test]
    fn edge_spec_honours_endpoint_types() {
        let edge = EdgeSpec::from_payload(&json!({
            "source_id": "p1",
            "source_type": "learning_path",
            "target_id": "c2",
            "relationship_type": "CONTAINS",
        }))
        .unwrap();
        assert_eq!(edge.source.label, "LearningPath");
        assert_eq!(edge.source.key_field, "path_id");
        assert_eq!(edge.target.label, "Concept");
    }

    #[test]
    fn edge_spec_missing_field_is_malformed() {
        let err = EdgeSpec::from_payload(&json!({"source_id": "c1"})).unwrap_err();
        assert_matches!(err, SyncError::MalformedEvent(_));
    }

    #[test]
    fn edge_spec_rejects_relationship_endpoint() {
        let err = EdgeSpec::from_payload(&json!({
            "source_id": "c1",
            "source_type": "relationship",
            "target_id": "c2",
            "relationship_type": "X",
        }))
        .unwrap_err();
        assert_matches!(err, SyncError::MalformedEvent(_));
    }

    #[test]
    fn source_entity_version_is_epoch_seconds() {
        let entity = SourceEntity {
            entity_id: "c1".into(),
            payload: json!({}),
            updated_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        assert_eq!(entity.version(), 1_767_225_600);
    }
}
