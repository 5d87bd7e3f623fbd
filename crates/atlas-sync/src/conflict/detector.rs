//! Conflict detection.
//!
//! A conflict exists only when both stores were modified independently
//! since the last successful sync. A one-sided existence difference is a
//! pending sync, not a conflict. Two checks run in order:
//!
//! 1. **Version mismatch** — both sides' `updated_at` are strictly newer
//!    than the graph's recorded `synced_at` (epoch when absent)
//! 2. **Data divergence** — any of the semantic fields differ between the
//!    two snapshots, even without a version conflict

use std::sync::Arc;

use atlas_core::{ConflictType, EntityType};
use atlas_store::row_types::ConflictRow;
use atlas_store::{NewConflict, SyncStore};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::errors::Result;
use crate::traits::{GraphStore, NodeRef, SourceStore};

/// Semantic fields compared for data divergence.
pub const SEMANTIC_FIELDS: &[&str] = &["name", "display_name", "description", "category"];

/// A detected conflict, not yet persisted.
#[derive(Clone, Debug)]
pub struct ConflictInfo {
    /// Entity family.
    pub entity_type: EntityType,
    /// Entity business key.
    pub entity_id: String,
    /// Classification.
    pub conflict_type: ConflictType,
    /// Source-side `updated_at` as epoch seconds.
    pub source_version: i64,
    /// Target-side `updated_at` as epoch seconds.
    pub target_version: i64,
    /// Full source snapshot.
    pub source_snapshot: Value,
    /// Full target snapshot.
    pub target_snapshot: Value,
    /// Map of field → `[source value, target value]` for differing fields.
    pub differences: Value,
}

/// Compares entity state between the source store and the graph.
pub struct ConflictDetector {
    source: Arc<dyn SourceStore>,
    graph: Arc<dyn GraphStore>,
    store: Arc<SyncStore>,
}

impl ConflictDetector {
    /// Create a detector over the injected stores.
    pub fn new(
        source: Arc<dyn SourceStore>,
        graph: Arc<dyn GraphStore>,
        store: Arc<SyncStore>,
    ) -> Self {
        Self {
            source,
            graph,
            store,
        }
    }

    /// Detect a conflict for one entity, if any.
    ///
    /// Relationships carry no semantic fields and are excluded; their
    /// divergence is handled by the drift sweep.
    pub fn detect(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<ConflictInfo>> {
        let Some(node) = NodeRef::for_entity(entity_type, entity_id) else {
            return Ok(None);
        };

        let Some(source) = self.source.get_entity(entity_type, entity_id)? else {
            return Ok(None);
        };
        let Some(target) = self.graph.get_node(&node)? else {
            return Ok(None);
        };

        let last_sync = timestamp_prop(&target, "synced_at");
        let source_updated = source.updated_at;
        let target_updated = timestamp_prop(&target, "updated_at");

        let differences = diff_semantic_fields(&source.payload, &target);

        // Both sides changed since the last successful sync.
        if source_updated > last_sync && target_updated > last_sync {
            info!(
                entity_type = %entity_type,
                entity_id,
                source_updated = %source_updated,
                target_updated = %target_updated,
                "version mismatch detected"
            );
            return Ok(Some(ConflictInfo {
                entity_type,
                entity_id: entity_id.to_owned(),
                conflict_type: ConflictType::VersionMismatch,
                source_version: source_updated.timestamp(),
                target_version: target_updated.timestamp(),
                source_snapshot: source.payload,
                target_snapshot: target,
                differences,
            }));
        }

        // Field-level divergence without a two-sided version conflict.
        if !differences.as_object().is_some_and(Map::is_empty) {
            debug!(entity_type = %entity_type, entity_id, "data divergence detected");
            return Ok(Some(ConflictInfo {
                entity_type,
                entity_id: entity_id.to_owned(),
                conflict_type: ConflictType::DataDivergence,
                source_version: source_updated.timestamp(),
                target_version: target_updated.timestamp(),
                source_snapshot: source.payload,
                target_snapshot: target,
                differences,
            }));
        }

        Ok(None)
    }

    /// Detect across a batch of entity IDs, keeping only the conflicts.
    pub fn detect_batch(
        &self,
        entity_type: EntityType,
        entity_ids: &[String],
    ) -> Result<Vec<ConflictInfo>> {
        let mut conflicts = Vec::new();
        for entity_id in entity_ids {
            if let Some(info) = self.detect(entity_type, entity_id)? {
                conflicts.push(info);
            }
        }
        Ok(conflicts)
    }

    /// Detect and persist: records the conflict row and raises the entity's
    /// conflict flag. Returns the stored record.
    pub fn detect_and_record(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<ConflictRow>> {
        let Some(info) = self.detect(entity_type, entity_id)? else {
            return Ok(None);
        };
        let row = self.store.record_conflict(&NewConflict {
            entity_type: info.entity_type,
            entity_id: info.entity_id.clone(),
            conflict_type: info.conflict_type,
            source_version: Some(info.source_version),
            target_version: Some(info.target_version),
            source_snapshot: info.source_snapshot,
            target_snapshot: info.target_snapshot,
            difference_summary: info.differences,
            event_log_id: None,
        })?;
        Ok(Some(row))
    }
}

/// Parse an RFC 3339 timestamp property, defaulting to the epoch.
fn timestamp_prop(props: &Value, field: &str) -> DateTime<Utc> {
    props
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(DateTime::<Utc>::default, |dt| dt.with_timezone(&Utc))
}

/// Compare the semantic field set; returns `{field: [source, target]}`.
fn diff_semantic_fields(source: &Value, target: &Value) -> Value {
    let mut differences = Map::new();
    for &field in SEMANTIC_FIELDS {
        let s = source.get(field).cloned().unwrap_or(Value::Null);
        let t = target.get(field).cloned().unwrap_or(Value::Null);
        if s != t {
            let _ = differences.insert(field.to_owned(), Value::Array(vec![s, t]));
        }
    }
    Value::Object(differences)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
