//! The [`SyncEvent`] struct and its type discriminators.
//!
//! A `SyncEvent` is the transient unit of change carried over the stream:
//! base fields at the top level and an opaque entity snapshot in `payload`.
//! The wire format is JSON with snake_case field names — the same shape the
//! outbox row stores, so an event parses identically whether it came off the
//! stream or out of the audit log.
//!
//! [`EventType`] is the closed set of type discriminators. Each variant maps
//! to exactly one [`EntityType`] and one [`ChangeKind`]; the consumer
//! dispatches on those two projections rather than on the raw variant, so
//! create/update share an upsert handler by construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::ids;

/// Errors constructing or parsing a sync event.
#[derive(Debug, Error)]
pub enum EventError {
    /// The entity ID was not supplied and could not be derived from the payload.
    #[error("entity id missing and not derivable from payload for {0}")]
    MissingEntityId(EventType),

    /// The event JSON did not deserialize.
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Type discriminators
// ─────────────────────────────────────────────────────────────────────────────

/// All sync event types.
///
/// Wire strings are `SCREAMING_SNAKE_CASE`, matching what producers put on
/// the stream (`"CONCEPT_CREATED"`, `"RELATIONSHIP_DELETED"`, …).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A concept row was inserted in the source store.
    ConceptCreated,
    /// A concept row was updated in the source store.
    ConceptUpdated,
    /// A concept row was deleted from the source store.
    ConceptDeleted,
    /// A learning path row was inserted in the source store.
    LearningPathCreated,
    /// A learning path row was updated in the source store.
    LearningPathUpdated,
    /// A learning path row was deleted from the source store.
    LearningPathDeleted,
    /// A relationship between two entities was created.
    RelationshipCreated,
    /// A relationship between two entities was removed.
    RelationshipDeleted,
}

/// All event type variants, for exhaustive testing.
pub const ALL_EVENT_TYPES: &[EventType] = &[
    EventType::ConceptCreated,
    EventType::ConceptUpdated,
    EventType::ConceptDeleted,
    EventType::LearningPathCreated,
    EventType::LearningPathUpdated,
    EventType::LearningPathDeleted,
    EventType::RelationshipCreated,
    EventType::RelationshipDeleted,
];

impl EventType {
    /// The entity family this event describes.
    #[must_use]
    pub fn entity_type(self) -> EntityType {
        match self {
            Self::ConceptCreated | Self::ConceptUpdated | Self::ConceptDeleted => {
                EntityType::Concept
            }
            Self::LearningPathCreated | Self::LearningPathUpdated | Self::LearningPathDeleted => {
                EntityType::LearningPath
            }
            Self::RelationshipCreated | Self::RelationshipDeleted => EntityType::Relationship,
        }
    }

    /// The semantic change class, used for handler dispatch.
    #[must_use]
    pub fn change(self) -> ChangeKind {
        match self {
            Self::ConceptCreated | Self::LearningPathCreated | Self::RelationshipCreated => {
                ChangeKind::Create
            }
            Self::ConceptUpdated | Self::LearningPathUpdated => ChangeKind::Update,
            Self::ConceptDeleted | Self::LearningPathDeleted | Self::RelationshipDeleted => {
                ChangeKind::Delete
            }
        }
    }

    /// The exact wire string for this variant.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConceptCreated => "CONCEPT_CREATED",
            Self::ConceptUpdated => "CONCEPT_UPDATED",
            Self::ConceptDeleted => "CONCEPT_DELETED",
            Self::LearningPathCreated => "LEARNING_PATH_CREATED",
            Self::LearningPathUpdated => "LEARNING_PATH_UPDATED",
            Self::LearningPathDeleted => "LEARNING_PATH_DELETED",
            Self::RelationshipCreated => "RELATIONSHIP_CREATED",
            Self::RelationshipDeleted => "RELATIONSHIP_DELETED",
        }
    }

    /// The update event type for an entity family, used by the
    /// reconciliation drift sweep to synthesize repair events.
    #[must_use]
    pub fn update_for(entity_type: EntityType) -> Option<Self> {
        match entity_type {
            EntityType::Concept => Some(Self::ConceptUpdated),
            EntityType::LearningPath => Some(Self::LearningPathUpdated),
            // Relationships have no update semantics — only create/delete.
            EntityType::Relationship => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown event type string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown event type: {0}")]
pub struct ParseEventTypeError(pub String);

impl FromStr for EventType {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_EVENT_TYPES
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseEventTypeError(s.to_owned()))
    }
}

/// The entity families the engine synchronizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A knowledge graph concept node.
    Concept,
    /// A learning path node.
    LearningPath,
    /// An edge between two entities.
    Relationship,
}

impl EntityType {
    /// Stable string form (`"concept"`, `"learning_path"`, `"relationship"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Concept => "concept",
            Self::LearningPath => "learning_path",
            Self::Relationship => "relationship",
        }
    }

    /// Graph node label for node-shaped entity types.
    #[must_use]
    pub fn node_label(self) -> Option<&'static str> {
        match self {
            Self::Concept => Some("Concept"),
            Self::LearningPath => Some("LearningPath"),
            Self::Relationship => None,
        }
    }

    /// The payload field holding the business key for node-shaped entities.
    #[must_use]
    pub fn key_field(self) -> Option<&'static str> {
        match self {
            Self::Concept => Some("concept_id"),
            Self::LearningPath => Some("path_id"),
            Self::Relationship => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concept" => Ok(Self::Concept),
            "learning_path" => Ok(Self::LearningPath),
            "relationship" => Ok(Self::Relationship),
            other => Err(ParseEventTypeError(other.to_owned())),
        }
    }
}

/// Semantic change class of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Entity appeared in the source store.
    Create,
    /// Entity was modified in the source store.
    Update,
    /// Entity was removed from the source store.
    Delete,
}

// ─────────────────────────────────────────────────────────────────────────────
// SyncEvent
// ─────────────────────────────────────────────────────────────────────────────

/// The versioned, serializable unit of change carried over the stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Unique event ID (`evt_…`, UUID v7).
    pub event_id: String,
    /// Correlation ID grouping related events (`cor_…` or `reconciliation-…`).
    pub correlation_id: String,
    /// Event type discriminator.
    pub event_type: EventType,
    /// Business key of the affected entity.
    pub entity_id: String,
    /// Entity family.
    pub entity_type: EntityType,
    /// RFC 3339 timestamp of when the event was emitted.
    pub timestamp: String,
    /// Entity snapshot at emission time (opaque JSON).
    pub payload: Value,
    /// Source version — Unix epoch seconds of the source row's `updated_at`.
    pub source_version: i64,
    /// Failed publish/apply attempts so far.
    pub retry_count: u32,
    /// Retry budget before the event goes terminal FAILED.
    pub max_retries: u32,
    /// Last recorded error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 last-modification timestamp.
    pub updated_at: String,
}

impl SyncEvent {
    /// Build a new event.
    ///
    /// When `entity_id` is `None` it is derived from the payload: the
    /// entity family's key field for nodes, or
    /// `source_id:relationship_type:target_id` for relationships.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MissingEntityId`] when no entity ID was given
    /// and the payload does not carry the fields to derive one.
    pub fn new(
        event_type: EventType,
        entity_id: Option<String>,
        payload: Value,
        source_version: i64,
        correlation_id: Option<String>,
        max_retries: u32,
    ) -> Result<Self, EventError> {
        let entity_id = match entity_id {
            Some(id) => id,
            None => derive_entity_id(event_type, &payload)
                .ok_or(EventError::MissingEntityId(event_type))?,
        };
        // Fixed-width UTC form so stored timestamps compare lexicographically.
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        Ok(Self {
            event_id: ids::event_id(),
            correlation_id: correlation_id.unwrap_or_else(ids::correlation_id),
            event_type,
            entity_id,
            entity_type: event_type.entity_type(),
            timestamp: now.clone(),
            payload,
            source_version,
            retry_count: 0,
            max_retries,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the JSON wire format.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Derive an entity ID from an event payload.
///
/// Node entities use their key field; relationships compose
/// `source_id:relationship_type:target_id`.
#[must_use]
pub fn derive_entity_id(event_type: EventType, payload: &Value) -> Option<String> {
    let entity_type = event_type.entity_type();
    if let Some(field) = entity_type.key_field() {
        return payload.get(field).and_then(Value::as_str).map(str::to_owned);
    }
    let source = payload.get("source_id")?.as_str()?;
    let rel = payload.get("relationship_type")?.as_str()?;
    let target = payload.get("target_id")?.as_str()?;
    Some(format!("{source}:{rel}:{target}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
