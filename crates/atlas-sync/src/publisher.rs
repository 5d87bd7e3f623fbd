//! The outbox writer.
//!
//! [`Publisher::create_event`] durably records a PENDING event row in the
//! same unit of work as the business mutation it describes;
//! [`Publisher::publish_event`] pushes it onto the stream and flips the row
//! to PUBLISHED. Broker unavailability is absorbed: the row stays PENDING
//! with the error recorded, and [`Publisher::retry_pending_events`] (or the
//! reconciliation sweep) republishes it later.

use std::sync::Arc;

use atlas_broker::Broker;
use atlas_core::{ChangeKind, EventType, RetryConfig, SyncEvent};
use atlas_store::SyncStore;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};

/// Publisher tuning.
#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// Stream events are appended to.
    pub stream: String,
    /// Approximate cap on stored stream entries.
    pub max_len: i64,
    /// Retry budget and backoff applied to republish attempts.
    pub retry: RetryConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            stream: "atlas:sync:events".into(),
            max_len: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

/// Outcome of a [`Publisher::retry_pending_events`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetrySummary {
    /// Rows scanned.
    pub scanned: usize,
    /// Rows successfully republished.
    pub republished: usize,
    /// Rows still inside their backoff window, untouched this pass.
    pub deferred: usize,
    /// Rows whose republish failed (left in place for the next pass).
    pub failed: usize,
}

/// Writes events to the outbox and pushes them onto the stream.
pub struct Publisher {
    store: Arc<SyncStore>,
    broker: Arc<dyn Broker>,
    config: PublisherConfig,
}

impl Publisher {
    /// Create a publisher over the injected store and broker.
    pub fn new(store: Arc<SyncStore>, broker: Arc<dyn Broker>, config: PublisherConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    /// The configured stream name.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.config.stream
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbox writes
    // ─────────────────────────────────────────────────────────────────────

    /// Build an event and write its PENDING outbox row.
    ///
    /// `entity_id` is derived from the payload when absent;
    /// `source_version` defaults to the current time in epoch seconds;
    /// `correlation_id` defaults to a fresh one.
    pub fn create_event(
        &self,
        event_type: EventType,
        entity_id: Option<String>,
        payload: Value,
        source_version: Option<i64>,
        correlation_id: Option<String>,
    ) -> Result<SyncEvent> {
        let event = self.build_event(event_type, entity_id, payload, source_version, correlation_id)?;
        self.store.create_event(&event)?;
        debug!(event_id = %event.event_id, event_type = %event.event_type, "outbox row written");
        Ok(event)
    }

    /// Like [`Self::create_event`], but writes the outbox row on a
    /// caller-supplied connection — the classic outbox pattern, where the
    /// event insert commits or rolls back with the caller's own transaction.
    pub fn create_event_on(
        &self,
        conn: &Connection,
        event_type: EventType,
        entity_id: Option<String>,
        payload: Value,
        source_version: Option<i64>,
        correlation_id: Option<String>,
    ) -> Result<SyncEvent> {
        let event = self.build_event(event_type, entity_id, payload, source_version, correlation_id)?;
        SyncStore::create_event_on(conn, &event)?;
        Ok(event)
    }

    fn build_event(
        &self,
        event_type: EventType,
        entity_id: Option<String>,
        payload: Value,
        source_version: Option<i64>,
        correlation_id: Option<String>,
    ) -> Result<SyncEvent> {
        Ok(SyncEvent::new(
            event_type,
            entity_id,
            payload,
            source_version.unwrap_or_else(|| Utc::now().timestamp()),
            correlation_id,
            self.config.retry.max_retries,
        )?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stream appends
    // ─────────────────────────────────────────────────────────────────────

    /// Append the event to the stream and flip its row to PUBLISHED.
    ///
    /// Returns `Ok(false)` on broker failure: the row stays PENDING with
    /// the error recorded, and nothing propagates to the caller of
    /// [`Self::create_event`].
    pub fn publish_event(&self, event: &SyncEvent) -> Result<bool> {
        let body = event.to_json()?;
        match self.broker.append(&self.config.stream, &body, self.config.max_len) {
            Ok(message_id) => {
                self.store.mark_published(&event.event_id, &message_id)?;
                debug!(event_id = %event.event_id, message_id, "event published");
                Ok(true)
            }
            Err(err) => {
                warn!(event_id = %event.event_id, error = %err, "publish failed, row left pending");
                self.store
                    .record_publish_failure(&event.event_id, &err.to_string())?;
                Ok(false)
            }
        }
    }

    /// Create and publish in one call.
    pub fn publish(
        &self,
        event_type: EventType,
        entity_id: Option<String>,
        payload: Value,
        source_version: Option<i64>,
        correlation_id: Option<String>,
    ) -> Result<SyncEvent> {
        let event =
            self.create_event(event_type, entity_id, payload, source_version, correlation_id)?;
        let _ = self.publish_event(&event)?;
        Ok(event)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Per-entity wrappers
    // ─────────────────────────────────────────────────────────────────────

    /// Publish a concept change.
    pub fn publish_concept(
        &self,
        change: ChangeKind,
        payload: Value,
        source_version: Option<i64>,
        correlation_id: Option<String>,
    ) -> Result<SyncEvent> {
        let event_type = match change {
            ChangeKind::Create => EventType::ConceptCreated,
            ChangeKind::Update => EventType::ConceptUpdated,
            ChangeKind::Delete => EventType::ConceptDeleted,
        };
        self.publish(event_type, None, payload, source_version, correlation_id)
    }

    /// Publish a learning path change.
    pub fn publish_learning_path(
        &self,
        change: ChangeKind,
        payload: Value,
        source_version: Option<i64>,
        correlation_id: Option<String>,
    ) -> Result<SyncEvent> {
        let event_type = match change {
            ChangeKind::Create => EventType::LearningPathCreated,
            ChangeKind::Update => EventType::LearningPathUpdated,
            ChangeKind::Delete => EventType::LearningPathDeleted,
        };
        self.publish(event_type, None, payload, source_version, correlation_id)
    }

    /// Publish a relationship change. Relationships only support create and
    /// delete.
    pub fn publish_relationship(
        &self,
        change: ChangeKind,
        payload: Value,
        source_version: Option<i64>,
        correlation_id: Option<String>,
    ) -> Result<SyncEvent> {
        let event_type = match change {
            ChangeKind::Create => EventType::RelationshipCreated,
            ChangeKind::Delete => EventType::RelationshipDeleted,
            ChangeKind::Update => {
                return Err(SyncError::MalformedEvent(
                    "relationships have no update events".into(),
                ))
            }
        };
        self.publish(event_type, None, payload, source_version, correlation_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Retry
    // ─────────────────────────────────────────────────────────────────────

    /// Republish in-flight rows that still have retry budget.
    ///
    /// Rows whose jittered backoff window has not elapsed since their last
    /// attempt are deferred to a later pass. Each republish increments the
    /// row's retry count; per-row failures are recorded and do not stop
    /// the pass.
    pub fn retry_pending_events(&self, limit: i64) -> Result<RetrySummary> {
        let rows = self.store.retryable_events(limit)?;
        let mut summary = RetrySummary {
            scanned: rows.len(),
            ..RetrySummary::default()
        };
        let now = Utc::now();

        for row in rows {
            if !self.due_for_retry(&row.updated_at, row.retry_count, now) {
                summary.deferred += 1;
                continue;
            }
            let event = match row.to_event() {
                Ok(event) => event,
                Err(err) => {
                    warn!(event_id = %row.id, error = %err, "unreplayable outbox row");
                    summary.failed += 1;
                    continue;
                }
            };
            let attempt = self.store.bump_retry(&row.id)?;
            if self.publish_event(&event)? {
                debug!(event_id = %row.id, attempt, "republished");
                summary.republished += 1;
            } else {
                summary.failed += 1;
            }
        }

        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                republished = summary.republished,
                deferred = summary.deferred,
                failed = summary.failed,
                "retry pass complete"
            );
        }
        Ok(summary)
    }

    /// Whether the backoff window since the last attempt has elapsed.
    ///
    /// A first attempt (`retry_count == 0`) is always due; later attempts
    /// wait out a jittered exponential delay keyed on the attempt number.
    fn due_for_retry(&self, last_touched: &str, retry_count: u32, now: DateTime<Utc>) -> bool {
        if retry_count == 0 {
            return true;
        }
        let Ok(touched) = DateTime::parse_from_rfc3339(last_touched) else {
            return true;
        };
        let delay_ms = self.config.retry.jittered_delay(retry_count - 1, rand::random());
        let due_at = touched.with_timezone(&Utc)
            + Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX));
        now >= due_at
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_broker::SqliteBroker;
    use atlas_core::EventLogStatus;
    use atlas_store::{new_in_memory, run_migrations, ConnectionConfig};
    use serde_json::json;

    fn setup() -> (Arc<SyncStore>, Arc<SqliteBroker>, Publisher) {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            let _ = run_migrations(&conn).unwrap();
        }
        let store = Arc::new(SyncStore::new(pool.clone()));
        let broker = Arc::new(SqliteBroker::new(pool).unwrap());
        broker
            .ensure_stream("atlas:sync:events", "graph-sync")
            .unwrap();
        let publisher = Publisher::new(store.clone(), broker.clone(), PublisherConfig::default());
        (store, broker, publisher)
    }

    #[test]
    fn create_event_writes_pending_row() {
        let (store, _broker, publisher) = setup();
        let event = publisher
            .create_event(
                EventType::ConceptCreated,
                None,
                json!({"concept_id": "c1", "name": "Recursion"}),
                Some(1),
                None,
            )
            .unwrap();

        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.status, "PENDING");
        assert_eq!(row.max_retries, 3);
    }

    #[test]
    fn source_version_defaults_to_now() {
        let (_store, _broker, publisher) = setup();
        let before = Utc::now().timestamp();
        let event = publisher
            .create_event(
                EventType::ConceptCreated,
                Some("c1".into()),
                json!({}),
                None,
                None,
            )
            .unwrap();
        assert!(event.source_version >= before);
    }

    #[test]
    fn publish_event_marks_published() {
        let (store, broker, publisher) = setup();
        let event = publisher
            .create_event(
                EventType::ConceptCreated,
                None,
                json!({"concept_id": "c1"}),
                Some(1),
                None,
            )
            .unwrap();

        assert!(publisher.publish_event(&event).unwrap());

        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.status, "PUBLISHED");
        assert!(row.broker_message_id.is_some());
        assert_eq!(broker.stream_len("atlas:sync:events").unwrap(), 1);
    }

    #[test]
    fn published_body_parses_back() {
        let (_store, broker, publisher) = setup();
        let event = publisher
            .publish(
                EventType::LearningPathCreated,
                None,
                json!({"path_id": "p1", "name": "Intro"}),
                Some(7),
                None,
            )
            .unwrap();

        let batch = broker
            .read_group("atlas:sync:events", "graph-sync", "c1", 10, 0)
            .unwrap();
        assert_eq!(batch.len(), 1);
        let wire = SyncEvent::from_json(&batch[0].body).unwrap();
        assert_eq!(wire, event);
    }

    #[test]
    fn entity_wrappers_pick_types() {
        let (_store, _broker, publisher) = setup();
        let event = publisher
            .publish_concept(ChangeKind::Delete, json!({"concept_id": "c1"}), Some(1), None)
            .unwrap();
        assert_eq!(event.event_type, EventType::ConceptDeleted);

        let event = publisher
            .publish_relationship(
                ChangeKind::Create,
                json!({"source_id": "c1", "target_id": "c2", "relationship_type": "PREREQUISITE"}),
                Some(1),
                None,
            )
            .unwrap();
        assert_eq!(event.event_type, EventType::RelationshipCreated);
        assert_eq!(event.entity_id, "c1:PREREQUISITE:c2");
    }

    #[test]
    fn relationship_update_rejected() {
        let (_store, _broker, publisher) = setup();
        let err = publisher
            .publish_relationship(ChangeKind::Update, json!({}), Some(1), None)
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent(_)));
    }

    #[test]
    fn retry_pending_republishes() {
        let (store, broker, publisher) = setup();
        // create_event without publish leaves the row PENDING.
        let event = publisher
            .create_event(
                EventType::ConceptCreated,
                None,
                json!({"concept_id": "c1"}),
                Some(1),
                None,
            )
            .unwrap();

        let summary = publisher.retry_pending_events(10).unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.republished, 1);
        assert_eq!(summary.failed, 0);

        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.status, "PUBLISHED");
        assert_eq!(row.retry_count, 1);
        assert_eq!(broker.stream_len("atlas:sync:events").unwrap(), 1);
    }

    #[test]
    fn retry_defers_rows_inside_backoff_window() {
        let (store, _broker, publisher) = setup();
        let event = publisher
            .create_event(
                EventType::ConceptCreated,
                None,
                json!({"concept_id": "c1"}),
                Some(1),
                None,
            )
            .unwrap();
        // One prior attempt just happened: the backoff window is still open.
        let _ = store.bump_retry(&event.event_id).unwrap();

        let summary = publisher.retry_pending_events(10).unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.republished, 0);

        let row = store.get_event(&event.event_id).unwrap().unwrap();
        assert_eq!(row.status, "PENDING");
        assert_eq!(row.retry_count, 1);
    }

    #[test]
    fn due_for_retry_honours_backoff() {
        let (_store, _broker, publisher) = setup();
        let now = Utc::now();
        let recent = now.to_rfc3339();
        let old = (now - Duration::hours(1)).to_rfc3339();

        // First attempt is always due.
        assert!(publisher.due_for_retry(&recent, 0, now));
        // A fresh failure waits out its window…
        assert!(!publisher.due_for_retry(&recent, 1, now));
        // …but an hour-old one is long past any configured delay.
        assert!(publisher.due_for_retry(&old, 1, now));
        // An unparseable timestamp never blocks a retry.
        assert!(publisher.due_for_retry("garbage", 1, now));
    }

    #[test]
    fn retry_skips_terminal_rows() {
        let (store, _broker, publisher) = setup();
        let event = publisher
            .publish(
                EventType::ConceptCreated,
                None,
                json!({"concept_id": "c1"}),
                Some(1),
                None,
            )
            .unwrap();
        store.mark_processing(&event.event_id).unwrap();
        store.mark_completed(&event).unwrap();

        let summary = publisher.retry_pending_events(10).unwrap();
        assert_eq!(summary.scanned, 0);
        assert_eq!(
            store.count_events(EventLogStatus::Completed).unwrap(),
            1
        );
    }
}
