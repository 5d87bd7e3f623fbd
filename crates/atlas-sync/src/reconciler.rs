//! The background reconciliation job.
//!
//! Each run creates an audit row, executes three fault-isolated phases, and
//! finalizes even when a phase errors:
//!
//! 1. **Stuck-event sweep** — in-flight rows untouched past the stale
//!    threshold get their retry count reset and are republished
//! 2. **Drift sweep** — recently modified source entities missing or stale
//!    in the graph get a repair UPDATE event (when auto-repair is on)
//! 3. **Conflict sweep** — flagged entities are re-checked; still-divergent
//!    ones get a conflict record, converged ones get their flag cleared
//!
//! The continuous loop takes a TTL lease before each cycle, so an
//! accidentally started second instance degrades to a no-op instead of
//! double-driving repairs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use atlas_core::{EntityType, EventType, RunCounters, RunStatus, RunType};
use atlas_store::row_types::RunRow;
use atlas_store::{NewConflict, SyncStore};
use chrono::Duration;
use tracing::{debug, error, info, warn};

use crate::conflict::detector::ConflictDetector;
use crate::errors::Result;
use crate::publisher::Publisher;
use crate::traits::{GraphStore, NodeRef, SourceStore};

const LEASE_NAME: &str = "reconciliation";

/// Entity families the drift sweep walks.
const DRIFT_ENTITY_TYPES: &[EntityType] = &[EntityType::Concept, EntityType::LearningPath];

/// Reconciliation job tuning.
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Sleep between runs of the continuous loop, in seconds.
    pub interval_secs: u64,
    /// Entities per type examined by the drift sweep, and rows per sweep.
    pub batch_size: i64,
    /// Age after which an in-flight event counts as stuck, in seconds.
    pub stale_threshold_secs: i64,
    /// Whether the conflict sweep runs.
    pub conflict_detection: bool,
    /// Whether the drift sweep publishes repair events.
    pub auto_repair: bool,
    /// Lease holder identity for this instance.
    pub holder: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            batch_size: 100,
            stale_threshold_secs: 600,
            conflict_detection: true,
            auto_repair: true,
            holder: format!("reconciler-{}", std::process::id()),
        }
    }
}

/// Heals drift and re-drives stuck events.
pub struct Reconciler {
    store: Arc<SyncStore>,
    publisher: Publisher,
    detector: ConflictDetector,
    source: Arc<dyn SourceStore>,
    graph: Arc<dyn GraphStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a reconciler over the injected components.
    pub fn new(
        store: Arc<SyncStore>,
        publisher: Publisher,
        detector: ConflictDetector,
        source: Arc<dyn SourceStore>,
        graph: Arc<dyn GraphStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            detector,
            source,
            graph,
            config,
        }
    }

    /// Continuous loop: lease-guarded run, then sleep, until `shutdown`.
    pub fn run_loop(&self, shutdown: &AtomicBool) {
        let ttl_secs = i64::try_from(self.config.interval_secs.saturating_mul(2))
            .unwrap_or(i64::MAX)
            .max(30);
        let ttl = Duration::seconds(ttl_secs);
        info!(
            holder = %self.config.holder,
            interval_secs = self.config.interval_secs,
            "reconciliation loop started"
        );

        while !shutdown.load(Ordering::Relaxed) {
            match self.store.acquire_lease(LEASE_NAME, &self.config.holder, ttl) {
                Ok(true) => {
                    if let Err(err) = self.run_once(RunType::Scheduled) {
                        error!(error = %err, "reconciliation run errored");
                    }
                }
                Ok(false) => {
                    info!(holder = %self.config.holder, "lease held elsewhere, skipping cycle");
                }
                Err(err) => error!(error = %err, "lease acquisition failed"),
            }
            self.sleep_interval(shutdown);
        }

        if let Err(err) = self.store.release_lease(LEASE_NAME, &self.config.holder) {
            warn!(error = %err, "lease release failed");
        }
        info!(holder = %self.config.holder, "reconciliation loop stopped");
    }

    /// One full run: audit row, three phases, finalize.
    ///
    /// Phase errors are captured into the run row (status FAILED), never
    /// propagated past the run boundary; the remaining phases still execute.
    pub fn run_once(&self, run_type: RunType) -> Result<RunRow> {
        let run = self.store.begin_run(run_type, self.config.batch_size)?;
        info!(run_id = %run.id, run_type = %run_type, "reconciliation run started");

        let mut counters = RunCounters::default();
        let mut first_error: Option<String> = None;

        let phases: [(&str, Result<RunCounters>); 3] = [
            ("stuck_events", self.sweep_stuck_events()),
            ("drift", self.sweep_drift(&run.id)),
            ("conflicts", self.sweep_conflicts()),
        ];
        for (phase, result) in phases {
            match result {
                Ok(phase_counters) => counters.absorb(phase_counters),
                Err(err) => {
                    error!(run_id = %run.id, phase, error = %err, "phase failed");
                    let _ = first_error.get_or_insert(format!("{phase}: {err}"));
                }
            }
        }

        let status = if first_error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let row = self
            .store
            .finish_run(&run.id, status, counters, first_error.as_deref())?;

        info!(
            run_id = %row.id,
            status = %row.status,
            entities_checked = counters.entities_checked,
            inconsistencies_found = counters.inconsistencies_found,
            inconsistencies_repaired = counters.inconsistencies_repaired,
            conflicts_detected = counters.conflicts_detected,
            conflicts_resolved = counters.conflicts_resolved,
            failed_entities = counters.failed_entities,
            duration_ms = row.duration_ms,
            "reconciliation run finished"
        );
        Ok(row)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Phase 1: stuck events
    // ─────────────────────────────────────────────────────────────────────

    fn sweep_stuck_events(&self) -> Result<RunCounters> {
        let rows = self.store.stale_events(
            Duration::seconds(self.config.stale_threshold_secs),
            self.config.batch_size,
        )?;
        let mut counters = RunCounters::default();

        for row in rows {
            counters.inconsistencies_found += 1;
            let republished = (|| {
                self.store.reset_retries(&row.id)?;
                let event = row.to_event()?;
                self.publisher.publish_event(&event)
            })();
            match republished {
                Ok(true) => {
                    debug!(event_id = %row.id, "stuck event republished");
                    counters.inconsistencies_repaired += 1;
                }
                Ok(false) => counters.failed_entities += 1,
                Err(err) => {
                    warn!(event_id = %row.id, error = %err, "stuck event republish failed");
                    counters.failed_entities += 1;
                }
            }
        }
        Ok(counters)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Phase 2: drift
    // ─────────────────────────────────────────────────────────────────────

    fn sweep_drift(&self, run_id: &str) -> Result<RunCounters> {
        let correlation_id = format!("reconciliation-{run_id}");
        let mut counters = RunCounters::default();

        for &entity_type in DRIFT_ENTITY_TYPES {
            let entities = self.source.list_recent(entity_type, self.config.batch_size)?;
            for entity in entities {
                counters.entities_checked += 1;

                let node = NodeRef::for_entity(entity_type, &entity.entity_id)
                    .expect("drift sweep walks node entity types only");
                let stored = match self.graph.node_version(&node) {
                    Ok(version) => version,
                    Err(err) => {
                        warn!(entity_id = %entity.entity_id, error = %err, "drift check failed");
                        counters.failed_entities += 1;
                        continue;
                    }
                };

                let source_version = entity.version();
                if stored.is_some_and(|v| v >= source_version) {
                    continue;
                }
                counters.inconsistencies_found += 1;

                if !self.config.auto_repair {
                    debug!(
                        entity_type = %entity_type,
                        entity_id = %entity.entity_id,
                        ?stored,
                        source_version,
                        "drift found (auto-repair disabled)"
                    );
                    continue;
                }

                let event_type = EventType::update_for(entity_type)
                    .expect("drift sweep walks node entity types only");
                let repaired = (|| {
                    let event = self.publisher.create_event(
                        event_type,
                        Some(entity.entity_id.clone()),
                        entity.payload.clone(),
                        Some(source_version),
                        Some(correlation_id.clone()),
                    )?;
                    self.publisher.publish_event(&event)
                })();
                match repaired {
                    Ok(true) => {
                        info!(
                            entity_type = %entity_type,
                            entity_id = %entity.entity_id,
                            source_version,
                            "repair event published"
                        );
                        counters.inconsistencies_repaired += 1;
                    }
                    Ok(false) => counters.failed_entities += 1,
                    Err(err) => {
                        warn!(entity_id = %entity.entity_id, error = %err, "repair publish failed");
                        counters.failed_entities += 1;
                    }
                }
            }
        }
        Ok(counters)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Phase 3: conflicts
    // ─────────────────────────────────────────────────────────────────────

    fn sweep_conflicts(&self) -> Result<RunCounters> {
        let mut counters = RunCounters::default();
        if !self.config.conflict_detection {
            return Ok(counters);
        }

        let flagged = self.store.conflicted_entities(self.config.batch_size)?;
        for status in flagged {
            let Ok(entity_type) = status.entity_type.parse::<EntityType>() else {
                warn!(entity_type = %status.entity_type, "unparseable entity type on status row");
                counters.failed_entities += 1;
                continue;
            };

            match self.detector.detect(entity_type, &status.entity_id) {
                Ok(Some(info)) => {
                    counters.conflicts_detected += 1;
                    // Refresh only when no record is already open — the
                    // conflict table is append-only per detection.
                    let open = self
                        .store
                        .open_conflict_for(entity_type, &status.entity_id)?;
                    if open.is_none() {
                        let _ = self.store.record_conflict(&NewConflict {
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
                    }
                }
                Ok(None) => {
                    if self
                        .store
                        .clear_conflict_flag(entity_type, &status.entity_id)?
                    {
                        debug!(entity_id = %status.entity_id, "conflict flag cleared");
                        counters.conflicts_resolved += 1;
                    }
                }
                Err(err) => {
                    warn!(entity_id = %status.entity_id, error = %err, "conflict re-check failed");
                    counters.failed_entities += 1;
                }
            }
        }
        Ok(counters)
    }

    /// Sleep for the configured interval, waking early on shutdown.
    fn sleep_interval(&self, shutdown: &AtomicBool) {
        let deadline =
            Instant::now() + std::time::Duration::from_secs(self.config.interval_secs);
        while Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(250));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
