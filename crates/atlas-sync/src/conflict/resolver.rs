//! Conflict resolution.
//!
//! Default strategy by conflict type: version mismatch resolves by recency
//! (ties to the source), data divergence by merge — which degrades to
//! last-write-wins, as no field-level merge exists at record granularity —
//! and everything else goes to a human.
//!
//! The source store is authoritative: a resolution that would push graph
//! data back into the source (`TARGET_WINS`) is refused with a distinct
//! failure and the conflict is parked for manual review.

use std::sync::Arc;

use atlas_core::{default_strategy, EntityType, ResolutionStatus, ResolutionStrategy};
use atlas_store::row_types::ConflictRow;
use atlas_store::SyncStore;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};
use crate::traits::{GraphStore, NodeRef, SourceStore};

/// Outcome of one resolution attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Data converged; the conflict record is RESOLVED.
    Resolved,
    /// The strategy could not be applied; the conflict is parked in
    /// MANUAL_REVIEW with the reason recorded.
    Failed {
        /// Why the resolution failed.
        reason: String,
    },
    /// Explicitly routed to a human; no data touched.
    ManualReview,
    /// Acknowledged and left as-is; no data touched.
    Ignored,
}

/// Tally across a batch of resolutions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolutionTally {
    /// Conflicts whose data converged.
    pub resolved: usize,
    /// Failed resolution attempts (including refused reverse sync).
    pub failed: usize,
    /// Conflicts parked for a human.
    pub manual_review: usize,
    /// Conflicts acknowledged and ignored.
    pub ignored: usize,
}

/// Applies resolution strategies to recorded conflicts.
pub struct ConflictResolver {
    source: Arc<dyn SourceStore>,
    graph: Arc<dyn GraphStore>,
    store: Arc<SyncStore>,
}

impl ConflictResolver {
    /// Create a resolver over the injected stores.
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

    /// Resolve one conflict with the given (or default) strategy.
    pub fn resolve(
        &self,
        conflict: &ConflictRow,
        strategy: Option<ResolutionStrategy>,
        resolved_by: &str,
    ) -> Result<ResolutionOutcome> {
        let conflict_type = conflict
            .conflict_type
            .parse()
            .map_err(|_| SyncError::MalformedEvent(format!("bad conflict type on {}", conflict.id)))?;
        let entity_type: EntityType = conflict
            .entity_type
            .parse()
            .map_err(|_| SyncError::MalformedEvent(format!("bad entity type on {}", conflict.id)))?;

        let mut strategy = strategy.unwrap_or_else(|| default_strategy(conflict_type));
        if strategy == ResolutionStrategy::Merge {
            // No field-level merge at record granularity; newest record wins.
            debug!(conflict_id = %conflict.id, "merge degrades to last-write-wins");
            strategy = ResolutionStrategy::LastWriteWins;
        }

        match strategy {
            ResolutionStrategy::LastWriteWins => {
                let source_newer_or_tied =
                    conflict.source_version.unwrap_or(0) >= conflict.target_version.unwrap_or(0);
                if source_newer_or_tied {
                    self.source_wins(conflict, entity_type, strategy, resolved_by)
                } else {
                    self.refuse_reverse_sync(conflict, strategy, resolved_by)
                }
            }
            ResolutionStrategy::SourceWins => {
                self.source_wins(conflict, entity_type, strategy, resolved_by)
            }
            ResolutionStrategy::TargetWins => {
                self.refuse_reverse_sync(conflict, strategy, resolved_by)
            }
            ResolutionStrategy::Manual => {
                let _ = self.store.set_conflict_resolution(
                    &conflict.id,
                    ResolutionStatus::ManualReview,
                    Some(strategy),
                    resolved_by,
                )?;
                let _ = self.store.clear_conflict_flag(entity_type, &conflict.entity_id)?;
                Ok(ResolutionOutcome::ManualReview)
            }
            ResolutionStrategy::Ignore => {
                let _ = self.store.set_conflict_resolution(
                    &conflict.id,
                    ResolutionStatus::Ignored,
                    Some(strategy),
                    resolved_by,
                )?;
                Ok(ResolutionOutcome::Ignored)
            }
            ResolutionStrategy::Merge => unreachable!("degraded above"),
        }
    }

    /// Apply one strategy across a batch, tallying outcomes.
    pub fn auto_resolve(
        &self,
        conflicts: &[ConflictRow],
        strategy: Option<ResolutionStrategy>,
        resolved_by: &str,
    ) -> ResolutionTally {
        let mut tally = ResolutionTally::default();
        for conflict in conflicts {
            match self.resolve(conflict, strategy, resolved_by) {
                Ok(ResolutionOutcome::Resolved) => tally.resolved += 1,
                Ok(ResolutionOutcome::Failed { reason }) => {
                    warn!(conflict_id = %conflict.id, %reason, "resolution failed");
                    tally.failed += 1;
                }
                Ok(ResolutionOutcome::ManualReview) => tally.manual_review += 1,
                Ok(ResolutionOutcome::Ignored) => tally.ignored += 1,
                Err(err) => {
                    warn!(conflict_id = %conflict.id, error = %err, "resolution errored");
                    tally.failed += 1;
                }
            }
        }
        tally
    }

    // ─────────────────────────────────────────────────────────────────────
    // Strategies
    // ─────────────────────────────────────────────────────────────────────

    /// Push the source's data into the graph and close the conflict.
    fn source_wins(
        &self,
        conflict: &ConflictRow,
        entity_type: EntityType,
        strategy: ResolutionStrategy,
        resolved_by: &str,
    ) -> Result<ResolutionOutcome> {
        let Some(node) = NodeRef::for_entity(entity_type, &conflict.entity_id) else {
            return Ok(ResolutionOutcome::Failed {
                reason: format!("{entity_type} is not a node entity"),
            });
        };

        // Prefer a fresh read; fall back to the snapshot captured at
        // detection time if the row has since vanished.
        let (payload, version) =
            match self.source.get_entity(entity_type, &conflict.entity_id)? {
                Some(entity) => {
                    let version = entity.version();
                    (entity.payload, version)
                }
                None => (
                    serde_json::from_str(&conflict.source_snapshot).map_err(|e| {
                        SyncError::MalformedEvent(format!(
                            "bad source snapshot on {}: {e}",
                            conflict.id
                        ))
                    })?,
                    conflict.source_version.unwrap_or(0),
                ),
            };

        let Value::Object(fields) = payload else {
            return Ok(ResolutionOutcome::Failed {
                reason: "source snapshot is not an object".into(),
            });
        };
        let mut props: Map<String, Value> = fields;
        let _ = props.insert("source_version".into(), version.into());
        let _ = props.insert(
            "synced_at".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        self.graph.upsert_node(&node, &Value::Object(props))?;

        let _ = self.store.set_conflict_resolution(
            &conflict.id,
            ResolutionStatus::Resolved,
            Some(strategy),
            resolved_by,
        )?;
        let _ = self.store.clear_conflict_flag(entity_type, &conflict.entity_id)?;
        self.store
            .mark_entity_synced(entity_type, &conflict.entity_id, version)?;

        info!(
            conflict_id = %conflict.id,
            entity_id = %conflict.entity_id,
            version,
            "conflict resolved, source pushed to graph"
        );
        Ok(ResolutionOutcome::Resolved)
    }

    /// Refuse to push graph data back into the source store. The conflict
    /// is parked for a human and the failure is surfaced distinctly from
    /// processing errors.
    fn refuse_reverse_sync(
        &self,
        conflict: &ConflictRow,
        strategy: ResolutionStrategy,
        resolved_by: &str,
    ) -> Result<ResolutionOutcome> {
        let reason = SyncError::ReverseSyncUnsupported.to_string();
        warn!(conflict_id = %conflict.id, %reason, "parking for manual review");
        let _ = self.store.set_conflict_resolution(
            &conflict.id,
            ResolutionStatus::ManualReview,
            Some(strategy),
            resolved_by,
        )?;
        Ok(ResolutionOutcome::Failed { reason })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
