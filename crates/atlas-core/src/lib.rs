//! # atlas-core
//!
//! Shared domain types for the Atlas graph synchronization engine.
//!
//! - **Event model**: [`SyncEvent`] and the closed [`EventType`] /
//!   [`EntityType`] / [`ChangeKind`] enums that drive consumer dispatch
//! - **Status machines**: [`EventLogStatus`] with explicit transition rules
//! - **Conflict vocabulary**: [`ConflictType`], [`ResolutionStrategy`],
//!   [`ResolutionStatus`]
//! - **Reconciliation vocabulary**: [`RunType`], [`RunStatus`], [`RunCounters`]
//! - **Retry math**: [`RetryConfig`] and backoff calculation
//! - **IDs**: prefixed UUID v7 generators

#![deny(unsafe_code)]

pub mod conflict;
pub mod event;
pub mod ids;
pub mod retry;
pub mod run;
pub mod status;

pub use conflict::{default_strategy, ConflictType, ResolutionStatus, ResolutionStrategy};
pub use event::{ChangeKind, EntityType, EventError, EventType, SyncEvent, ALL_EVENT_TYPES};
pub use ids::{conflict_id, correlation_id, event_id, run_id};
pub use retry::RetryConfig;
pub use run::{RunCounters, RunStatus, RunType};
pub use status::EventLogStatus;
