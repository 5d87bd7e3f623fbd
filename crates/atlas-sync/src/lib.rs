//! # atlas-sync
//!
//! The synchronization engine: keeps a graph-shaped materialized view
//! eventually consistent with a relational store of record.
//!
//! - [`Publisher`] — the outbox writer: durable event rows plus stream
//!   appends, with republish on retry
//! - [`Consumer`] — consumer-group reader applying idempotent upserts and
//!   deletes to the graph, with a version-based staleness gate
//! - [`ConflictDetector`] / [`ConflictResolver`] — detection of independent
//!   two-sided modification and strategy-based resolution
//! - [`Reconciler`] — the background job re-driving stuck events, healing
//!   drift, and sweeping unresolved conflicts
//! - [`SourceStore`] / [`GraphStore`] — the boundaries to the two stores;
//!   implementations are injected, never global

#![deny(unsafe_code)]

pub mod conflict;
pub mod consumer;
pub mod errors;
pub mod publisher;
pub mod reconciler;
pub mod testutil;
pub mod traits;

pub use conflict::detector::{ConflictDetector, ConflictInfo};
pub use conflict::resolver::{ConflictResolver, ResolutionOutcome, ResolutionTally};
pub use consumer::{ApplyOutcome, Consumer, ConsumerConfig};
pub use errors::{Result, SyncError};
pub use publisher::{Publisher, PublisherConfig, RetrySummary};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use traits::{EdgeSpec, GraphStore, NodeRef, SourceEntity, SourceStore};
