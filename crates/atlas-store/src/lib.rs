//! # atlas-store
//!
//! Durable audit and status store for the Atlas sync engine, backed by
//! `SQLite`:
//!
//! - **Event log**: the outbox — every published change as a permanent,
//!   never-deleted audit row with a compare-and-swap `row_version`
//! - **Sync status**: one row per entity tracking versions, flags, and the
//!   last error
//! - **Conflicts**: append-only record per detection with both snapshots
//! - **Reconciliation runs**: one row per job execution with counters
//! - **Leases**: TTL claims guarding the single-instance reconciliation loop
//!
//! Layout follows the repository pattern: [`connection`] provides an `r2d2`
//! pool with WAL pragmas, [`migrations`] runs embedded version-tracked SQL,
//! [`repositories`] are stateless structs over `&Connection`, and
//! [`store::SyncStore`] composes them into transactional operations.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod migrations;
pub mod repositories;
pub mod row_types;
pub mod store;

pub use connection::{new_file, new_in_memory, ConnectionConfig, ConnectionPool, PooledConnection};
pub use errors::{Result, StoreError};
pub use migrations::run_migrations;
pub use store::{FailureDisposition, NewConflict, SyncStore};
