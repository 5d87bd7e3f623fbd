//! `SQLite`-backed implementations of the engine's store boundaries.
//!
//! [`SqliteSourceStore`] reads the application's relational tables;
//! [`SqliteGraphStore`] maintains the node/edge tables of the materialized
//! view. Both live behind the engine's traits — swapping in a different
//! database product touches only this module.

pub mod graph;
pub mod source;

pub use graph::SqliteGraphStore;
pub use source::SqliteSourceStore;
