//! Library surface of the Atlas sync daemon.
//!
//! Exposes the `SQLite` provider implementations of the engine's store
//! boundaries so integration tests (and embedders) can wire the engine
//! the same way the binary does.

#![deny(unsafe_code)]

pub mod providers;
