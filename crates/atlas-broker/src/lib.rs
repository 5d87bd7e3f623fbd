//! # atlas-broker
//!
//! The message-broker boundary of the Atlas sync engine: an append-only
//! stream with consumer-group delivery.
//!
//! The [`Broker`] trait is the contract the engine consumes — the broker
//! product behind it is deliberately replaceable. [`SqliteBroker`] is the
//! provided implementation: a durable stream in the same embedded database
//! family as the audit store, safe for multiple consumer processes via WAL.

#![deny(unsafe_code)]

pub mod broker;
pub mod errors;
pub mod sqlite;

pub use broker::{Broker, StreamMessage};
pub use errors::{BrokerError, Result};
pub use sqlite::SqliteBroker;
