//! The [`Broker`] trait — the engine's view of the message transport.
//!
//! Semantics mirror a log-structured broker with consumer groups: global
//! append order is preserved in the stream, each message is delivered to
//! exactly one member of a group, and acknowledged messages leave the
//! group's pending set. Delivery order *across* consumers is not
//! guaranteed — the consumer's staleness check makes application
//! order-tolerant.

use crate::errors::Result;

/// A message read from the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMessage {
    /// Broker-assigned message ID, monotonically increasing per stream.
    pub id: String,
    /// Opaque message body (a serialized sync event).
    pub body: String,
}

/// Append-only log with consumer-group delivery.
pub trait Broker: Send + Sync {
    /// Idempotently create the stream and a consumer group on it.
    ///
    /// A freshly created group starts at the beginning of the stream, so
    /// events published before any consumer booted are still delivered.
    fn ensure_stream(&self, stream: &str, group: &str) -> Result<()>;

    /// Append a message, trimming the stream to approximately `max_len`
    /// entries. Returns the broker-assigned message ID.
    fn append(&self, stream: &str, body: &str, max_len: i64) -> Result<String>;

    /// Read up to `count` undelivered messages for `consumer` within
    /// `group`, blocking up to `block_ms` milliseconds when none are
    /// available. Claimed messages go to the group's pending set.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>>;

    /// Acknowledge a delivered message, removing it from the pending set.
    /// Returns `false` if the message was not pending.
    fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<bool>;
}
