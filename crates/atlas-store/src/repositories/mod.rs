//! Repository implementations for audit store operations.
//!
//! Each repository is a stateless struct whose methods take a `&Connection`
//! parameter — every operation is a pure function from
//! (connection, input) → output. Transaction scope belongs to the caller.

pub mod conflict;
pub mod event_log;
pub mod lease;
pub mod run;
pub mod status;
