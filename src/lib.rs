//! Flowpump - the reliable-delivery core of a message pump.
//!
//! Announcements flow through a pipeline of stages that sort each message of
//! a batch into one of four buckets. Transient failures are persisted to an
//! append-only retry queue and re-offered after housekeeping; a time-windowed
//! dedup cache stops the same item being processed twice.

pub mod clock;
pub mod config;
pub mod flow;
pub mod logging;
pub mod nodupe;
pub mod persistence;
pub mod retry;
pub mod types;
pub mod worker;

#[cfg(test)]
mod test_utils;
