//! Worker instance for batch processing.
//!
//! A [`FlowWorker`] owns one instance's pipeline and retry queue. Batches are
//! processed serially, and housekeeping runs between batches on a
//! wall-clock interval, never concurrently with message processing.
//!
//! # Module Structure
//!
//! - `message`: Worker message types for async communication
//! - `worker`: The batch loop, housekeeping schedule and async event loop

mod message;
#[allow(clippy::module_inception)]
mod worker;

#[cfg(test)]
mod tests;

pub use message::WorkerMessage;
pub use worker::{BatchOutcome, FlowWorker, Result, WorkerError, default_pipeline};
