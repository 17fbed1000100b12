//! Worker message types for async communication.
//!
//! A transport task feeds the worker through a `tokio::sync::mpsc` channel;
//! the worker handles messages one at a time, so housekeeping never overlaps
//! a batch.

use crate::types::Message;

/// Messages that can be sent to a running worker.
#[derive(Debug)]
pub enum WorkerMessage {
    /// A batch of announcements delivered by the broker.
    Batch(Vec<Message>),

    /// Run a housekeeping cycle now, whatever the interval says.
    Housekeeping,

    /// Request a graceful shutdown.
    ///
    /// The worker finishes the current batch, runs the `on_stop` stages and
    /// closes its retry queue.
    Shutdown,
}
