//! Persistent retry queue for messages that failed transiently.
//!
//! Writes are appends only; a periodic housekeeping cycle consolidates the
//! appended entries into the next generation of the queue file. See
//! [`DiskQueue`] for the file layout and crash-safety rules.

pub mod diskqueue;

pub use diskqueue::{DiskQueue, DiskQueueError, HousekeepingOutcome};
