//! Duplicate suppression over a sliding time window.
//!
//! [`NoDupe`] is a pipeline stage: `after_accept` rejects messages whose
//! dedup key and path were seen within `nodupe_ttl`, and `on_housekeeping`
//! compacts the backing cache file.

pub mod cache;

pub use cache::{DUPLICATE_REJECT, NoDupe, NoDupeError, Verdict, message_key};
