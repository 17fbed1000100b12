//! Flat-file persistence primitives shared by the retry queue and the dedup
//! cache.
//!
//! # Write Discipline
//!
//! - Appends followed by an explicit flush (the hot path)
//! - Whole-file replacement via write-to-temp-then-rename (consolidation)
//!
//! Records are never modified in place. A crash can therefore leave at most a
//! truncated last line, which [`LineReader`] skips as corrupt and
//! [`open_append`] terminates before appending.

pub mod fsync;
pub mod lines;

pub use fsync::{remove_file_best_effort, replace_file, sync_dir, sync_file, sync_parent_dir};
pub use lines::{LineReader, MAX_CONSECUTIVE_CORRUPT_LINES, open_append};
