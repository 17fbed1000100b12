//! Core domain types for the pump.
//!
//! Messages, their integrity values and the timestamp codec every TTL
//! computation relies on.

pub mod integrity;
pub mod message;
pub mod time;

pub use integrity::{Algorithm, Checksum, Integrity, IntegrityMethod, compute_file_integrity};
pub use message::{ACK_ID, Message, NodupeOverride, Report, known_report_text};
pub use time::{TimeError, timeflt_to_str, timestr_to_flt};
