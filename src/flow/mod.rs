//! The worklist state machine and the stages that operate on it.

mod callback;
mod filters;
mod pipeline;
mod worklist;

pub use callback::{FlowCallback, Phase, Result, StageError};
pub use filters::{DEFAULT_SKIP_THRESHOLD, FileAge, SkipOld};
pub use pipeline::{Pipeline, PhaseReport};
pub use worklist::{Bucket, Worklist};
