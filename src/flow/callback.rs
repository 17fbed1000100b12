//! The plugin interface.
//!
//! A plugin implements [`FlowCallback`] and overrides the entry points for the
//! phases it cares about. Batch phases receive the [`Worklist`] and report
//! their decisions only by moving messages between buckets.

use std::fmt;
use std::io;

use thiserror::Error;

use super::worklist::Worklist;
use crate::nodupe::NoDupeError;
use crate::retry::DiskQueueError;
use crate::types::TimeError;

/// Errors a stage may report. The pipeline logs them and carries on.
#[derive(Debug, Error)]
pub enum StageError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed timestamp in a message.
    #[error("time error: {0}")]
    Time(#[from] TimeError),

    /// Dedup cache failure.
    #[error("nodupe error: {0}")]
    NoDupe(#[from] NoDupeError),

    /// Retry queue failure.
    #[error("retry queue error: {0}")]
    Queue(#[from] DiskQueueError),

    /// Anything else a plugin wants to report.
    #[error("{0}")]
    Failed(String),
}

/// Result type for stage entry points.
pub type Result<T> = std::result::Result<T, StageError>;

/// Pipeline phases, in the order a worker drives them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    OnStart,
    /// After the broker delivered a batch: filtering and deduplication.
    AfterAccept,
    /// The work itself: download, transform, send.
    Work,
    /// Post-processing and verification of completed messages.
    AfterWork,
    /// Periodic maintenance, unrelated to any batch.
    OnHousekeeping,
    OnStop,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::OnStart => "on_start",
            Phase::AfterAccept => "after_accept",
            Phase::Work => "work",
            Phase::AfterWork => "after_work",
            Phase::OnHousekeeping => "on_housekeeping",
            Phase::OnStop => "on_stop",
        }
    }

    /// Whether the phase operates on a batch of messages.
    pub fn takes_worklist(&self) -> bool {
        matches!(self, Phase::AfterAccept | Phase::Work | Phase::AfterWork)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline stage. Every entry point defaults to doing nothing.
///
/// Stages must not remove a message from all buckets, nor place one in two.
pub trait FlowCallback: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    fn after_accept(&mut self, _worklist: &mut Worklist) -> Result<()> {
        Ok(())
    }

    fn work(&mut self, _worklist: &mut Worklist) -> Result<()> {
        Ok(())
    }

    fn after_work(&mut self, _worklist: &mut Worklist) -> Result<()> {
        Ok(())
    }

    fn on_housekeeping(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Invokes the entry point of `stage` for `phase`.
///
/// Lifecycle phases ignore `worklist`.
pub(crate) fn dispatch(
    stage: &mut dyn FlowCallback,
    phase: Phase,
    worklist: &mut Worklist,
) -> Result<()> {
    match phase {
        Phase::OnStart => stage.on_start(),
        Phase::AfterAccept => stage.after_accept(worklist),
        Phase::Work => stage.work(worklist),
        Phase::AfterWork => stage.after_work(worklist),
        Phase::OnHousekeeping => stage.on_housekeeping(),
        Phase::OnStop => stage.on_stop(),
    }
}
