//! Ordered stage driver.
//!
//! Stages run in the order they were added. Each stage invocation is atomic
//! with respect to the worklist: if the stage returns an error, panics, or
//! drops or duplicates a message, the worklist is restored to what it was
//! before the stage ran, the failure is logged, and the next stage proceeds.
//!
//! Messages are told apart by `baseUrl`, `relPath`, `parts` and `ack_id`;
//! stages move messages and annotate them but do not rewrite those fields.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error};

use super::callback::{FlowCallback, Phase, dispatch};
use super::worklist::Worklist;

/// Summary of one phase run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseReport {
    /// Stages invoked.
    pub invoked: usize,
    /// Stages whose effects were rolled back.
    pub failed: usize,
}

/// The configured sequence of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn FlowCallback>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Sorted identities of every message in `worklist`.
fn identities(worklist: &Worklist) -> Vec<(&str, &str, Option<&str>, Option<String>)> {
    let mut ids: Vec<_> = worklist
        .iter()
        .map(|m| {
            (
                m.base_url.as_str(),
                m.rel_path.as_str(),
                m.parts.as_deref(),
                m.ack_id.as_ref().map(|id| id.to_string()),
            )
        })
        .collect();
    ids.sort_unstable();
    ids
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline { stages: Vec::new() }
    }

    /// Appends a stage; builder form.
    pub fn with_stage(mut self, stage: impl FlowCallback + 'static) -> Self {
        self.push(Box::new(stage));
        self
    }

    pub fn push(&mut self, stage: Box<dyn FlowCallback>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs a lifecycle phase (`on_start`, `on_housekeeping`, `on_stop`).
    pub fn run_lifecycle(&mut self, phase: Phase) -> PhaseReport {
        debug_assert!(!phase.takes_worklist());
        let mut scratch = Worklist::default();
        self.run(phase, &mut scratch)
    }

    /// Runs `phase` over every stage.
    pub fn run(&mut self, phase: Phase, worklist: &mut Worklist) -> PhaseReport {
        let mut report = PhaseReport::default();

        for stage in &mut self.stages {
            report.invoked += 1;
            let name = stage.name().to_string();
            let before = worklist.clone();
            let expected = worklist.len();

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                dispatch(stage.as_mut(), phase, worklist)
            }));

            let failure = match outcome {
                Ok(Ok(())) if worklist.len() != expected => Some(format!(
                    "stage changed message count from {} to {}",
                    expected,
                    worklist.len()
                )),
                Ok(Ok(())) if identities(worklist) != identities(&before) => {
                    Some("stage replaced messages with others".to_string())
                }
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(format!("stage panicked: {}", panic_text(payload.as_ref()))),
            };

            match failure {
                None => debug!(stage = %name, %phase, "stage completed"),
                Some(reason) => {
                    error!(stage = %name, %phase, %reason, "stage failed, restoring worklist");
                    *worklist = before;
                    report.failed += 1;
                }
            }
        }

        report
    }
}
