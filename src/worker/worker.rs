//! One worker instance: batch loop, retry queue and housekeeping schedule.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::SharedClock;
use crate::config::Options;
use crate::flow::{FileAge, Phase, PhaseReport, Pipeline, SkipOld, Worklist};
use crate::nodupe::NoDupe;
use crate::retry::{DiskQueue, DiskQueueError, HousekeepingOutcome};
use crate::types::Message;

use super::message::WorkerMessage;

/// Errors that can occur during worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Retry queue creation or append failed.
    #[error("retry queue error: {0}")]
    Queue(#[from] DiskQueueError),

    /// The receiver of batch outcomes went away.
    #[error("outcome channel closed")]
    OutcomeChannelClosed,
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Where the messages of one batch ended up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Fully handled; ready to publish.
    pub ok: Vec<Message>,
    /// Refused by a stage.
    pub rejected: Vec<Message>,
    /// Persisted to the retry queue.
    pub retried: Vec<Message>,
}

impl BatchOutcome {
    /// Messages the transport must acknowledge.
    ///
    /// Every bucket is final from the broker's point of view (retries are on
    /// disk by now), but only messages still carrying a broker handle can be
    /// acknowledged. Messages drawn from the retry queue never do.
    pub fn to_acknowledge(&self) -> impl Iterator<Item = &Message> {
        self.ok
            .iter()
            .chain(&self.rejected)
            .chain(&self.retried)
            .filter(|msg| msg.ack_id.is_some())
    }

    pub fn len(&self) -> usize {
        self.ok.len() + self.rejected.len() + self.retried.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The stages a standalone pump runs: the skip-old filter when a threshold
/// is configured, dedup when `nodupe_ttl` is positive, and file-age logging.
pub fn default_pipeline(options: &Options, clock: &SharedClock) -> Pipeline {
    let mut pipeline = Pipeline::new();
    if options.msg_skip_threshold.is_some() {
        pipeline.push(Box::new(SkipOld::new(
            options.msg_skip_threshold,
            clock.clone(),
        )));
    }
    if options.nodupe_ttl > 0.0 {
        pipeline.push(Box::new(NoDupe::new(options, clock.clone())));
    }
    pipeline.push(Box::new(FileAge::new(clock.clone())));
    pipeline
}

/// Drives batches through a pipeline on behalf of one worker instance.
#[derive(Debug)]
pub struct FlowWorker {
    options: Options,
    pipeline: Pipeline,
    retry: DiskQueue,
    clock: SharedClock,
    last_housekeeping: f64,
}

impl FlowWorker {
    /// Creates a worker; the retry queue is opened immediately.
    pub fn new(options: Options, pipeline: Pipeline, clock: SharedClock) -> Result<Self> {
        let retry = DiskQueue::new(&options, &options.retry_name, clock.clone())?;
        let last_housekeeping = clock.now();
        Ok(FlowWorker {
            options,
            pipeline,
            retry,
            clock,
            last_housekeeping,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn retry_queue(&self) -> &DiskQueue {
        &self.retry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Runs the `on_start` stages and restarts the housekeeping interval.
    pub fn start(&mut self) -> PhaseReport {
        info!(stages = ?self.pipeline.stage_names(), "starting");
        self.last_housekeeping = self.clock.now();
        self.pipeline.run_lifecycle(Phase::OnStart)
    }

    /// Runs the `on_stop` stages and closes the retry queue.
    pub fn stop(&mut self) -> PhaseReport {
        let report = self.pipeline.run_lifecycle(Phase::OnStop);
        self.retry.close();
        info!("stopped");
        report
    }

    /// Runs one pass over `batch`, topped up with due retries.
    ///
    /// Whatever is still in `incoming` after the `work` phase counts as done.
    /// Messages a stage routed to `retry` are appended to the retry queue
    /// before this returns; failure to append is the only error.
    pub fn process_batch(&mut self, batch: Vec<Message>) -> Result<BatchOutcome> {
        let mut worklist = Worklist::new(batch);

        let room = self.options.batch.saturating_sub(worklist.incoming.len());
        if room > 0 {
            let retries = self.retry.get(room);
            if !retries.is_empty() {
                debug!(count = retries.len(), "retrying");
                worklist.incoming.extend(retries);
            }
        }
        if worklist.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let total = worklist.len();

        self.pipeline.run(Phase::AfterAccept, &mut worklist);
        self.pipeline.run(Phase::Work, &mut worklist);
        worklist.promote_incoming();
        self.pipeline.run(Phase::AfterWork, &mut worklist);

        // Stages that ran after promotion may have pushed back into incoming.
        worklist.promote_incoming();

        self.retry.put(&worklist.retry)?;

        let outcome = BatchOutcome {
            ok: worklist.ok,
            rejected: worklist.rejected,
            retried: worklist.retry,
        };
        debug_assert_eq!(outcome.len(), total);
        debug!(
            ok = outcome.ok.len(),
            rejected = outcome.rejected.len(),
            retried = outcome.retried.len(),
            "batch done"
        );
        Ok(outcome)
    }

    /// Seconds until housekeeping is due; `None` when disabled.
    pub fn time_until_housekeeping(&self) -> Option<Duration> {
        if self.options.housekeeping <= 0.0 {
            return None;
        }
        let due = self.last_housekeeping + self.options.housekeeping;
        Some(Duration::from_secs_f64((due - self.clock.now()).max(0.0)))
    }

    /// Runs housekeeping if the interval has elapsed.
    pub fn maybe_housekeeping(&mut self) -> Option<HousekeepingOutcome> {
        match self.time_until_housekeeping() {
            Some(wait) if wait.is_zero() => Some(self.housekeeping()),
            _ => None,
        }
    }

    /// Runs the `on_housekeeping` stages, then consolidates the retry queue.
    pub fn housekeeping(&mut self) -> HousekeepingOutcome {
        let report = self.pipeline.run_lifecycle(Phase::OnHousekeeping);
        if report.failed > 0 {
            warn!(failed = report.failed, "housekeeping stages failed");
        }
        let outcome = self.retry.on_housekeeping();
        self.last_housekeeping = self.clock.now();
        outcome
    }

    /// Processes one pass and sends its outcome, if any.
    async fn send_pass(
        &mut self,
        batch: Vec<Message>,
        outcomes: &mpsc::Sender<BatchOutcome>,
    ) -> Result<bool> {
        let outcome = self
            .process_batch(batch)
            .inspect_err(|e| error!(error = %e, "batch failed"))?;
        if outcome.is_empty() {
            return Ok(false);
        }
        outcomes
            .send(outcome)
            .await
            .map_err(|_| WorkerError::OutcomeChannelClosed)?;
        Ok(true)
    }

    /// Runs passes with no new input until the retry queue file is drained.
    async fn drain_retries(&mut self, outcomes: &mpsc::Sender<BatchOutcome>) -> Result<()> {
        while self.send_pass(Vec::new(), outcomes).await? {}
        Ok(())
    }

    /// Runs the worker until `shutdown` is cancelled, a
    /// [`WorkerMessage::Shutdown`] arrives, or the input channel closes.
    ///
    /// Each batch's outcome is sent on `outcomes`. After every housekeeping
    /// cycle the retry queue is drained without waiting for new input. The
    /// `on_stop` stages run on every exit path.
    #[instrument(skip_all, fields(instance = self.options.no))]
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<WorkerMessage>,
        outcomes: mpsc::Sender<BatchOutcome>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("worker event loop started");
        self.start();

        let result = loop {
            let next_housekeeping = self.time_until_housekeeping();

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping worker");
                    break Ok(());
                }

                msg = rx.recv() => {
                    match msg {
                        Some(WorkerMessage::Batch(batch)) => {
                            if let Err(e) = self.send_pass(batch, &outcomes).await {
                                break Err(e);
                            }
                            if self.maybe_housekeeping().is_some()
                                && let Err(e) = self.drain_retries(&outcomes).await
                            {
                                break Err(e);
                            }
                        }
                        Some(WorkerMessage::Housekeeping) => {
                            self.housekeeping();
                            if let Err(e) = self.drain_retries(&outcomes).await {
                                break Err(e);
                            }
                        }
                        Some(WorkerMessage::Shutdown) => {
                            info!("shutdown message received");
                            break Ok(());
                        }
                        None => {
                            info!("message channel closed");
                            break Ok(());
                        }
                    }
                }

                _ = async {
                    match next_housekeeping {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if self.maybe_housekeeping().is_some()
                        && let Err(e) = self.drain_retries(&outcomes).await
                    {
                        break Err(e);
                    }
                }
            }
        };

        self.stop();
        info!("worker event loop stopped");
        result
    }
}
