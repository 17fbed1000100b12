//! Scenario tests for the worker: batches, retries, dedup and the event loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::{ManualClock, SharedClock, system_clock};
use crate::config::Options;
use crate::flow::{self, Bucket, FlowCallback, Pipeline, StageError, Worklist};
use crate::nodupe::{DUPLICATE_REJECT, NoDupe};
use crate::retry::HousekeepingOutcome;
use crate::test_utils::{T0, message};
use crate::types::Message;

use super::{BatchOutcome, FlowWorker, WorkerMessage};

// ─── Test Helpers ───

/// Fails every first attempt at a path starting with `flaky`; retries succeed.
struct FlakyTransfer;

impl FlowCallback for FlakyTransfer {
    fn name(&self) -> &str {
        "flaky_transfer"
    }

    fn work(&mut self, worklist: &mut Worklist) -> flow::Result<()> {
        worklist.route_incoming(|msg| {
            if msg.rel_path.starts_with("flaky") && !msg.is_retry {
                Bucket::Retry
            } else {
                Bucket::Ok
            }
        });
        Ok(())
    }
}

/// Fails in `work` after rejecting everything.
struct Broken;

impl FlowCallback for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn work(&mut self, worklist: &mut Worklist) -> flow::Result<()> {
        worklist.route_incoming(|_| Bucket::Rejected);
        Err(StageError::Failed("remote end hung up".into()))
    }
}

#[derive(Default)]
struct Lifecycle {
    started: Arc<AtomicUsize>,
    housekept: Arc<AtomicUsize>,
    stopped: Arc<AtomicUsize>,
}

impl FlowCallback for Lifecycle {
    fn name(&self) -> &str {
        "lifecycle"
    }

    fn on_start(&mut self) -> flow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_housekeeping(&mut self) -> flow::Result<()> {
        self.housekept.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_stop(&mut self) -> flow::Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn options(dir: &TempDir) -> Options {
    let mut options = Options::for_instance(dir.path(), "subscribe", "test", 1);
    options.nodupe_ttl = 300.0;
    options.housekeeping = 60.0;
    options
}

fn worker(dir: &TempDir, pipeline: Pipeline) -> (FlowWorker, Arc<ManualClock>) {
    let clock = ManualClock::new(T0);
    let mut worker = FlowWorker::new(options(dir), pipeline, clock.clone()).unwrap();
    worker.start();
    (worker, clock)
}

fn from_broker(rel_path: &str, tag: u64) -> Message {
    message(rel_path).with_ack_id(json!({"delivery_tag": tag}))
}

fn paths(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.rel_path.as_str()).collect()
}

// ─── Batch Processing ───

#[test]
fn unrouted_messages_count_as_done() {
    let dir = tempdir().unwrap();
    let (mut worker, _clock) = worker(&dir, Pipeline::new());

    let outcome = worker
        .process_batch(vec![from_broker("a", 1), from_broker("b", 2)])
        .unwrap();

    assert_eq!(paths(&outcome.ok), ["a", "b"]);
    assert!(outcome.rejected.is_empty() && outcome.retried.is_empty());
    assert_eq!(outcome.to_acknowledge().count(), 2);
}

#[test]
fn failed_transfer_is_retried_after_housekeeping() {
    let dir = tempdir().unwrap();
    let (mut worker, _clock) = worker(&dir, Pipeline::new().with_stage(FlakyTransfer));

    let first = worker
        .process_batch(vec![from_broker("flaky1", 1), from_broker("good", 2)])
        .unwrap();
    assert_eq!(paths(&first.ok), ["good"]);
    assert_eq!(paths(&first.retried), ["flaky1"]);
    // The retried message is on disk, so the broker copy is acknowledged.
    assert_eq!(first.to_acknowledge().count(), 2);

    // Not visible before consolidation.
    let idle = worker.process_batch(Vec::new()).unwrap();
    assert!(idle.is_empty());

    assert_eq!(
        worker.housekeeping(),
        HousekeepingOutcome::Committed { count: 1 }
    );

    let second = worker.process_batch(vec![from_broker("next", 3)]).unwrap();
    assert_eq!(paths(&second.ok), ["next", "flaky1"]);
    let retried = &second.ok[1];
    assert!(retried.is_retry);
    assert!(retried.ack_id.is_none());
    let acked: Vec<_> = second.to_acknowledge().map(|m| m.rel_path.as_str()).collect();
    assert_eq!(acked, ["next"]);
}

#[test]
fn retries_only_fill_the_room_left_in_a_batch() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut opts = options(&dir);
    opts.batch = 3;
    let mut worker =
        FlowWorker::new(opts, Pipeline::new().with_stage(FlakyTransfer), clock).unwrap();

    let batch: Vec<_> = (0..3).map(|i| from_broker(&format!("flaky{i}"), i)).collect();
    worker.process_batch(batch).unwrap();
    worker.housekeeping();

    let outcome = worker
        .process_batch(vec![from_broker("x", 10), from_broker("y", 11)])
        .unwrap();
    assert_eq!(paths(&outcome.ok), ["x", "y", "flaky0"]);

    let outcome = worker.process_batch(Vec::new()).unwrap();
    assert_eq!(paths(&outcome.ok), ["flaky1", "flaky2"]);
}

#[test]
fn failing_stage_keeps_messages_in_place() {
    let dir = tempdir().unwrap();
    let (mut worker, _clock) = worker(&dir, Pipeline::new().with_stage(Broken));

    let outcome = worker
        .process_batch(vec![from_broker("a", 1), from_broker("b", 2)])
        .unwrap();

    assert_eq!(paths(&outcome.ok), ["a", "b"]);
    assert!(outcome.rejected.is_empty());
}

#[test]
fn duplicates_across_batches_are_rejected() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let opts = options(&dir);
    let shared: SharedClock = clock.clone();
    let pipeline = Pipeline::new().with_stage(NoDupe::new(&opts, shared));
    let mut worker = FlowWorker::new(opts, pipeline, clock.clone()).unwrap();
    worker.start();

    let first = worker.process_batch(vec![from_broker("a", 1)]).unwrap();
    assert_eq!(paths(&first.ok), ["a"]);

    let second = worker
        .process_batch(vec![from_broker("a", 2), from_broker("b", 3)])
        .unwrap();
    assert_eq!(paths(&second.ok), ["b"]);
    assert_eq!(paths(&second.rejected), ["a"]);
    assert_eq!(second.rejected[0].reject.as_deref(), Some(DUPLICATE_REJECT));
    assert_eq!(second.to_acknowledge().count(), 2);

    // Past the dedup window, the same announcement is new again.
    clock.advance(301.0);
    worker.housekeeping();
    let third = worker.process_batch(vec![from_broker("a", 4)]).unwrap();
    assert_eq!(paths(&third.ok), ["a"]);
}

#[test]
fn retried_message_passes_dedup_on_its_second_attempt() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let opts = options(&dir);
    let shared: SharedClock = clock.clone();
    let pipeline = Pipeline::new()
        .with_stage(NoDupe::new(&opts, shared))
        .with_stage(FlakyTransfer);
    let mut worker = FlowWorker::new(opts, pipeline, clock).unwrap();
    worker.start();

    let first = worker.process_batch(vec![from_broker("flaky1", 1)]).unwrap();
    assert_eq!(paths(&first.retried), ["flaky1"]);
    assert_eq!(
        worker.housekeeping(),
        HousekeepingOutcome::Committed { count: 1 }
    );

    // A fresh broker copy is still a duplicate; the retry is not.
    let second = worker.process_batch(vec![from_broker("flaky1", 2)]).unwrap();
    assert_eq!(paths(&second.ok), ["flaky1"]);
    assert!(second.ok[0].is_retry);
    assert!(second.ok[0].reject.is_none());
    assert_eq!(paths(&second.rejected), ["flaky1"]);
    assert_eq!(second.rejected[0].reject.as_deref(), Some(DUPLICATE_REJECT));
    assert!(!second.rejected[0].is_retry);
}

#[test]
fn dedup_state_survives_restart() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let shared: SharedClock = clock.clone();

    let opts = options(&dir);
    let pipeline = Pipeline::new().with_stage(NoDupe::new(&opts, shared.clone()));
    let mut worker = FlowWorker::new(opts, pipeline, shared.clone()).unwrap();
    worker.start();
    worker.process_batch(vec![from_broker("a", 1)]).unwrap();
    worker.stop();
    drop(worker);

    let opts = options(&dir);
    let pipeline = Pipeline::new().with_stage(NoDupe::new(&opts, shared.clone()));
    let mut worker = FlowWorker::new(opts, pipeline, shared).unwrap();
    worker.start();
    let outcome = worker.process_batch(vec![from_broker("a", 2)]).unwrap();
    assert_eq!(paths(&outcome.rejected), ["a"]);
}

#[test]
fn pending_retries_survive_restart() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(T0);
    {
        let mut worker = FlowWorker::new(
            options(&dir),
            Pipeline::new().with_stage(FlakyTransfer),
            clock.clone(),
        )
        .unwrap();
        worker.process_batch(vec![from_broker("flaky", 1)]).unwrap();
        worker.stop();
    }

    let mut worker = FlowWorker::new(
        options(&dir),
        Pipeline::new().with_stage(FlakyTransfer),
        clock,
    )
    .unwrap();
    worker.housekeeping();
    let outcome = worker.process_batch(Vec::new()).unwrap();
    assert_eq!(paths(&outcome.ok), ["flaky"]);
}

#[test]
fn expired_retries_are_dropped() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut opts = options(&dir);
    opts.retry_ttl = Some(100.0);
    let mut worker =
        FlowWorker::new(opts, Pipeline::new().with_stage(FlakyTransfer), clock.clone()).unwrap();

    worker.process_batch(vec![from_broker("flaky", 1)]).unwrap();
    clock.advance(101.0);
    assert_eq!(worker.housekeeping(), HousekeepingOutcome::Empty);
    assert!(worker.process_batch(Vec::new()).unwrap().is_empty());
}

#[test]
fn lifecycle_stages_run_in_order() {
    let dir = tempdir().unwrap();
    let stage = Lifecycle::default();
    let (started, housekept, stopped) = (
        stage.started.clone(),
        stage.housekept.clone(),
        stage.stopped.clone(),
    );
    let (mut worker, clock) = worker(&dir, Pipeline::new().with_stage(stage));
    assert_eq!(started.load(Ordering::SeqCst), 1);

    worker.process_batch(vec![message("a")]).unwrap();
    assert_eq!(worker.maybe_housekeeping(), None);
    clock.advance(60.0);
    assert!(worker.maybe_housekeeping().is_some());
    assert_eq!(housekept.load(Ordering::SeqCst), 1);

    worker.stop();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
}

// ─── Event Loop ───

#[tokio::test]
async fn run_sends_outcomes_and_stops_on_shutdown_message() {
    let dir = tempdir().unwrap();
    let stage = Lifecycle::default();
    let stopped = stage.stopped.clone();
    let worker = FlowWorker::new(
        options(&dir),
        Pipeline::new().with_stage(stage),
        ManualClock::new(T0),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel(4);
    let (out_tx, mut out_rx) = mpsc::channel::<BatchOutcome>(4);
    let handle = tokio::spawn(worker.run(rx, out_tx, CancellationToken::new()));

    tx.send(WorkerMessage::Batch(vec![from_broker("a", 1)]))
        .await
        .unwrap();
    let outcome = out_rx.recv().await.unwrap();
    assert_eq!(paths(&outcome.ok), ["a"]);

    tx.send(WorkerMessage::Housekeeping).await.unwrap();
    tx.send(WorkerMessage::Shutdown).await.unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_stops_on_cancellation() {
    let dir = tempdir().unwrap();
    let worker = FlowWorker::new(options(&dir), Pipeline::new(), ManualClock::new(T0)).unwrap();

    let (_tx, rx) = mpsc::channel::<WorkerMessage>(1);
    let (out_tx, _out_rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(rx, out_tx, shutdown.clone()));

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn run_stops_when_input_closes() {
    let dir = tempdir().unwrap();
    let worker = FlowWorker::new(options(&dir), Pipeline::new(), ManualClock::new(T0)).unwrap();

    let (tx, rx) = mpsc::channel::<WorkerMessage>(1);
    let (out_tx, _out_rx) = mpsc::channel(1);
    drop(tx);
    worker
        .run(rx, out_tx, CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn run_drains_committed_retries_without_new_input() {
    let dir = tempdir().unwrap();
    let mut opts = options(&dir);
    opts.housekeeping = 0.05;
    let worker = FlowWorker::new(
        opts,
        Pipeline::new().with_stage(FlakyTransfer),
        system_clock(),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel(4);
    let (out_tx, mut out_rx) = mpsc::channel::<BatchOutcome>(4);
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(rx, out_tx, shutdown.clone()));

    tx.send(WorkerMessage::Batch(vec![from_broker("flaky1", 1)]))
        .await
        .unwrap();
    let first = out_rx.recv().await.unwrap();
    assert_eq!(paths(&first.retried), ["flaky1"]);

    let second = tokio::time::timeout(Duration::from_secs(10), out_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paths(&second.ok), ["flaky1"]);
    assert!(second.ok[0].is_retry);
    assert!(second.rejected.is_empty() && second.retried.is_empty());

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
