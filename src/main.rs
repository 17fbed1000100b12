//! `flowpump <options.json>`: a standalone pump.
//!
//! Reads one JSON message per line on stdin, runs them through a worker and
//! writes every completed message, in its published form, to stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use flowpump::clock::system_clock;
use flowpump::config::Options;
use flowpump::logging;
use flowpump::types::Message;
use flowpump::worker::{BatchOutcome, FlowWorker, WorkerMessage, default_pipeline};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A partial batch is flushed when input pauses this long.
const BATCH_LINGER: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> ExitCode {
    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: flowpump <options.json>");
        return ExitCode::from(2);
    };
    let options = match Options::load(&path) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("cannot load {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };
    logging::init(&options.log_level);

    let clock = system_clock();
    let pipeline = default_pipeline(&options, &clock);
    let batch_size = options.batch.max(1);
    let worker = match FlowWorker::new(options, pipeline, clock) {
        Ok(worker) => worker,
        Err(e) => {
            error!(error = %e, "cannot create worker");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel(16);
    let (out_tx, out_rx) = mpsc::channel(16);

    let worker_task = tokio::spawn(worker.run(rx, out_tx, shutdown.clone()));
    let writer_task = tokio::spawn(write_outcomes(out_rx));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            signal_token.cancel();
        }
    });

    read_input(tx, batch_size, &shutdown).await;

    let mut code = ExitCode::SUCCESS;
    match worker_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "worker failed");
            code = ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "worker task panicked");
            code = ExitCode::FAILURE;
        }
    }
    if let Err(e) = writer_task.await {
        error!(error = %e, "output task panicked");
        code = ExitCode::FAILURE;
    }
    code
}

/// Feeds stdin to the worker in batches until end of input or shutdown.
async fn read_input(tx: mpsc::Sender<WorkerMessage>, batch_size: usize, shutdown: &CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut batch: Vec<Message> = Vec::with_capacity(batch_size);
    let mut lineno = 0u64;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = tokio::time::timeout(BATCH_LINGER, lines.next_line()) => next,
        };

        match next {
            Err(_elapsed) => {
                if !batch.is_empty() && !send_batch(&tx, &mut batch).await {
                    break;
                }
            }
            Ok(Ok(Some(line))) => {
                lineno += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(&line) {
                    Ok(msg) => batch.push(msg),
                    Err(e) => warn!(lineno, error = %e, "ignoring malformed message"),
                }
                if batch.len() >= batch_size && !send_batch(&tx, &mut batch).await {
                    break;
                }
            }
            Ok(Ok(None)) => {
                debug!(lines = lineno, "end of input");
                if !batch.is_empty() {
                    send_batch(&tx, &mut batch).await;
                }
                let _ = tx.send(WorkerMessage::Shutdown).await;
                break;
            }
            Ok(Err(e)) => {
                error!(error = %e, "cannot read stdin");
                shutdown.cancel();
                break;
            }
        }
    }
}

async fn send_batch(tx: &mpsc::Sender<WorkerMessage>, batch: &mut Vec<Message>) -> bool {
    let full = std::mem::take(batch);
    tx.send(WorkerMessage::Batch(full)).await.is_ok()
}

/// Publishes completed messages to stdout.
async fn write_outcomes(mut rx: mpsc::Receiver<BatchOutcome>) {
    let mut stdout = tokio::io::stdout();
    while let Some(outcome) = rx.recv().await {
        debug!(
            acknowledged = outcome.to_acknowledge().count(),
            rejected = outcome.rejected.len(),
            retried = outcome.retried.len(),
            "batch resolved"
        );
        let mut out = Vec::new();
        for msg in &outcome.ok {
            match msg.to_post_value() {
                Ok(value) => {
                    if let Err(e) = serde_json::to_writer(&mut out, &value) {
                        error!(url = %msg.url(), error = %e, "cannot encode message");
                        continue;
                    }
                    out.push(b'\n');
                }
                Err(e) => error!(url = %msg.url(), error = %e, "cannot encode message"),
            }
        }
        if let Err(e) = stdout.write_all(&out).await {
            error!(error = %e, "cannot write to stdout");
            return;
        }
        if let Err(e) = stdout.flush().await {
            error!(error = %e, "cannot flush stdout");
            return;
        }
    }
}
