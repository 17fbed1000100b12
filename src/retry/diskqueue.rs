//! Append-only on-disk retry queue.
//!
//! # Files
//!
//! ```text
//! diskqueue_<name>       - current generation, drained sequentially by get()
//! diskqueue_<name>.new   - entries put() since the last housekeeping
//! diskqueue_<name>.hk    - scratch file, only present during consolidation
//! ```
//!
//! Every line is one JSON-encoded [`Message`].
//!
//! # Crash Safety
//!
//! - `put()` only appends, then flushes
//! - Consolidation writes `.hk` in full and syncs it before renaming it over
//!   the queue file; the rename (followed by a directory sync) is the only
//!   commit point
//! - `.new` is removed only once the rename has committed, so a fault during
//!   staging loses nothing
//! - A truncated last line (interrupted `put()`) is skipped as corrupt, and
//!   the next `put()` starts on a fresh line

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use thiserror::Error;
use tracing::{Span, debug, error, info, info_span, warn};

use crate::clock::SharedClock;
use crate::config::Options;
use crate::persistence::{
    LineReader, open_append, remove_file_best_effort, replace_file, sync_file, sync_parent_dir,
};
use crate::types::Message;

/// Errors that can occur in the retry queue.
#[derive(Debug, Error)]
pub enum DiskQueueError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The working directory could not be created.
    #[error("cannot create queue directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
}

/// Result type for retry queue operations.
pub type Result<T> = std::result::Result<T, DiskQueueError>;

/// What a housekeeping cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HousekeepingOutcome {
    /// A `get()` pass is still draining the queue file; nothing was touched.
    Deferred,
    /// No entry survived; the queue is now empty.
    Empty,
    /// A new generation holding `count` entries replaced the queue file.
    Committed { count: usize },
    /// Staging or commit failed; the previous generation and `.new` are intact.
    Failed,
}

/// Result of writing the housekeeping file, before it is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Staged {
    pub examined: usize,
    pub survivors: usize,
}

/// Key under which two retry entries count as the same work item.
fn requeue_key(msg: &Message) -> String {
    let integrity = serde_json::to_string(&msg.integrity).unwrap_or_default();
    let mut key = format!("{} {}", msg.url(), integrity);
    if let Some(parts) = &msg.parts {
        key.push(' ');
        key.push_str(parts);
    }
    key
}

fn append_lines(writer: &mut BufWriter<File>, messages: &[Message]) -> Result<()> {
    for msg in messages {
        debug!(url = %msg.url(), "add to new file");
        serde_json::to_writer(&mut *writer, msg)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// A persistent retry queue owned by one worker instance.
#[derive(Debug)]
pub struct DiskQueue {
    name: String,
    ttl: Option<f64>,
    queue_file: PathBuf,
    new_path: PathBuf,
    housekeeping_path: PathBuf,
    queue_reader: Option<LineReader>,
    new_writer: Option<BufWriter<File>>,
    clock: SharedClock,
    span: Span,
}

impl DiskQueue {
    /// Opens the queue `diskqueue_<name>` in the options' working directory.
    ///
    /// A `.new` file strictly older than the queue file is left over from a
    /// consolidation that committed but did not get to remove it; it is
    /// deleted here. Otherwise `.new` is kept for the next consolidation.
    pub fn new(options: &Options, name: &str, clock: SharedClock) -> Result<Self> {
        let working_dir = options.working_dir();
        std::fs::create_dir_all(&working_dir).map_err(|source| DiskQueueError::CreateDir {
            path: working_dir.clone(),
            source,
        })?;

        let queue_file = working_dir.join(format!("diskqueue_{name}"));
        let mut new_path = queue_file.clone().into_os_string();
        new_path.push(".new");
        let mut housekeeping_path = queue_file.clone().into_os_string();
        housekeeping_path.push(".hk");

        let span = info_span!("diskqueue", name = %name);
        let queue = DiskQueue {
            name: name.to_string(),
            ttl: options.effective_retry_ttl(),
            queue_file,
            new_path: PathBuf::from(new_path),
            housekeeping_path: PathBuf::from(housekeeping_path),
            queue_reader: None,
            new_writer: None,
            clock,
            span,
        };

        {
            let _enter = queue.span.enter();
            debug!(ttl = ?queue.ttl, path = %queue.queue_file.display(), "opened");
            if let Some(queue_age) = modified(&queue.queue_file)
                && let Some(new_age) = modified(&queue.new_path)
                && queue_age > new_age
            {
                info!(path = %queue.new_path.display(), "removing stale new entries file");
                remove_file_best_effort(&queue.new_path);
            }
        }

        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_file(&self) -> &Path {
        &self.queue_file
    }

    pub fn new_path(&self) -> &Path {
        &self.new_path
    }

    pub fn housekeeping_path(&self) -> &Path {
        &self.housekeeping_path
    }

    /// Appends `messages` to the `.new` file and flushes.
    ///
    /// No admission filtering happens here; duplicates and expired entries are
    /// dropped at consolidation.
    pub fn put(&mut self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let _enter = self.span.enter();

        let mut writer = match self.new_writer.take() {
            Some(writer) => writer,
            None => BufWriter::new(open_append(&self.new_path)?),
        };
        let appended = append_lines(&mut writer, messages);
        self.new_writer = Some(writer);
        appended
    }

    /// Takes up to `max` messages from the queue file, in order.
    ///
    /// Expired entries are dropped. Returned messages are marked as retries
    /// and carry no acknowledgement handle. Returns fewer than `max` when the
    /// queue file runs out; an exhausted queue file is deleted. Entries put
    /// since the last housekeeping are not visible here.
    pub fn get(&mut self, max: usize) -> Vec<Message> {
        let span = self.span.clone();
        let _enter = span.enter();
        let now = self.clock.now();
        let mut messages = Vec::new();

        while messages.len() < max {
            if self.queue_reader.is_none() {
                match LineReader::open(&self.queue_file) {
                    Ok(Some(reader)) => {
                        debug!(path = %self.queue_file.display(), "open read");
                        self.queue_reader = Some(reader);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %self.queue_file.display(), error = %e, "cannot open queue file");
                        break;
                    }
                }
            }

            let next = self
                .queue_reader
                .as_mut()
                .and_then(|reader| reader.next_json::<Message>());
            let Some(mut msg) = next else {
                self.finish_queue_file();
                break;
            };

            if self.is_expired_at(&msg, now) {
                info!(url = %msg.url(), pub_time = %msg.pub_time, "discarding expired message");
                continue;
            }

            msg.is_retry = true;
            msg.strip_ack_id();
            messages.push(msg);
        }

        // Exhausted even when `max` was reached exactly.
        if self.queue_reader.as_mut().is_some_and(LineReader::at_end) {
            self.finish_queue_file();
        }

        messages
    }

    /// Drops the read cursor and deletes the exhausted queue file.
    fn finish_queue_file(&mut self) {
        if let Some(reader) = self.queue_reader.take()
            && reader.abandoned()
        {
            error!(
                path = %self.queue_file.display(),
                offset = reader.offset(),
                "discarding queue file with unread entries past corrupted region"
            );
        }
        remove_file_best_effort(&self.queue_file);
    }

    /// Whether `msg` is older than the retry TTL, measured from `pubTime`.
    pub fn is_expired(&self, msg: &Message) -> bool {
        self.is_expired_at(msg, self.clock.now())
    }

    fn is_expired_at(&self, msg: &Message, now: f64) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        match msg.age_since_pub(now) {
            Ok(age) => age > ttl,
            Err(e) => {
                warn!(url = %msg.url(), error = %e, "unreadable pubTime, treating as expired");
                true
            }
        }
    }

    fn needs_requeuing(&self, msg: &Message, now: f64, seen: &mut HashSet<String>) -> bool {
        if !seen.insert(requeue_key(msg)) {
            info!(url = %msg.url(), "discarding duplicate message");
            return false;
        }
        if self.is_expired_at(msg, now) {
            info!(url = %msg.url(), pub_time = %msg.pub_time, "discarding expired message");
            return false;
        }
        true
    }

    /// Merges what remains of the queue file with the `.new` entries into a
    /// fresh generation, dropping duplicates and expired entries.
    ///
    /// Skipped entirely while a `get()` pass is part-way through the queue
    /// file.
    pub fn on_housekeeping(&mut self) -> HousekeepingOutcome {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.queue_reader.is_some() && self.queue_file.exists() {
            info!(path = %self.queue_file.display(), "retry list not finished, resuming retries");
            return HousekeepingOutcome::Deferred;
        }

        let started = Instant::now();
        let outcome = match self.stage_consolidation() {
            Ok(staged) => match self.commit_consolidation(staged) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "commit of housekeeping file failed");
                    remove_file_best_effort(&self.housekeeping_path);
                    HousekeepingOutcome::Failed
                }
            },
            Err(e) => {
                error!(error = %e, "consolidation failed, keeping previous generation");
                remove_file_best_effort(&self.housekeeping_path);
                HousekeepingOutcome::Failed
            }
        };

        info!(
            elapsed = started.elapsed().as_secs_f64(),
            ?outcome,
            "on_housekeeping done"
        );
        outcome
    }

    /// Writes and syncs the housekeeping file without committing it.
    pub(crate) fn stage_consolidation(&mut self) -> Result<Staged> {
        self.close_writer()?;
        remove_file_best_effort(&self.housekeeping_path);

        let now = self.clock.now();
        let mut seen = HashSet::new();
        let mut out = BufWriter::new(File::create(&self.housekeeping_path)?);
        let mut staged = Staged {
            examined: 0,
            survivors: 0,
        };

        let remaining = match self.queue_reader.take() {
            Some(reader) => Some(reader),
            None => LineReader::open(&self.queue_file)?,
        };
        let new_entries = LineReader::open(&self.new_path)?;

        for mut reader in [remaining, new_entries].into_iter().flatten() {
            while let Some(msg) = reader.next_json::<Message>() {
                staged.examined += 1;
                if !self.needs_requeuing(&msg, now, &mut seen) {
                    continue;
                }
                serde_json::to_writer(&mut out, &msg)?;
                out.write_all(b"\n")?;
                staged.survivors += 1;
            }
        }

        let file = out.into_inner().map_err(|e| e.into_error())?;
        sync_file(&file)?;
        debug!(
            kept = staged.survivors,
            examined = staged.examined,
            "housekeeping file staged"
        );
        Ok(staged)
    }

    /// Makes a staged housekeeping file the current generation, then drops
    /// the `.new` file it absorbed.
    pub(crate) fn commit_consolidation(&mut self, staged: Staged) -> Result<HousekeepingOutcome> {
        let outcome = if staged.survivors == 0 {
            info!("no retry in list");
            remove_file_best_effort(&self.housekeeping_path);
            if remove_file_best_effort(&self.queue_file) {
                sync_parent_dir(&self.queue_file)?;
            }
            HousekeepingOutcome::Empty
        } else {
            replace_file(&self.housekeeping_path, &self.queue_file)?;
            info!(count = staged.survivors, "messages in retry list");
            HousekeepingOutcome::Committed {
                count: staged.survivors,
            }
        };

        remove_file_best_effort(&self.new_path);
        Ok(outcome)
    }

    fn close_writer(&mut self) -> io::Result<()> {
        if let Some(writer) = self.new_writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            sync_file(&file)?;
        }
        Ok(())
    }

    /// Flushes and syncs the `.new` file and drops the read cursor.
    ///
    /// The next `get()` restarts at the beginning of the queue file.
    pub fn close(&mut self) {
        let _enter = self.span.enter();
        if let Some(writer) = self.new_writer.take() {
            match writer.into_inner() {
                Ok(file) => {
                    if let Err(e) = sync_file(&file) {
                        warn!(path = %self.new_path.display(), error = %e, "sync failed on close");
                    }
                }
                Err(e) => {
                    warn!(path = %self.new_path.display(), error = %e.error(), "flush failed on close")
                }
            }
        }
        self.queue_reader = None;
    }

    /// Removes the queue file.
    pub fn cleanup(&mut self) {
        let _enter = self.span.enter();
        self.queue_reader = None;
        remove_file_best_effort(&self.queue_file);
    }
}
