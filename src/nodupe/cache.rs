//! Time-windowed duplicate suppression.
//!
//! # Cache File
//!
//! One record per line, `<key> <epoch-seconds> <quoted-path>`:
//!
//! ```text
//! md5,kAFQmDzST7DWlj99KOF/cg== 1700000000.000000 data/obs/a%20b.txt
//! ```
//!
//! The file is appended to on every check and rewritten compactly (expired
//! entries dropped) at housekeeping. The in-memory table is rebuilt from it
//! at start.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use tracing::{Span, debug, error, info, info_span, warn};

use crate::clock::SharedClock;
use crate::config::Options;
use crate::flow::{self, Bucket, FlowCallback, Worklist};
use crate::persistence::{self, LineReader, remove_file_best_effort, replace_file, sync_file};
use crate::types::Message;

/// Errors that can occur in the dedup cache.
#[derive(Debug, Error)]
pub enum NoDupeError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// An operation needing the cache file ran before `open()`.
    #[error("cache file is not open")]
    NotOpen,
}

/// Result type for dedup cache operations.
pub type Result<T> = std::result::Result<T, NoDupeError>;

/// Outcome of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// First sighting of this key and path within the window.
    New,
    /// The key and path were already recorded.
    Duplicate,
}

/// Reason recorded on messages rejected as duplicates.
pub const DUPLICATE_REJECT: &str = "not modified 1 (nodupe check)";

/// Quotes a path for the cache file. `/` stays readable.
fn quote(path: &str) -> String {
    urlencoding::encode(path).replace("%2F", "/")
}

fn unquote(qpath: &str) -> Option<String> {
    urlencoding::decode(qpath).ok().map(|p| p.into_owned())
}

fn record(key: &str, time: f64, path: &str) -> String {
    format!("{} {:.6} {}\n", key, time, quote(path))
}

/// Parses one cache record into `(key, time, path)`.
fn parse_record(line: &[u8]) -> std::result::Result<(String, f64, String), String> {
    let line = std::str::from_utf8(line).map_err(|e| e.to_string())?;
    let mut words = line.split_whitespace();
    let (Some(key), Some(time), Some(qpath)) = (words.next(), words.next(), words.next()) else {
        return Err("expected `key time path`".to_string());
    };
    let time = time
        .parse::<f64>()
        .map_err(|e| format!("bad time {time:?}: {e}"))?;
    let path = unquote(qpath).ok_or_else(|| format!("bad path quoting {qpath:?}"))?;
    Ok((key.to_string(), time, path))
}

/// The dedup key and path of a message.
///
/// The key is `method,value` of the integrity field. For methods whose value
/// says nothing about content (`arbitrary`, `cod`) it is `method,mtime`, or
/// `method,size` without an mtime. A message without integrity uses `none`
/// in place of the method. `nodupe_override` replaces either part.
pub fn message_key(msg: &Message) -> (String, String) {
    let override_ = msg.nodupe_override.as_ref();

    let key = match override_.and_then(|o| o.key.clone()) {
        Some(key) => key,
        None => {
            let (method, value, content_free) = match &msg.integrity {
                Some(integrity) => (
                    integrity.method.as_str(),
                    integrity.value.replace('\n', ""),
                    integrity.method.is_content_free(),
                ),
                None => ("none", String::new(), true),
            };
            let metadata = if content_free {
                msg.mtime()
                    .map(str::to_string)
                    .or_else(|| msg.size.map(|s| s.to_string()))
            } else {
                None
            };
            format!("{},{}", method, metadata.unwrap_or(value))
        }
    };

    let path = match override_.and_then(|o| o.path.clone()) {
        Some(path) => path,
        None => msg.rel_path.trim_start_matches('/').to_string(),
    };

    (key, path)
}

/// Remembers which (key, path) pairs were seen recently.
#[derive(Debug)]
pub struct NoDupe {
    ttl: f64,
    file_age_max: f64,
    default_cache_file: PathBuf,
    cache_file: Option<PathBuf>,
    cache: HashMap<String, HashMap<String, f64>>,
    writer: Option<BufWriter<File>>,
    count: usize,
    cache_hit: Option<String>,
    last_time: f64,
    last_count: usize,
    clock: SharedClock,
    span: Span,
}

impl NoDupe {
    /// Creates an empty, unopened cache. Call [`NoDupe::open`] (or run the
    /// `on_start` stage) before checking messages.
    pub fn new(options: &Options, clock: SharedClock) -> Self {
        let default_cache_file = options.nodupe_cache_file();
        let span = info_span!("nodupe", file = %default_cache_file.display());
        {
            let _enter = span.enter();
            info!(time_to_live = options.nodupe_ttl, "created");
        }
        let now = clock.now();
        NoDupe {
            ttl: options.nodupe_ttl,
            file_age_max: options.nodupe_file_age_maximum,
            default_cache_file,
            cache_file: None,
            cache: HashMap::new(),
            writer: None,
            count: 0,
            cache_hit: None,
            last_time: now,
            last_count: 0,
            clock,
            span,
        }
    }

    /// Number of (key, path) entries currently remembered.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn cache_file(&self) -> Option<&Path> {
        self.cache_file.as_deref()
    }

    /// The path that collided in the most recent duplicate verdict.
    pub fn last_hit(&self) -> Option<&str> {
        self.cache_hit.as_deref()
    }

    /// When `path` was last recorded under `key`.
    pub fn last_seen(&self, key: &str, path: &str) -> Option<f64> {
        self.cache.get(key).and_then(|paths| paths.get(path)).copied()
    }

    /// Opens `cache_file` (or the instance default) and loads it.
    pub fn open(&mut self, cache_file: Option<PathBuf>) -> Result<()> {
        self.cache_file = Some(cache_file.unwrap_or_else(|| self.default_cache_file.clone()));
        self.load()
    }

    /// Rebuilds the table from the cache file, skipping corrupt and expired
    /// records, and keeps the file open for appending.
    pub fn load(&mut self) -> Result<()> {
        let cache_file = self.cache_file.clone().ok_or(NoDupeError::NotOpen)?;
        let span = self.span.clone();
        let _enter = span.enter();
        debug!(path = %cache_file.display(), "load");

        self.close_writer();
        self.cache.clear();
        self.count = 0;

        if let Some(parent) = cache_file.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let now = self.clock.now();
        if let Some(mut reader) = LineReader::open(&cache_file)? {
            while let Some((key, time, path)) = reader.next_with(parse_record) {
                if now - time > self.ttl {
                    continue;
                }
                let paths = self.cache.entry(key).or_default();
                if paths.insert(path, time).is_none() {
                    self.count += 1;
                }
            }
        }

        self.writer = Some(open_append(&cache_file)?);
        info!(entries = self.count, "loaded");
        Ok(())
    }

    /// Records `path` under `key` and reports whether the pair was already
    /// known.
    pub fn check(&mut self, key: &str, path: &str) -> Verdict {
        let now = self.clock.now();
        self.cache_hit = None;

        let paths = self.cache.entry(key.to_string()).or_default();
        let present = paths.insert(path.to_string(), now).is_some();
        if !present {
            self.count += 1;
        }
        self.append_record(key, now, path);

        if present {
            self.cache_hit = Some(path.to_string());
            Verdict::Duplicate
        } else {
            debug!(key, path, "added");
            Verdict::New
        }
    }

    /// Checks a message under its derived key and path.
    pub fn check_message(&mut self, msg: &Message) -> Verdict {
        let (key, path) = message_key(msg);
        debug!(key = %key, path = %path, "check");
        self.check(&key, &path)
    }

    fn append_record(&mut self, key: &str, time: f64, path: &str) {
        let Some(writer) = self.writer.as_mut() else {
            debug!(key, path, "cache file not open, entry kept in memory only");
            return;
        };
        if let Err(e) = writer.write_all(record(key, time, path).as_bytes()) {
            warn!(error = %e, "cannot append to cache file");
        }
    }

    fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut()
            && let Err(e) = writer.flush()
        {
            warn!(error = %e, "cannot flush cache file");
        }
    }

    /// Drops entries older than the TTL, and every entry for `delpath` if
    /// given. With `persist`, survivors are written to the open cache file.
    pub fn clean(&mut self, persist: bool, delpath: Option<&str>) -> Result<()> {
        let now = self.clock.now();
        let ttl = self.ttl;
        let mut kept: HashMap<String, HashMap<String, f64>> = HashMap::new();
        let mut count = 0;

        for (key, paths) in std::mem::take(&mut self.cache) {
            let survivors: HashMap<String, f64> = paths
                .into_iter()
                .filter(|(value, time)| {
                    // Part entries are recorded as `path*part`.
                    let path = value.split('*').next().unwrap_or(value.as_str());
                    now - *time <= ttl && Some(path) != delpath
                })
                .collect();
            if !survivors.is_empty() {
                count += survivors.len();
                kept.insert(key, survivors);
            }
        }

        self.cache = kept;
        self.count = count;

        if persist {
            let writer = self.writer.as_mut().ok_or(NoDupeError::NotOpen)?;
            for (key, paths) in &self.cache {
                for (path, time) in paths {
                    writer.write_all(record(key, *time, path).as_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Rewrites the cache file with only unexpired entries.
    pub fn save(&mut self) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();
        debug!("save");
        self.rewrite(None)
    }

    /// Forgets `path` under every key and rewrites the cache file, so a
    /// deleted file becomes eligible for delivery again.
    pub fn delete_path(&mut self, path: &str) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();
        debug!(path, "delete_path");
        self.rewrite(Some(path))
    }

    fn rewrite(&mut self, delpath: Option<&str>) -> Result<()> {
        let cache_file = self.cache_file.clone().ok_or(NoDupeError::NotOpen)?;
        self.close_writer();

        let tmp = tmp_path(&cache_file);
        let written = self
            .write_snapshot(&tmp, delpath)
            .and_then(|()| Ok(replace_file(&tmp, &cache_file)?));
        if let Err(e) = &written {
            error!(path = %cache_file.display(), error = %e, "cannot rewrite cache file");
            remove_file_best_effort(&tmp);
        }

        self.writer = Some(open_append(&cache_file)?);
        written
    }

    fn write_snapshot(&mut self, tmp: &Path, delpath: Option<&str>) -> Result<()> {
        self.writer = Some(BufWriter::new(File::create(tmp)?));
        let cleaned = self.clean(true, delpath);
        let writer = self.writer.take().ok_or(NoDupeError::NotOpen)?;
        cleaned?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        sync_file(&file)?;
        Ok(())
    }

    fn close_writer(&mut self) {
        if let Some(mut writer) = self.writer.take()
            && let Err(e) = writer.flush()
        {
            warn!(error = %e, "did not close cache file");
        }
    }

    /// Empties the table and truncates the cache file.
    pub fn free(&mut self) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();
        debug!("free");
        self.close_writer();
        self.cache.clear();
        self.count = 0;
        let cache_file = self.cache_file.clone().ok_or(NoDupeError::NotOpen)?;
        remove_file_best_effort(&cache_file);
        self.writer = Some(open_append(&cache_file)?);
        Ok(())
    }

    /// Closes the cache file and empties the table; with `unlink`, also
    /// removes the file.
    pub fn close(&mut self, unlink: bool) {
        let _enter = self.span.enter();
        debug!(unlink, "close");
        if let Some(mut writer) = self.writer.take()
            && let Err(e) = writer.flush()
        {
            warn!(error = %e, "did not close cache file");
        }
        if unlink && let Some(cache_file) = &self.cache_file {
            remove_file_best_effort(cache_file);
        }
        self.cache.clear();
        self.count = 0;
    }

    fn too_old(&self, msg: &Message, now: f64) -> bool {
        if self.file_age_max <= 0.0 {
            return false;
        }
        let age = match msg.file_age(now) {
            Ok(Some(age)) => Ok(age),
            Ok(None) => msg.age_since_pub(now),
            Err(e) => Err(e),
        };
        match age {
            Ok(age) => age > self.file_age_max,
            Err(e) => {
                warn!(url = %msg.url(), error = %e, "cannot determine file age");
                false
            }
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    Ok(BufWriter::new(persistence::open_append(path)?))
}

impl FlowCallback for NoDupe {
    fn name(&self) -> &str {
        "nodupe"
    }

    fn on_start(&mut self) -> flow::Result<()> {
        self.open(None)?;
        Ok(())
    }

    fn after_accept(&mut self, worklist: &mut Worklist) -> flow::Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();
        let now = self.clock.now();

        worklist.route_incoming(|msg| {
            if self.too_old(msg, now) {
                info!(url = %msg.url(), max = self.file_age_max, "file too old");
                msg.set_reject(format!(
                    "file older than {} seconds (nodupe check)",
                    self.file_age_max
                ));
                return Bucket::Rejected;
            }
            // Retries were recorded on their first attempt.
            if msg.is_retry {
                return Bucket::Incoming;
            }
            match self.check_message(msg) {
                Verdict::New => Bucket::Incoming,
                Verdict::Duplicate => {
                    debug!(url = %msg.url(), "duplicate");
                    msg.set_reject(DUPLICATE_REJECT);
                    msg.set_report(304, Some("Not modified 1 (cache check)"));
                    Bucket::Rejected
                }
            }
        });

        self.flush();
        Ok(())
    }

    fn on_housekeeping(&mut self) -> flow::Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();
        let started = Instant::now();
        info!(entries = self.count, "start");

        let before = self.count;
        self.save()?;

        let now = self.clock.now();
        info!(
            previous = self.last_count,
            since = now - self.last_time,
            grew_to = before,
            saved = self.count,
            elapsed = started.elapsed().as_secs_f64(),
            "housekeeping done"
        );
        self.last_time = now;
        self.last_count = self.count;
        Ok(())
    }

    fn on_stop(&mut self) -> flow::Result<()> {
        let saved = self.save();
        self.close(false);
        saved?;
        Ok(())
    }
}
