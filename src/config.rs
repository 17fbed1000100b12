//! Worker options.
//!
//! The options reach the core as a flat namespace. They are deserialised from
//! JSON; durations accept either a number of seconds or a string with a unit
//! suffix (`s`, `m`, `h`, `d`, `w`).

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Errors that can occur while loading options.
#[derive(Debug, Error)]
pub enum OptionsError {
    /// IO error reading the options file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed options document.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A duration string that does not parse.
    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),
}

/// Result type for option loading.
pub type Result<T> = std::result::Result<T, OptionsError>;

/// Default housekeeping interval, in seconds.
pub const DEFAULT_HOUSEKEEPING_SECS: f64 = 300.0;

/// Default maximum number of messages per pass.
pub const DEFAULT_BATCH: usize = 100;

/// Converts a duration such as `"90"`, `"1.5h"` or `"2d"` to seconds.
pub fn parse_duration(text: &str) -> Result<f64> {
    let text = text.trim();
    let (number, factor) = match text.chars().last() {
        Some('s' | 'S') => (&text[..text.len() - 1], 1.0),
        Some('m' | 'M') => (&text[..text.len() - 1], 60.0),
        Some('h' | 'H') => (&text[..text.len() - 1], 3600.0),
        Some('d' | 'D') => (&text[..text.len() - 1], 86_400.0),
        Some('w' | 'W') => (&text[..text.len() - 1], 604_800.0),
        _ => (text, 1.0),
    };
    number
        .trim()
        .parse::<f64>()
        .map(|n| n * factor)
        .map_err(|_| OptionsError::InvalidDuration(text.to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Seconds(f64),
    Text(String),
}

impl DurationRepr {
    fn seconds(self) -> Result<f64> {
        match self {
            DurationRepr::Seconds(secs) => Ok(secs),
            DurationRepr::Text(text) => parse_duration(&text),
        }
    }
}

fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    DurationRepr::deserialize(deserializer)?
        .seconds()
        .map_err(serde::de::Error::custom)
}

fn optional_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<f64>, D::Error> {
    Option::<DurationRepr>::deserialize(deserializer)?
        .map(DurationRepr::seconds)
        .transpose()
        .map_err(serde::de::Error::custom)
}

/// Options consumed by the retry queue, the dedup cache and the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Maximum age of a retried message; `None` or `<= 0` disables expiry.
    #[serde(deserialize_with = "optional_duration", alias = "retryTtl")]
    pub retry_ttl: Option<f64>,

    /// How long a dedup key is remembered.
    #[serde(deserialize_with = "duration", alias = "nodupeTtl")]
    pub nodupe_ttl: f64,

    /// Reject files whose modification time is older than this; 0 disables.
    #[serde(deserialize_with = "duration", alias = "nodupeFileAgeMaximum")]
    pub nodupe_file_age_maximum: f64,

    #[serde(rename = "logLevel", alias = "log_level")]
    pub log_level: String,

    /// The retry queue lives in this file's directory.
    pub pid_filename: PathBuf,

    /// The dedup cache lives in this directory.
    pub cfg_run_dir: PathBuf,

    /// Instance number.
    pub no: u32,

    /// Seconds between housekeeping cycles.
    #[serde(deserialize_with = "duration")]
    pub housekeeping: f64,

    /// Maximum messages per pass.
    pub batch: usize,

    /// Maximum publication lag accepted by the skip-old filter.
    #[serde(deserialize_with = "optional_duration")]
    pub msg_skip_threshold: Option<f64>,

    /// Name of the retry queue (`diskqueue_<name>`).
    pub retry_name: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            retry_ttl: None,
            nodupe_ttl: 0.0,
            nodupe_file_age_maximum: 0.0,
            log_level: "info".to_string(),
            pid_filename: PathBuf::from("i001.pid"),
            cfg_run_dir: PathBuf::from("."),
            no: 1,
            housekeeping: DEFAULT_HOUSEKEEPING_SECS,
            batch: DEFAULT_BATCH,
            msg_skip_threshold: None,
            retry_name: "retry".to_string(),
        }
    }
}

impl Options {
    /// Options for instance `no` of `component/config`, with state kept
    /// under `base`.
    pub fn for_instance(base: &Path, component: &str, config: &str, no: u32) -> Self {
        let cfg_run_dir = base.join(component).join(config);
        Options {
            pid_filename: cfg_run_dir.join(format!("i{no:03}.pid")),
            cfg_run_dir,
            no,
            ..Options::default()
        }
    }

    /// Reads options from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Directory holding the retry queue files.
    pub fn working_dir(&self) -> PathBuf {
        match self.pid_filename.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Default location of the dedup cache for this instance.
    pub fn nodupe_cache_file(&self) -> PathBuf {
        self.cfg_run_dir
            .join(format!("recent_files_{:03}.cache", self.no))
    }

    /// Effective retry TTL: `None` when expiry is disabled.
    pub fn effective_retry_ttl(&self) -> Option<f64> {
        self.retry_ttl.filter(|ttl| *ttl > 0.0)
    }
}
