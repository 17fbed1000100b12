//! Built-in stages that need no state beyond a clock.

use tracing::{debug, info, warn};

use super::callback::{FlowCallback, Result};
use super::worklist::{Bucket, Worklist};
use crate::clock::SharedClock;

/// Default lag beyond which [`SkipOld`] rejects a message, in seconds.
pub const DEFAULT_SKIP_THRESHOLD: f64 = 3600.0;

/// Rejects messages published too long ago.
///
/// Lag is measured from `pubTime`. A message whose `pubTime` cannot be parsed
/// is rejected as well, since no later stage could reason about its age.
#[derive(Debug)]
pub struct SkipOld {
    threshold: f64,
    clock: SharedClock,
    skipped: u64,
}

impl SkipOld {
    pub fn new(threshold: Option<f64>, clock: SharedClock) -> Self {
        SkipOld {
            threshold: threshold.unwrap_or(DEFAULT_SKIP_THRESHOLD),
            clock,
            skipped: 0,
        }
    }

    /// Messages rejected since construction.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl FlowCallback for SkipOld {
    fn name(&self) -> &str {
        "skip_old"
    }

    fn after_accept(&mut self, worklist: &mut Worklist) -> Result<()> {
        let now = self.clock.now();
        let threshold = self.threshold;
        let mut skipped = 0;

        worklist.route_incoming(|msg| match msg.age_since_pub(now) {
            Ok(lag) if lag <= threshold => Bucket::Incoming,
            Ok(lag) => {
                info!(url = %msg.url(), lag, threshold, "skipping old message");
                msg.set_reject(format!("message too old (lag {lag:.1}s > {threshold}s)"));
                skipped += 1;
                Bucket::Rejected
            }
            Err(e) => {
                warn!(url = %msg.url(), error = %e, "unreadable pubTime");
                msg.set_reject(format!("unreadable pubTime: {e}"));
                msg.set_report(417, None);
                skipped += 1;
                Bucket::Rejected
            }
        });

        self.skipped += skipped;
        Ok(())
    }
}

/// Logs how old each completed file is.
#[derive(Debug)]
pub struct FileAge {
    clock: SharedClock,
}

impl FileAge {
    pub fn new(clock: SharedClock) -> Self {
        FileAge { clock }
    }
}

impl FlowCallback for FileAge {
    fn name(&self) -> &str {
        "file_age"
    }

    fn after_work(&mut self, worklist: &mut Worklist) -> Result<()> {
        let now = self.clock.now();
        for msg in &worklist.ok {
            match msg.file_age(now) {
                Ok(Some(age)) => info!(url = %msg.url(), age = %format!("{age:.3}"), "file age"),
                Ok(None) => debug!(url = %msg.url(), "no mtime, file age unknown"),
                Err(e) => warn!(url = %msg.url(), error = %e, "unreadable mtime"),
            }
        }
        Ok(())
    }
}
