//! Tracing subscriber setup.
//!
//! Components never configure logging themselves; they log through `tracing`
//! inside their own spans. The process installs one subscriber at start-up.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Maps a `logLevel` option value to a tracing level filter.
///
/// Unknown names fall back to `info`.
pub fn level_filter(log_level: &str) -> LevelFilter {
    match log_level.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" | "critical" => LevelFilter::ERROR,
        "none" | "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Installs the global subscriber: `RUST_LOG` if set, otherwise `log_level`.
///
/// Returns `false` if a subscriber was already installed.
pub fn init(log_level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level_filter(log_level).into()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_option_names() {
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("warning"), LevelFilter::WARN);
        assert_eq!(level_filter("critical"), LevelFilter::ERROR);
        assert_eq!(level_filter("none"), LevelFilter::OFF);
        assert_eq!(level_filter("chatty"), LevelFilter::INFO);
    }
}
