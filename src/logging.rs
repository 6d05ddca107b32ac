//! Log setup shared by the binary and the re-executed runtime child.
//!
//! Verbosity comes from `LOGLEVEL`: a name (`error` .. `trace`, `off`) or a
//! number 0-6 where 0-2 mean error, 3 warn, 4 info, 5 debug and 6 trace.

use crate::constants::LOGLEVEL_ENV;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::FmtSubscriber;

/// Parses a `LOGLEVEL` value.
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    let value = value.trim();
    if let Ok(n) = value.parse::<u8>() {
        return match n {
            0..=2 => Some(LevelFilter::ERROR),
            3 => Some(LevelFilter::WARN),
            4 => Some(LevelFilter::INFO),
            5 => Some(LevelFilter::DEBUG),
            6 => Some(LevelFilter::TRACE),
            _ => None,
        };
    }
    value.parse().ok()
}

/// Level from the environment, `INFO` when unset or invalid.
pub fn level_from_env() -> LevelFilter {
    std::env::var(LOGLEVEL_ENV)
        .ok()
        .and_then(|v| parse_level(&v))
        .unwrap_or(LevelFilter::INFO)
}

/// Value to export as `LOGLEVEL` so a child logs like this process.
pub fn level_env_value() -> String {
    LevelFilter::current().to_string()
}

/// Installs the global subscriber writing to stderr. Returns false if one
/// was already installed.
pub fn init() -> bool {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level_from_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
