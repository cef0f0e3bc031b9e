//! Logging initialisation for binaries and tests.

use tracing::Level;

/// Maps a configured level name onto a `tracing` level, defaulting to `INFO`.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Installs a `fmt` subscriber capped at `default_level`.
///
/// Uses `try_init`, so repeated calls from tests or embedding applications are
/// harmless: the first subscriber wins.
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(default_level))
        .with_target(true)
        .try_init();
}
