//! Logging setup for the gateway binary and the tests.
//!
//! Output goes through a `tracing_subscriber` fmt layer. The dispatcher,
//! modem connections and WebSocket server log with structured fields
//! (`device`, `uuid`, `error`), so one line per event is enough to follow a
//! message from submission to delivery.

use tracing::Level;

/// Environment variable that overrides the level passed to [`init`].
pub const LOG_ENV: &str = "SMSGATE_LOG";

/// Install the global subscriber at `default_level`, or at the level named
/// by `SMSGATE_LOG` when that is set. Unknown names mean `info`.
///
/// Calling this again after a subscriber is installed does nothing.
pub fn init(default_level: &str) {
    let level = match std::env::var(LOG_ENV) {
        Ok(name) => parse_level(&name),
        Err(_) => parse_level(default_level),
    };

    // try_init: tests call this repeatedly
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

pub(crate) fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}
