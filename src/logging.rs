//! Tracing setup
//!
//! Logs go to stderr so stdout stays free for command output and for the
//! bridge's line channel.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Environment variable overriding the log filter
pub const LOG_ENV: &str = "MOVIESTREAM_LOG";

/// Console level from the global verbosity flags
pub fn level_for(verbose: bool, quiet: bool) -> Level {
    if verbose {
        Level::DEBUG
    } else if quiet {
        Level::ERROR
    } else {
        Level::WARN
    }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_tracing(level: Level) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("moviestream={},warn", level)));

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(filter);

    // A subscriber is already set in tests that spawn several components
    let _ = tracing_subscriber::registry().with(layer).try_init();
}
