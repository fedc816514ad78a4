//! Logging setup for the dbrelay binary.
//!
//! Logs go to stderr so stdout stays JSON-only. `RUST_LOG`, when set, takes
//! precedence over the verbosity flags.

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::error::{RelayError, Result};

/// Level for the CLI flags: quiet → ERROR, 0 → INFO, 1 → DEBUG, 2+ → TRACE
#[must_use]
pub const fn level_for(verbose: u8, quiet: bool) -> Level {
    match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    }
}

/// Install the global stderr subscriber
pub fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    let level = level_for(verbose, quiet);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dbrelay={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| RelayError::config_error(format!("Failed to initialize logging: {e}")))
}
