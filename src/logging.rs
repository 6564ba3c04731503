// src/logging.rs

//! `tracing` subscriber setup.
//!
//! The filter is taken from, in order:
//! 1. `--log-level`, applied to every target
//! 2. `PROCWARDEN_LOG`, in `EnvFilter` directive syntax, e.g.
//!    `procwarden=debug,procwarden::output=off` to debug the supervisor
//!    without the captured process output
//! 3. `info`
//!
//! Everything is written to stderr. Lines captured by `log` sinks are
//! emitted under [`OUTPUT_TARGET`] so they can be filtered on their own.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "PROCWARDEN_LOG";

/// Target of events carrying supervised process output.
pub const OUTPUT_TARGET: &str = "procwarden::output";

const DEFAULT_DIRECTIVES: &str = "info";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let filter = build_filter(cli_level, env.as_deref())?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}

/// Resolve the filter from the CLI flag and the raw `PROCWARDEN_LOG` value.
pub fn build_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> Result<EnvFilter> {
    if let Some(level) = cli_level {
        return Ok(EnvFilter::new(level.as_str()));
    }

    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid {LOG_ENV} value '{directives}'")),
        None => Ok(EnvFilter::new(DEFAULT_DIRECTIVES)),
    }
}
