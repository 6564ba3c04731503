// src/cli.rs

//! Command line of the `procwarden` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::config::{DEFAULT_CONFIG_FILE, parse_duration};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "procwarden",
    version,
    about = "Launch, monitor and restart groups of worker processes.",
    long_about = None
)]
pub struct CliArgs {
    /// Config file (TOML) declaring the watchers.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Override `[arbiter].check_delay`, e.g. `500ms`.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub check_delay: Option<Duration>,

    /// Log level for every target; takes precedence over `PROCWARDEN_LOG`.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Validate the config and print the resolved watchers without
    /// launching anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
