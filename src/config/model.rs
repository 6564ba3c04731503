// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::engine::ArbiterOptions;
use crate::process::StopSignal;
use crate::watcher::WatcherDefinition;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [arbiter]
/// check_delay = "1s"
/// graceful_timeout = "30s"
///
/// [watcher.web]
/// cmd = "python"
/// args = ["-m", "http.server"]
/// numprocesses = 2
/// stderr = "file"
/// stderr_file = "web.err"
/// ```
///
/// Use `ConfigFile::try_from` to get a validated configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub arbiter: ArbiterSection,

    /// All watchers from `[watcher.<name>]`, keyed by name.
    #[serde(default)]
    pub watcher: BTreeMap<String, WatcherConfig>,
}

/// `[arbiter]` section. Durations are strings like `"500ms"` or `"2s"`.
#[derive(Debug, Clone, Deserialize)]
pub struct ArbiterSection {
    #[serde(default = "default_check_delay")]
    pub check_delay: String,

    /// Default grace period between the stop signal and SIGKILL.
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: String,

    #[serde(default = "default_respawn_delay")]
    pub respawn_delay: String,
}

fn default_check_delay() -> String {
    "1s".to_string()
}

fn default_graceful_timeout() -> String {
    "30s".to_string()
}

fn default_respawn_delay() -> String {
    "0ms".to_string()
}

impl Default for ArbiterSection {
    fn default() -> Self {
        Self {
            check_delay: default_check_delay(),
            graceful_timeout: default_graceful_timeout(),
            respawn_delay: default_respawn_delay(),
        }
    }
}

/// Where one output stream goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTarget {
    #[default]
    Log,
    Null,
    File,
}

/// `[watcher.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Program to run (or the whole command line when `shell = true`).
    pub cmd: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Run through `sh -c` instead of executing `cmd` directly.
    #[serde(default)]
    pub shell: bool,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default = "default_numprocesses")]
    pub numprocesses: usize,

    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    #[serde(default = "default_true")]
    pub respawn: bool,

    #[serde(default = "default_true")]
    pub autostart: bool,

    /// Overrides `[arbiter].graceful_timeout`.
    #[serde(default)]
    pub graceful_timeout: Option<String>,

    #[serde(default)]
    pub stop_signal: StopSignal,

    #[serde(default)]
    pub stdout: StreamTarget,

    #[serde(default)]
    pub stderr: StreamTarget,

    #[serde(default)]
    pub stdout_file: Option<PathBuf>,

    #[serde(default)]
    pub stderr_file: Option<PathBuf>,
}

fn default_numprocesses() -> usize {
    1
}

fn default_max_retry() -> u32 {
    crate::watcher::DEFAULT_MAX_RETRY
}

fn default_true() -> bool {
    true
}

/// Validated configuration, ready for the arbiter.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub arbiter: ArbiterOptions,
    pub watchers: Vec<WatcherDefinition>,
}

impl ConfigFile {
    /// Construct without validation. Prefer `ConfigFile::try_from`.
    pub fn new_unchecked(arbiter: ArbiterOptions, watchers: Vec<WatcherDefinition>) -> Self {
        Self { arbiter, watchers }
    }

    pub fn watcher(&self, name: &str) -> Option<&WatcherDefinition> {
        self.watchers.iter().find(|w| w.name == name)
    }
}
