// src/watcher/definition.rs

use std::time::Duration;

use crate::process::{ProcessSpec, StopSignal};
use crate::stream::SinkConfig;

pub const DEFAULT_MAX_RETRY: u32 = 5;
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

/// Fully resolved settings for one watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherDefinition {
    pub name: String,
    pub spec: ProcessSpec,
    pub numprocesses: usize,
    /// Failed launches tolerated in a row before the watcher gives up.
    pub max_retry: u32,
    pub respawn: bool,
    pub autostart: bool,
    pub graceful_timeout: Duration,
    /// Delay between a reap and the respawn callback.
    pub respawn_delay: Duration,
    pub stop_signal: StopSignal,
    pub stdout: SinkConfig,
    pub stderr: SinkConfig,
}

impl WatcherDefinition {
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            numprocesses: 1,
            max_retry: DEFAULT_MAX_RETRY,
            respawn: true,
            autostart: true,
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            respawn_delay: Duration::ZERO,
            stop_signal: StopSignal::default(),
            stdout: SinkConfig::Log,
            stderr: SinkConfig::Log,
        }
    }

    /// Pipes follow the sinks: a `null` stream gets no pipe at all.
    pub(crate) fn process_spec(&self) -> ProcessSpec {
        let mut spec = self.spec.clone();
        spec.pipe_stdout = self.stdout.wants_pipe();
        spec.pipe_stderr = self.stderr.wants_pipe();
        spec
    }
}
