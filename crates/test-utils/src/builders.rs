#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use procwarden::config::{ArbiterSection, ConfigFile, RawConfigFile, StreamTarget, WatcherConfig};
use procwarden::process::{ProcessSpec, StopSignal};
use procwarden::stream::SinkConfig;
use procwarden::watcher::{Watcher, WatcherDefinition};

use crate::sinks::CollectingSink;

/// Builder for `ConfigFile` going through the same validation as a real
/// TOML file.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                arbiter: ArbiterSection::default(),
                watcher: BTreeMap::new(),
            },
        }
    }

    pub fn check_delay(mut self, value: &str) -> Self {
        self.config.arbiter.check_delay = value.to_string();
        self
    }

    pub fn with_watcher(mut self, name: &str, cmd: &str) -> Self {
        self.config.watcher.insert(name.to_string(), watcher_config(cmd));
        self
    }

    pub fn with_watcher_config(mut self, name: &str, cfg: WatcherConfig) -> Self {
        self.config.watcher.insert(name.to_string(), cfg);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A `[watcher.<name>]` section with every optional field at its default.
pub fn watcher_config(cmd: &str) -> WatcherConfig {
    WatcherConfig {
        cmd: cmd.to_string(),
        args: vec![],
        shell: false,
        working_dir: None,
        env: BTreeMap::new(),
        numprocesses: 1,
        max_retry: 5,
        respawn: true,
        autostart: true,
        graceful_timeout: None,
        stop_signal: StopSignal::Term,
        stdout: StreamTarget::Log,
        stderr: StreamTarget::Log,
        stdout_file: None,
        stderr_file: None,
    }
}

/// Builder for `WatcherDefinition` (and ready-made `Watcher`s).
pub struct WatcherBuilder {
    def: WatcherDefinition,
}

impl WatcherBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            def: WatcherDefinition::new(name, ProcessSpec::new("worker")),
        }
    }

    pub fn cmd(mut self, cmd: &str) -> Self {
        self.def.spec.cmd = cmd.to_string();
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.def.spec.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn numprocesses(mut self, n: usize) -> Self {
        self.def.numprocesses = n;
        self
    }

    pub fn max_retry(mut self, n: u32) -> Self {
        self.def.max_retry = n;
        self
    }

    pub fn respawn(mut self, on: bool) -> Self {
        self.def.respawn = on;
        self
    }

    pub fn autostart(mut self, on: bool) -> Self {
        self.def.autostart = on;
        self
    }

    pub fn graceful_timeout(mut self, timeout: Duration) -> Self {
        self.def.graceful_timeout = timeout;
        self
    }

    pub fn respawn_delay(mut self, delay: Duration) -> Self {
        self.def.respawn_delay = delay;
        self
    }

    pub fn stop_signal(mut self, signal: StopSignal) -> Self {
        self.def.stop_signal = signal;
        self
    }

    pub fn stdout(mut self, sink: SinkConfig) -> Self {
        self.def.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: SinkConfig) -> Self {
        self.def.stderr = sink;
        self
    }

    pub fn definition(self) -> WatcherDefinition {
        self.def
    }

    /// Watcher whose output lands in `sink` (both streams).
    pub fn build_with_sink(self, sink: &CollectingSink) -> Watcher {
        Watcher::with_sinks(self.def, sink.boxed(), sink.boxed())
    }

    pub fn build(self) -> Watcher {
        let sink = CollectingSink::new();
        self.build_with_sink(&sink)
    }
}
