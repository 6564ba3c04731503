// src/config/validate.rs

use std::time::Duration;

use crate::config::duration::parse_duration;
use crate::config::model::{ConfigFile, RawConfigFile, StreamTarget, WatcherConfig};
use crate::engine::ArbiterOptions;
use crate::errors::{Result, SupervisorError};
use crate::process::{LaunchMode, ProcessSpec};
use crate::stream::SinkConfig;
use crate::watcher::WatcherDefinition;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = SupervisorError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_watchers(&raw)?;

        let check_delay = duration_field("[arbiter].check_delay", &raw.arbiter.check_delay)?;
        if check_delay.is_zero() {
            return Err(SupervisorError::ConfigError(
                "[arbiter].check_delay must be greater than zero".to_string(),
            ));
        }
        let graceful_timeout =
            duration_field("[arbiter].graceful_timeout", &raw.arbiter.graceful_timeout)?;
        let respawn_delay = duration_field("[arbiter].respawn_delay", &raw.arbiter.respawn_delay)?;

        let watchers = raw
            .watcher
            .iter()
            .map(|(name, cfg)| build_watcher(name, cfg, graceful_timeout, respawn_delay))
            .collect::<Result<Vec<_>>>()?;

        Ok(ConfigFile::new_unchecked(
            ArbiterOptions { check_delay },
            watchers,
        ))
    }
}

fn ensure_has_watchers(cfg: &RawConfigFile) -> Result<()> {
    if cfg.watcher.is_empty() {
        return Err(SupervisorError::ConfigError(
            "config must contain at least one [watcher.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn duration_field(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| SupervisorError::ConfigError(format!("{field}: {e}")))
}

fn sink_for(
    watcher: &str,
    stream: &str,
    target: StreamTarget,
    path: Option<&std::path::PathBuf>,
) -> Result<SinkConfig> {
    match (target, path) {
        (StreamTarget::Log, _) => Ok(SinkConfig::Log),
        (StreamTarget::Null, _) => Ok(SinkConfig::Null),
        (StreamTarget::File, Some(path)) => Ok(SinkConfig::File(path.clone())),
        (StreamTarget::File, None) => Err(SupervisorError::ConfigError(format!(
            "watcher '{watcher}' sends {stream} to a file but has no {stream}_file"
        ))),
    }
}

fn build_watcher(
    name: &str,
    cfg: &WatcherConfig,
    default_graceful_timeout: Duration,
    respawn_delay: Duration,
) -> Result<WatcherDefinition> {
    if name.trim().is_empty() || name.contains('/') {
        return Err(SupervisorError::ConfigError(format!(
            "invalid watcher name '{name}'"
        )));
    }
    if cfg.cmd.trim().is_empty() {
        return Err(SupervisorError::ConfigError(format!(
            "watcher '{name}' has an empty cmd"
        )));
    }
    if cfg.max_retry == 0 {
        return Err(SupervisorError::ConfigError(format!(
            "watcher '{name}': max_retry must be >= 1 (got 0)"
        )));
    }

    let graceful_timeout = match &cfg.graceful_timeout {
        Some(value) => duration_field(&format!("[watcher.{name}].graceful_timeout"), value)?,
        None => default_graceful_timeout,
    };

    let spec = ProcessSpec {
        cmd: cfg.cmd.clone(),
        args: cfg.args.clone(),
        mode: if cfg.shell {
            LaunchMode::Shell
        } else {
            LaunchMode::Direct
        },
        working_dir: cfg.working_dir.clone(),
        env: cfg.env.clone(),
        pipe_stdout: true,
        pipe_stderr: true,
    };

    Ok(WatcherDefinition {
        name: name.to_string(),
        spec,
        numprocesses: cfg.numprocesses,
        max_retry: cfg.max_retry,
        respawn: cfg.respawn,
        autostart: cfg.autostart,
        graceful_timeout,
        respawn_delay,
        stop_signal: cfg.stop_signal,
        stdout: sink_for(name, "stdout", cfg.stdout, cfg.stdout_file.as_ref())?,
        stderr: sink_for(name, "stderr", cfg.stderr, cfg.stderr_file.as_ref())?,
    })
}
