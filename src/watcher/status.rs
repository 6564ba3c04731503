// src/watcher/status.rs

use std::fmt;

use crate::process::Pid;

/// Externally visible lifecycle of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatcherStatus {
    Init,
    Starting,
    Active,
    Stopping,
    Stopped,
}

impl WatcherStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WatcherStatus::Init => "init",
            WatcherStatus::Starting => "starting",
            WatcherStatus::Active => "active",
            WatcherStatus::Stopping => "stopping",
            WatcherStatus::Stopped => "stopped",
        }
    }

    /// Init or Stopped: nothing running and nothing in flight.
    pub fn is_idle(self) -> bool {
        matches!(self, WatcherStatus::Init | WatcherStatus::Stopped)
    }
}

impl fmt::Display for WatcherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopProgress {
    /// Every process is reaped and the watcher is Stopped.
    Stopped,
    /// Processes were signalled; the tick and grace timers finish the job.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherStatusReport {
    pub name: String,
    pub status: WatcherStatus,
    pub processes: Vec<Pid>,
    pub target: usize,
    pub retry_count: u32,
    pub last_failure: Option<String>,
}
