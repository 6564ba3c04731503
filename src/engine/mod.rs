// src/engine/mod.rs

//! Supervision engine for procwarden.
//!
//! This module ties together:
//! - the [`Arbiter`], owner of every watcher and of the command guard
//! - the loop queue ([`LoopEvent`]) that reactor callbacks, timers and
//!   control commands all travel through
//! - the main runtime loop that reacts to:
//!   - the periodic reconciliation tick
//!   - pipe output and grace-period timers
//!   - commands from a [`ControlHandle`]
//!   - deferred OS signals
//!
//! The synchronous state machine lives in [`arbiter`]; the async/IO shell is
//! implemented in [`runtime`].

use std::time::Duration;

use tokio::sync::oneshot;

use crate::errors::Result;
use crate::process::Pid;
use crate::reactor::StreamRoute;
use crate::watcher::{WatcherDefinition, WatcherStatusReport};

pub mod arbiter;
pub mod control;
pub mod runtime;

pub use arbiter::Arbiter;
pub use control::ControlHandle;
pub use runtime::Runtime;

pub const DEFAULT_CHECK_DELAY: Duration = Duration::from_secs(1);

/// Arbiter-wide options.
#[derive(Debug, Clone, Copy)]
pub struct ArbiterOptions {
    /// Interval of the reconciliation tick.
    pub check_delay: Duration,
}

impl Default for ArbiterOptions {
    fn default() -> Self {
        Self {
            check_delay: DEFAULT_CHECK_DELAY,
        }
    }
}

/// Everything the loop thread reacts to besides the tick and signals.
#[derive(Debug)]
pub enum LoopEvent {
    /// Bytes read from a redirected pipe.
    Output { route: StreamRoute, data: Vec<u8> },
    /// A redirected pipe reached EOF.
    StreamClosed { route: StreamRoute },
    /// A process did not exit within its grace period.
    GraceExpired { watcher: String, pid: Pid },
    /// A process was reaped and should be replaced.
    Respawn { watcher: String },
    /// A command from the control surface.
    Command {
        command: ControlCommand,
        reply: Option<oneshot::Sender<Result<CommandReply>>>,
    },
}

/// Commands accepted by the arbiter.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    StartWatcher(String),
    StopWatcher(String),
    RestartWatcher(String),
    SetNumProcesses { watcher: String, count: usize },
    StartAll,
    StopAll,
    AddWatcher {
        definition: WatcherDefinition,
        start: bool,
    },
    RemoveWatcher(String),
    Reload,
    Quit,
    Status,
}

impl ControlCommand {
    /// Guard identifier the command runs under.
    pub fn command_id(&self) -> &'static str {
        match self {
            ControlCommand::StartWatcher(_) => "watcher_start",
            ControlCommand::StopWatcher(_) => "watcher_stop",
            ControlCommand::RestartWatcher(_) => "watcher_restart",
            ControlCommand::SetNumProcesses { .. } => "watcher_set_numprocesses",
            ControlCommand::StartAll => "arbiter_start_watchers",
            ControlCommand::StopAll => "arbiter_stop_watchers",
            ControlCommand::AddWatcher { .. } => "arbiter_add_watcher",
            ControlCommand::RemoveWatcher(_) => "arbiter_rm_watcher",
            ControlCommand::Reload => crate::guard::RELOAD_COMMAND,
            ControlCommand::Quit => "arbiter_stop",
            ControlCommand::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Done,
    NumProcesses(usize),
    Status(ArbiterStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterStatus {
    pub watchers: Vec<WatcherStatusReport>,
    pub restarting: bool,
    pub stopping: bool,
}
