// src/process/mod.rs

//! OS process layer.
//!
//! - [`handle`] holds [`ProcessHandle`], the record of one launched process
//!   and the read ends of its stdout/stderr pipes.
//! - [`backend`] defines the [`ProcessBackend`] trait the watchers talk to
//!   (spawn, non-blocking wait, liveness poll, terminate, kill).
//! - [`os`] is the production backend built on `std::process` + `nix`.
//!
//! Tests swap in a scripted backend so spawn failures, exits and pid races
//! can be reproduced deterministically.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use nix::sys::signal::Signal;
use serde::Deserialize;

pub mod backend;
pub mod handle;
pub mod os;

pub use backend::ProcessBackend;
pub use handle::{ProcessHandle, ProcessStatus, StreamName, StreamPipe};
pub use os::OsProcessBackend;

/// OS process identifier.
pub type Pid = u32;

/// How the command line is handed to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// `cmd` is executed directly with `args` as argv.
    #[default]
    Direct,
    /// `cmd` and `args` are joined and run through `sh -c`.
    Shell,
}

/// Everything needed to launch one process of a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub cmd: String,
    pub args: Vec<String>,
    pub mode: LaunchMode,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Request a stdout pipe (only when output is redirected somewhere).
    pub pipe_stdout: bool,
    /// Request a stderr pipe.
    pub pipe_stderr: bool,
}

impl ProcessSpec {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            mode: LaunchMode::Direct,
            working_dir: None,
            env: BTreeMap::new(),
            pipe_stdout: true,
            pipe_stderr: true,
        }
    }

    /// Human-readable command line (also what `sh -c` receives).
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.cmd.clone()
        } else {
            format!("{} {}", self.cmd, self.args.join(" "))
        }
    }
}

/// Signal used to ask a process to stop gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StopSignal {
    #[default]
    Term,
    Int,
    Quit,
    Hup,
    Kill,
    Usr1,
    Usr2,
}

impl StopSignal {
    pub fn as_nix(self) -> Signal {
        match self {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Quit => Signal::SIGQUIT,
            StopSignal::Hup => Signal::SIGHUP,
            StopSignal::Kill => Signal::SIGKILL,
            StopSignal::Usr1 => Signal::SIGUSR1,
            StopSignal::Usr2 => Signal::SIGUSR2,
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
    /// The exit status was consumed elsewhere (e.g. by a wait on any child
    /// that did not know the pid yet).
    Unknown,
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Exited(code) => write!(f, "exit code {code}"),
            ExitKind::Signaled(sig) => write!(f, "killed by signal {sig}"),
            ExitKind::Unknown => f.write_str("unknown status"),
        }
    }
}

/// One exited child as reported by a non-blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub pid: Pid,
    pub status: ExitKind,
}

/// Result of polling a single process without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(ExitKind),
    Unknown,
}
