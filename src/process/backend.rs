// src/process/backend.rs

//! Pluggable OS process interface.
//!
//! Watchers and the arbiter talk to a `ProcessBackend` instead of calling
//! `fork`/`waitpid`/`kill` directly. Production code uses
//! [`super::OsProcessBackend`]; tests provide a scripted implementation that
//! can fail spawns on demand and report exits in a chosen order.

use std::io;

use crate::errors::SpawnError;

use super::{ExitReport, Liveness, Pid, ProcessHandle, ProcessSpec, StopSignal};

/// Trait abstracting process creation, reaping and signalling.
///
/// None of these calls may block the loop thread.
pub trait ProcessBackend {
    /// Launch one process. Pipes are created only for the streams with
    /// `pipe_stdout` / `pipe_stderr` set.
    fn spawn(&mut self, spec: &ProcessSpec) -> Result<ProcessHandle, SpawnError>;

    /// Collect one exited child, if any. `None` is the common case.
    fn wait_any(&mut self) -> Option<ExitReport>;

    /// Check a single pid without blocking, reaping it if it exited.
    fn poll(&mut self, pid: Pid) -> Liveness;

    /// Deliver the graceful stop signal. `Ok(false)` means the process was
    /// already gone.
    fn terminate(&mut self, pid: Pid, signal: StopSignal) -> io::Result<bool>;

    /// Force-kill. `Ok(false)` means the process was already gone.
    fn kill(&mut self, pid: Pid) -> io::Result<bool>;
}
