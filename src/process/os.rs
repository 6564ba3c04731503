// src/process/os.rs

//! Production process backend.
//!
//! Children are launched with `std::process::Command`; only the read ends of
//! their pipes are kept (as owned descriptors) and the `Child` value itself is
//! dropped. Reaping goes through `waitpid(WNOHANG)` so the loop thread never
//! blocks.

use std::io;
use std::os::fd::OwnedFd;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid as NixPid;
use tracing::{debug, trace, warn};

use crate::errors::SpawnError;

use super::{
    ExitKind, ExitReport, LaunchMode, Liveness, Pid, ProcessBackend, ProcessHandle, ProcessSpec,
    StopSignal, StreamPipe,
};

#[derive(Debug, Default)]
pub struct OsProcessBackend;

impl OsProcessBackend {
    pub fn new() -> Self {
        Self
    }

    fn build_command(spec: &ProcessSpec) -> Command {
        let mut cmd = match spec.mode {
            LaunchMode::Direct => {
                let mut c = Command::new(&spec.cmd);
                c.args(&spec.args);
                c
            }
            LaunchMode::Shell => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(spec.command_line());
                c
            }
        };

        cmd.stdin(Stdio::null());
        cmd.stdout(if spec.pipe_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if spec.pipe_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&spec.env);
        cmd
    }

    fn signal(pid: Pid, sig: Signal) -> io::Result<bool> {
        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))?;
        match signal::kill(NixPid::from_raw(raw), sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => {
                debug!(pid, signal = %sig, "process already gone");
                Ok(false)
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

fn exit_report(status: WaitStatus) -> Option<ExitReport> {
    match status {
        WaitStatus::Exited(pid, code) => Some(ExitReport {
            pid: pid.as_raw() as Pid,
            status: ExitKind::Exited(code),
        }),
        WaitStatus::Signaled(pid, sig, _) => Some(ExitReport {
            pid: pid.as_raw() as Pid,
            status: ExitKind::Signaled(sig as i32),
        }),
        _ => None,
    }
}

impl ProcessBackend for OsProcessBackend {
    fn spawn(&mut self, spec: &ProcessSpec) -> Result<ProcessHandle, SpawnError> {
        let command_line = spec.command_line();
        let mut child = Self::build_command(spec)
            .spawn()
            .map_err(|e| SpawnError::new(command_line.clone(), e))?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .map(|out| StreamPipe::owned(OwnedFd::from(out)));
        let stderr = child
            .stderr
            .take()
            .map(|err| StreamPipe::owned(OwnedFd::from(err)));

        trace!(pid, command = %command_line, "child launched");

        // Dropping `Child` neither kills nor waits; reaping happens via waitpid.
        drop(child);

        Ok(ProcessHandle::new(
            pid,
            command_line,
            spec.working_dir.clone(),
            stdout,
            stderr,
        ))
    }

    fn wait_any(&mut self) -> Option<ExitReport> {
        loop {
            match waitpid(NixPid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return None,
                Ok(status) => {
                    if let Some(report) = exit_report(status) {
                        return Some(report);
                    }
                    // Stop/continue notifications are not exits.
                    trace!(?status, "ignoring non-exit wait status");
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return None,
                Err(e) => {
                    warn!(error = %e, "waitpid(-1) failed");
                    return None;
                }
            }
        }
    }

    fn poll(&mut self, pid: Pid) -> Liveness {
        let Ok(raw) = i32::try_from(pid) else {
            return Liveness::Unknown;
        };
        loop {
            match waitpid(NixPid::from_raw(raw), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Liveness::Running,
                Ok(status) => match exit_report(status) {
                    Some(report) => return Liveness::Exited(report.status),
                    None => return Liveness::Running,
                },
                Err(Errno::EINTR) => continue,
                // Someone else already collected it.
                Err(Errno::ECHILD) => return Liveness::Exited(ExitKind::Unknown),
                Err(e) => {
                    debug!(pid, error = %e, "waitpid failed");
                    return Liveness::Unknown;
                }
            }
        }
    }

    fn terminate(&mut self, pid: Pid, signal: StopSignal) -> io::Result<bool> {
        Self::signal(pid, signal.as_nix())
    }

    fn kill(&mut self, pid: Pid) -> io::Result<bool> {
        Self::signal(pid, Signal::SIGKILL)
    }
}
