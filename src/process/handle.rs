// src/process/handle.rs

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::SystemTime;

use super::{Liveness, Pid, ProcessBackend, StopSignal};

/// Which standard stream a pipe carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read end of a child's output pipe.
///
/// The descriptor number is only meaningful while the pipe is open: once
/// [`ProcessHandle::close_pipes`] runs, the OS may hand the same number to
/// an unrelated pipe.
#[derive(Debug)]
pub struct StreamPipe {
    fd: RawFd,
    // Closed on drop.
    _owner: Option<OwnedFd>,
}

impl StreamPipe {
    pub fn owned(fd: OwnedFd) -> Self {
        Self {
            fd: fd.as_raw_fd(),
            _owner: Some(fd),
        }
    }

    /// A pipe known only by its descriptor number, for backends that do not
    /// own real descriptors (simulations, tests).
    pub fn from_raw_number(fd: RawFd) -> Self {
        Self { fd, _owner: None }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Liveness of a process as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Spawning,
    Running,
    Exited,
    Unknown,
}

/// One launched OS process, owned by exactly one watcher.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    command_line: String,
    working_dir: Option<PathBuf>,
    stdout: Option<StreamPipe>,
    stderr: Option<StreamPipe>,
    spawned_at: SystemTime,
    status: ProcessStatus,
    /// Set once the process was asked to stop; it no longer counts towards
    /// the watcher's target.
    retiring: bool,
}

impl ProcessHandle {
    pub fn new(
        pid: Pid,
        command_line: impl Into<String>,
        working_dir: Option<PathBuf>,
        stdout: Option<StreamPipe>,
        stderr: Option<StreamPipe>,
    ) -> Self {
        Self {
            pid,
            command_line: command_line.into(),
            working_dir,
            stdout,
            stderr,
            spawned_at: SystemTime::now(),
            status: ProcessStatus::Spawning,
            retiring: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    pub fn spawned_at(&self) -> SystemTime {
        self.spawned_at
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ProcessStatus) {
        self.status = status;
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring
    }

    pub fn mark_retiring(&mut self) {
        self.retiring = true;
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(StreamPipe::fd)
    }

    pub fn stderr_fd(&self) -> Option<RawFd> {
        self.stderr.as_ref().map(StreamPipe::fd)
    }

    /// Configured pipes as `(stream, descriptor)` pairs.
    pub fn pipes(&self) -> Vec<(StreamName, RawFd)> {
        let mut out = Vec::with_capacity(2);
        if let Some(fd) = self.stdout_fd() {
            out.push((StreamName::Stdout, fd));
        }
        if let Some(fd) = self.stderr_fd() {
            out.push((StreamName::Stderr, fd));
        }
        out
    }

    /// Close both pipe read ends. After this the descriptor numbers must not
    /// be used to identify this process again.
    pub fn close_pipes(&mut self) {
        self.stdout = None;
        self.stderr = None;
    }

    /// Non-blocking liveness check; updates the cached status.
    pub fn poll(&mut self, os: &mut dyn ProcessBackend) -> Liveness {
        let liveness = os.poll(self.pid);
        self.status = match liveness {
            Liveness::Running => ProcessStatus::Running,
            Liveness::Exited(_) => ProcessStatus::Exited,
            Liveness::Unknown => ProcessStatus::Unknown,
        };
        liveness
    }

    /// Ask the process to stop. Returns `false` if it was already gone.
    pub fn terminate(&self, os: &mut dyn ProcessBackend, signal: StopSignal) -> std::io::Result<bool> {
        os.terminate(self.pid, signal)
    }
}
