use std::collections::{HashSet, VecDeque};
use std::io;
use std::os::fd::RawFd;

use procwarden::errors::SpawnError;
use procwarden::process::{
    ExitKind, ExitReport, Liveness, Pid, ProcessBackend, ProcessHandle, ProcessSpec, StopSignal,
    StreamPipe,
};

/// Scripted process backend.
///
/// - `spawn` hands out increasing pids and descriptor numbers, or fails
///   on demand.
/// - Exits are queued with [`FakeProcessBackend::exit`] and surface through
///   `wait_any` (or `poll`, whichever asks first).
/// - `terminate`/`kill` are recorded; optionally they make the process exit.
#[derive(Debug)]
pub struct FakeProcessBackend {
    next_pid: Pid,
    next_fd: RawFd,
    fd_plan: VecDeque<(RawFd, RawFd)>,
    failures_left: usize,
    always_fail: bool,
    spawn_attempts: usize,
    spawned: Vec<Pid>,
    specs: Vec<ProcessSpec>,
    alive: HashSet<Pid>,
    exited: VecDeque<ExitReport>,
    reaped: HashSet<Pid>,
    terminated: Vec<(Pid, StopSignal)>,
    killed: Vec<Pid>,
    exit_on_terminate: bool,
}

impl Default for FakeProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcessBackend {
    pub fn new() -> Self {
        Self {
            next_pid: 1000,
            next_fd: 20,
            fd_plan: VecDeque::new(),
            failures_left: 0,
            always_fail: false,
            spawn_attempts: 0,
            spawned: Vec::new(),
            specs: Vec::new(),
            alive: HashSet::new(),
            exited: VecDeque::new(),
            reaped: HashSet::new(),
            terminated: Vec::new(),
            killed: Vec::new(),
            exit_on_terminate: false,
        }
    }

    /// Fail the next `n` spawn attempts.
    pub fn fail_next_spawns(&mut self, n: usize) {
        self.failures_left = n;
    }

    pub fn fail_all_spawns(&mut self, on: bool) {
        self.always_fail = on;
    }

    /// Processes exit as soon as they receive their stop signal.
    pub fn exit_on_terminate(&mut self, on: bool) {
        self.exit_on_terminate = on;
    }

    /// Use these `(stdout, stderr)` descriptor numbers for the next spawns,
    /// e.g. to reproduce descriptor reuse.
    pub fn plan_fds(&mut self, pairs: impl IntoIterator<Item = (RawFd, RawFd)>) {
        self.fd_plan.extend(pairs);
    }

    /// Mark `pid` as exited; the status is collected by the next wait.
    pub fn exit(&mut self, pid: Pid, status: ExitKind) {
        if self.alive.remove(&pid) {
            self.exited.push_back(ExitReport { pid, status });
        }
    }

    /// `pid` exited and its status was consumed by someone else; only an
    /// explicit poll notices it.
    pub fn exit_unobserved(&mut self, pid: Pid) {
        if self.alive.remove(&pid) {
            self.reaped.insert(pid);
        }
    }

    /// Queue an exit report for a pid nobody spawned through this backend.
    pub fn report_foreign_exit(&mut self, pid: Pid, status: ExitKind) {
        self.exited.push_back(ExitReport { pid, status });
    }

    pub fn spawn_attempts(&self) -> usize {
        self.spawn_attempts
    }

    pub fn spawned(&self) -> &[Pid] {
        &self.spawned
    }

    pub fn last_spec(&self) -> Option<&ProcessSpec> {
        self.specs.last()
    }

    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }

    pub fn terminated(&self) -> &[(Pid, StopSignal)] {
        &self.terminated
    }

    pub fn killed(&self) -> &[Pid] {
        &self.killed
    }

    fn next_fd(&mut self) -> RawFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }
}

impl ProcessBackend for FakeProcessBackend {
    fn spawn(&mut self, spec: &ProcessSpec) -> Result<ProcessHandle, SpawnError> {
        self.spawn_attempts += 1;
        self.specs.push(spec.clone());

        if self.always_fail || self.failures_left > 0 {
            self.failures_left = self.failures_left.saturating_sub(1);
            return Err(SpawnError::new(
                spec.command_line(),
                io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            ));
        }

        let pid = self.next_pid;
        self.next_pid += 1;

        let (out_fd, err_fd) = match self.fd_plan.pop_front() {
            Some(pair) => pair,
            None => (self.next_fd(), self.next_fd()),
        };
        let stdout = spec.pipe_stdout.then(|| StreamPipe::from_raw_number(out_fd));
        let stderr = spec.pipe_stderr.then(|| StreamPipe::from_raw_number(err_fd));

        self.alive.insert(pid);
        self.spawned.push(pid);
        Ok(ProcessHandle::new(
            pid,
            spec.command_line(),
            spec.working_dir.clone(),
            stdout,
            stderr,
        ))
    }

    fn wait_any(&mut self) -> Option<ExitReport> {
        let report = self.exited.pop_front()?;
        self.reaped.insert(report.pid);
        Some(report)
    }

    fn poll(&mut self, pid: Pid) -> Liveness {
        if self.alive.contains(&pid) {
            return Liveness::Running;
        }
        if let Some(pos) = self.exited.iter().position(|r| r.pid == pid) {
            if let Some(report) = self.exited.remove(pos) {
                self.reaped.insert(pid);
                return Liveness::Exited(report.status);
            }
        }
        if self.reaped.contains(&pid) {
            return Liveness::Exited(ExitKind::Unknown);
        }
        Liveness::Unknown
    }

    fn terminate(&mut self, pid: Pid, signal: StopSignal) -> io::Result<bool> {
        self.terminated.push((pid, signal));
        let alive = self.alive.contains(&pid);
        if alive && self.exit_on_terminate {
            self.exit(pid, ExitKind::Signaled(signal.as_nix() as i32));
        }
        Ok(alive)
    }

    fn kill(&mut self, pid: Pid) -> io::Result<bool> {
        self.killed.push(pid);
        let alive = self.alive.contains(&pid);
        if alive {
            self.exit(pid, ExitKind::Signaled(9));
        }
        Ok(alive)
    }
}
