// src/watcher/mod.rs

//! A named group of identical worker processes and its lifecycle.
//!
//! Every mutating operation takes a [`Supervision`] context (process
//! backend, reactor, command guard) plus the tag of the command it runs
//! under. Each one acquires the guard nested under that tag, so the
//! reconciliation tick and external commands share the exact same code path.

use std::collections::{HashMap, VecDeque};
use std::io;

use tracing::{debug, error, info, trace, warn};

use crate::engine::LoopEvent;
use crate::errors::{Result, SupervisorError};
use crate::guard::{CommandGuard, CommandTag};
use crate::process::{ExitKind, Liveness, Pid, ProcessBackend, ProcessHandle, ProcessStatus};
use crate::reactor::{Reactor, StreamRoute, TimerId};
use crate::stream::{Sink, StreamRedirector};

pub mod definition;
pub mod status;

pub use definition::{DEFAULT_GRACEFUL_TIMEOUT, DEFAULT_MAX_RETRY, WatcherDefinition};
pub use status::{StopProgress, WatcherStatus, WatcherStatusReport};

/// Collaborators a watcher needs to change the world.
pub struct Supervision<'a> {
    pub os: &'a mut dyn ProcessBackend,
    pub reactor: &'a mut dyn Reactor,
    pub guard: &'a CommandGuard,
}

impl<'a> Supervision<'a> {
    pub fn new(
        os: &'a mut dyn ProcessBackend,
        reactor: &'a mut dyn Reactor,
        guard: &'a CommandGuard,
    ) -> Self {
        Self { os, reactor, guard }
    }

    pub fn guard(&self) -> &'a CommandGuard {
        self.guard
    }
}

#[derive(Debug)]
pub struct Watcher {
    def: WatcherDefinition,
    status: WatcherStatus,
    retry_count: u32,
    processes: HashMap<Pid, ProcessHandle>,
    redirector: StreamRedirector,
    grace_timers: HashMap<Pid, TimerId>,
    // Delayed replacements, oldest first; each holds back one slot.
    respawn_timers: VecDeque<TimerId>,
    last_failure: Option<String>,
    restart_pending: bool,
}

impl Watcher {
    /// Build a watcher with the sinks named in its definition.
    pub fn new(def: WatcherDefinition) -> io::Result<Self> {
        let stdout = def.stdout.build()?;
        let stderr = def.stderr.build()?;
        Ok(Self::with_sinks(def, stdout, stderr))
    }

    pub fn with_sinks(def: WatcherDefinition, stdout: Box<dyn Sink>, stderr: Box<dyn Sink>) -> Self {
        let redirector = StreamRedirector::new(def.name.clone(), stdout, stderr);
        Self {
            def,
            status: WatcherStatus::Init,
            retry_count: 0,
            processes: HashMap::new(),
            redirector,
            grace_timers: HashMap::new(),
            respawn_timers: VecDeque::new(),
            last_failure: None,
            restart_pending: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &WatcherDefinition {
        &self.def
    }

    pub fn status(&self) -> WatcherStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn is_restart_pending(&self) -> bool {
        self.restart_pending
    }

    pub fn redirector(&self) -> &StreamRedirector {
        &self.redirector
    }

    pub fn process(&self, pid: Pid) -> Option<&ProcessHandle> {
        self.processes.get(&pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Processes that count towards the target (not yet asked to stop).
    pub fn live_count(&self) -> usize {
        self.processes.values().filter(|p| !p.is_retiring()).count()
    }

    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.processes.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn owns(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn status_report(&self) -> WatcherStatusReport {
        WatcherStatusReport {
            name: self.def.name.clone(),
            status: self.status,
            processes: self.pids(),
            target: self.def.numprocesses,
            retry_count: self.retry_count,
            last_failure: self.last_failure.clone(),
        }
    }

    fn invalid_state(&self, command: &str) -> SupervisorError {
        SupervisorError::InvalidState {
            watcher: self.def.name.clone(),
            state: self.status.to_string(),
            command: command.to_string(),
        }
    }

    pub fn start(&mut self, sv: &mut Supervision<'_>, parent: Option<&CommandTag>) -> Result<()> {
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::under(parent, "watcher_start"))?;

        match self.status {
            WatcherStatus::Active | WatcherStatus::Starting => {
                debug!(watcher = %self.def.name, "already running");
                return Ok(());
            }
            WatcherStatus::Stopping => return Err(self.invalid_state("watcher_start")),
            WatcherStatus::Init | WatcherStatus::Stopped => {}
        }

        info!(
            watcher = %self.def.name,
            target = self.def.numprocesses,
            "starting watcher"
        );
        self.status = WatcherStatus::Starting;
        self.retry_count = 0;
        self.last_failure = None;
        self.redirector.start();
        self.spawn_processes(sv, token.tag())
    }

    /// Processes the watcher should have right now: the target minus the
    /// slots waiting on a respawn timer.
    fn spawn_target(&self) -> usize {
        self.def
            .numprocesses
            .saturating_sub(self.respawn_timers.len())
    }

    pub fn pending_respawns(&self) -> usize {
        self.respawn_timers.len()
    }

    fn spawn_processes(&mut self, sv: &mut Supervision<'_>, parent: &CommandTag) -> Result<()> {
        while self.live_count() < self.spawn_target() {
            if matches!(self.status, WatcherStatus::Stopping | WatcherStatus::Stopped) {
                debug!(watcher = %self.def.name, "stop requested; abandoning spawn loop");
                return Ok(());
            }
            self.spawn_process(sv, Some(parent))?;
        }
        if self.status == WatcherStatus::Starting {
            self.status = WatcherStatus::Active;
        }
        Ok(())
    }

    /// Launch one process, retrying failed launches up to `max_retry` times.
    pub fn spawn_process(
        &mut self,
        sv: &mut Supervision<'_>,
        parent: Option<&CommandTag>,
    ) -> Result<Pid> {
        let guard = sv.guard();
        let _token = guard.acquire(&CommandTag::under(parent, "watcher_spawn_process"))?;

        if matches!(self.status, WatcherStatus::Stopping | WatcherStatus::Stopped) {
            return Err(self.invalid_state("watcher_spawn_process"));
        }
        if self.live_count() >= self.def.numprocesses {
            return Err(SupervisorError::InvalidState {
                watcher: self.def.name.clone(),
                state: format!("at target of {} processes", self.def.numprocesses),
                command: "watcher_spawn_process".to_string(),
            });
        }

        // Redirector goes live before launch so early output is not lost.
        self.redirector.start();
        let spec = self.def.process_spec();

        loop {
            if self.retry_count >= self.def.max_retry {
                return Err(self.give_up(sv));
            }

            let mut handle = match sv.os.spawn(&spec) {
                Ok(handle) => handle,
                Err(err) => {
                    self.retry_count += 1;
                    warn!(
                        watcher = %self.def.name,
                        attempt = self.retry_count,
                        max_retry = self.def.max_retry,
                        error = %err,
                        "spawn failed"
                    );
                    self.last_failure = Some(err.to_string());
                    continue;
                }
            };

            let pid = handle.pid();
            if let Err(e) = self.redirector.add_redirections(sv.reactor, &handle) {
                error!(
                    watcher = %self.def.name,
                    pid,
                    error = %e,
                    "cannot capture output; killing unobserved process"
                );
                if let Err(kill_err) = sv.os.kill(pid) {
                    warn!(watcher = %self.def.name, pid, error = %kill_err, "kill failed");
                }
                handle.close_pipes();
                return Err(e.into());
            }

            handle.set_status(ProcessStatus::Running);
            info!(
                watcher = %self.def.name,
                pid,
                command = %handle.command_line(),
                "spawned process"
            );
            self.processes.insert(pid, handle);
            self.retry_count = 0;
            if matches!(self.status, WatcherStatus::Init | WatcherStatus::Starting) {
                self.status = WatcherStatus::Active;
            }
            return Ok(pid);
        }
    }

    fn give_up(&mut self, sv: &mut Supervision<'_>) -> SupervisorError {
        let attempts = self.retry_count;
        let last_error = self
            .last_failure
            .clone()
            .unwrap_or_else(|| "no launch attempted".to_string());
        error!(
            watcher = %self.def.name,
            attempts,
            error = %last_error,
            "giving up on spawning; stopping watcher"
        );
        self.begin_stop(sv);
        SupervisorError::SpawnExhausted {
            watcher: self.def.name.clone(),
            attempts,
            last_error,
        }
    }

    /// Forget an exited process. Returns `false` if it was already reaped.
    pub fn reap_process(
        &mut self,
        sv: &mut Supervision<'_>,
        pid: Pid,
        exit: ExitKind,
        parent: Option<&CommandTag>,
    ) -> Result<bool> {
        let guard = sv.guard();
        let _token = guard.acquire(&CommandTag::under(parent, "watcher_reap_process"))?;

        let Some(mut handle) = self.processes.remove(&pid) else {
            trace!(watcher = %self.def.name, pid, "already reaped");
            return Ok(false);
        };

        let redirections = self.redirector.remove_redirections(sv.reactor, &handle);
        handle.set_status(ProcessStatus::Exited);
        handle.close_pipes();
        if let Some(timer) = self.grace_timers.remove(&pid) {
            sv.reactor.cancel_timer(timer);
        }

        info!(
            watcher = %self.def.name,
            pid,
            status = %exit,
            redirections,
            "process exited"
        );

        match self.status {
            WatcherStatus::Active if self.def.respawn && !handle.is_retiring() => {
                let timer = sv.reactor.schedule_after(
                    self.def.respawn_delay,
                    LoopEvent::Respawn {
                        watcher: self.def.name.clone(),
                    },
                );
                if !self.def.respawn_delay.is_zero() {
                    self.respawn_timers.push_back(timer);
                }
            }
            WatcherStatus::Stopping if self.processes.is_empty() => self.finish_stop(sv),
            _ => {}
        }
        Ok(true)
    }

    /// Poll every process and reap the ones that exited.
    fn reap_exited(&mut self, sv: &mut Supervision<'_>, parent: &CommandTag) -> Result<()> {
        for pid in self.pids() {
            let liveness = match self.processes.get_mut(&pid) {
                Some(handle) => handle.poll(sv.os),
                None => continue,
            };
            if let Liveness::Exited(kind) = liveness {
                self.reap_process(sv, pid, kind, Some(parent))?;
            }
        }
        Ok(())
    }

    /// One reconciliation pass: reap, bring the count back to target,
    /// finish a pending restart.
    pub fn manage_processes(
        &mut self,
        sv: &mut Supervision<'_>,
        parent: Option<&CommandTag>,
    ) -> Result<()> {
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::under(parent, "watcher_manage_processes"))?;

        self.reap_exited(sv, token.tag())?;

        match self.status {
            WatcherStatus::Active | WatcherStatus::Starting => {
                if self.def.respawn {
                    if self.live_count() < self.spawn_target() {
                        self.status = WatcherStatus::Starting;
                        self.spawn_processes(sv, token.tag())?;
                    }
                } else if self.processes.is_empty() {
                    info!(
                        watcher = %self.def.name,
                        "all processes exited and respawn is off"
                    );
                    self.finish_stop(sv);
                }
            }
            WatcherStatus::Stopped if self.restart_pending => {
                self.restart_pending = false;
                self.start(sv, Some(token.tag()))?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn stop(
        &mut self,
        sv: &mut Supervision<'_>,
        parent: Option<&CommandTag>,
    ) -> Result<StopProgress> {
        let guard = sv.guard();
        let _token = guard.acquire(&CommandTag::under(parent, "watcher_stop"))?;

        self.restart_pending = false;
        Ok(match self.status {
            WatcherStatus::Init | WatcherStatus::Stopped => StopProgress::Stopped,
            WatcherStatus::Stopping => StopProgress::Pending,
            WatcherStatus::Active | WatcherStatus::Starting => self.begin_stop(sv),
        })
    }

    /// A respawn timer fired: release its slot and refill.
    pub fn respawn_due(
        &mut self,
        sv: &mut Supervision<'_>,
        parent: Option<&CommandTag>,
    ) -> Result<()> {
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::under(parent, "watcher_respawn_due"))?;

        if self.respawn_timers.pop_front().is_some() {
            debug!(
                watcher = %self.def.name,
                pending = self.respawn_timers.len(),
                "respawn delay elapsed"
            );
        }
        self.manage_processes(sv, Some(token.tag()))
    }

    /// Stop, then start again once every process is reaped.
    pub fn restart(&mut self, sv: &mut Supervision<'_>, parent: Option<&CommandTag>) -> Result<()> {
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::under(parent, "watcher_restart"))?;

        if self.status.is_idle() {
            return self.start(sv, Some(token.tag()));
        }
        match self.stop(sv, Some(token.tag()))? {
            StopProgress::Stopped => self.start(sv, Some(token.tag())),
            StopProgress::Pending => {
                debug!(watcher = %self.def.name, "restart continues once processes are reaped");
                self.restart_pending = true;
                Ok(())
            }
        }
    }

    pub fn set_numprocesses(
        &mut self,
        sv: &mut Supervision<'_>,
        count: usize,
        parent: Option<&CommandTag>,
    ) -> Result<usize> {
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::under(parent, "watcher_set_numprocesses"))?;

        let previous = self.def.numprocesses;
        self.def.numprocesses = count;
        info!(watcher = %self.def.name, from = previous, to = count, "process count changed");

        if matches!(self.status, WatcherStatus::Active | WatcherStatus::Starting) {
            let live = self.live_count();
            if live > count {
                self.retire_oldest(sv, live - count);
            } else if live < count {
                self.status = WatcherStatus::Starting;
                self.spawn_processes(sv, token.tag())?;
            }
        }
        Ok(count)
    }

    /// Force-kill `pid` after its grace period. Returns `false` if it was
    /// already reaped.
    pub fn kill_straggler(
        &mut self,
        sv: &mut Supervision<'_>,
        pid: Pid,
        parent: Option<&CommandTag>,
    ) -> Result<bool> {
        let guard = sv.guard();
        let _token = guard.acquire(&CommandTag::under(parent, "watcher_kill_process"))?;

        self.grace_timers.remove(&pid);
        if !self.processes.contains_key(&pid) {
            trace!(watcher = %self.def.name, pid, "grace period ended after exit");
            return Ok(false);
        }

        warn!(
            watcher = %self.def.name,
            pid,
            grace = ?self.def.graceful_timeout,
            "process ignored stop signal; killing"
        );
        if let Err(e) = sv.os.kill(pid) {
            warn!(watcher = %self.def.name, pid, error = %e, "kill failed");
        }
        Ok(true)
    }

    /// Hand a chunk of output to the matching sink.
    pub fn deliver_output(&mut self, route: &StreamRoute, data: &[u8]) -> bool {
        self.redirector.deliver(route, data)
    }

    pub fn stream_closed(&mut self, route: &StreamRoute) -> bool {
        self.redirector.stream_closed(route)
    }

    fn retire_oldest(&mut self, sv: &mut Supervision<'_>, count: usize) {
        let mut candidates: Vec<(std::time::SystemTime, Pid)> = self
            .processes
            .values()
            .filter(|p| !p.is_retiring())
            .map(|p| (p.spawned_at(), p.pid()))
            .collect();
        candidates.sort_unstable();

        for (_, pid) in candidates.into_iter().take(count) {
            debug!(watcher = %self.def.name, pid, "retiring process");
            self.terminate_process(sv, pid);
        }
    }

    fn begin_stop(&mut self, sv: &mut Supervision<'_>) -> StopProgress {
        info!(
            watcher = %self.def.name,
            processes = self.processes.len(),
            "stopping watcher"
        );
        self.status = WatcherStatus::Stopping;
        for pid in self.pids() {
            self.terminate_process(sv, pid);
        }
        if self.processes.is_empty() {
            self.finish_stop(sv);
            StopProgress::Stopped
        } else {
            StopProgress::Pending
        }
    }

    fn terminate_process(&mut self, sv: &mut Supervision<'_>, pid: Pid) {
        if self.grace_timers.contains_key(&pid) {
            return;
        }
        let Some(handle) = self.processes.get_mut(&pid) else {
            return;
        };

        handle.mark_retiring();
        match handle.terminate(sv.os, self.def.stop_signal) {
            Ok(true) => debug!(watcher = %self.def.name, pid, signal = ?self.def.stop_signal, "stop signal sent"),
            Ok(false) => debug!(watcher = %self.def.name, pid, "process already gone"),
            Err(e) => warn!(watcher = %self.def.name, pid, error = %e, "could not signal process"),
        }

        let timer = sv.reactor.schedule_after(
            self.def.graceful_timeout,
            LoopEvent::GraceExpired {
                watcher: self.def.name.clone(),
                pid,
            },
        );
        self.grace_timers.insert(pid, timer);
    }

    fn finish_stop(&mut self, sv: &mut Supervision<'_>) {
        for (_, timer) in self.grace_timers.drain() {
            sv.reactor.cancel_timer(timer);
        }
        for timer in self.respawn_timers.drain(..) {
            sv.reactor.cancel_timer(timer);
        }
        self.redirector.stop(sv.reactor);
        self.status = WatcherStatus::Stopped;
        info!(watcher = %self.def.name, "watcher stopped");
    }
}
