// src/engine/arbiter.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use tracing::{debug, error, info, trace, warn};

use crate::config::model::ConfigFile;
use crate::errors::{Result, SupervisorError};
use crate::guard::{CommandGuard, CommandTag, Origin, RELOAD_COMMAND};
use crate::process::{Pid, ProcessBackend};
use crate::reactor::Reactor;
use crate::signals::{SignalAction, signal_name};
use crate::watcher::{StopProgress, Supervision, Watcher, WatcherDefinition, WatcherStatus};

use super::{ArbiterOptions, ArbiterStatus, CommandReply, ControlCommand, LoopEvent};

const MANAGE_WATCHERS: &str = "manage_watchers";
const WATCHER_KILL: &str = "watcher_kill";
const WATCHER_RESPAWN: &str = "watcher_respawn";

/// Owner of every watcher, the command guard and the process/reactor
/// collaborators.
///
/// Everything here runs synchronously on the loop thread; the async shell
/// ([`super::Runtime`]) only decides *when* to call in.
pub struct Arbiter<P: ProcessBackend, R: Reactor> {
    watchers: BTreeMap<String, Watcher>,
    guard: CommandGuard,
    os: P,
    reactor: R,
    options: ArbiterOptions,
    stopping: bool,
    pending_removal: BTreeSet<String>,
}

impl<P: ProcessBackend, R: Reactor> fmt::Debug for Arbiter<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arbiter")
            .field("watchers", &self.watchers.keys().collect::<Vec<_>>())
            .field("guard", &self.guard)
            .field("options", &self.options)
            .field("stopping", &self.stopping)
            .finish_non_exhaustive()
    }
}

fn find<'w>(watchers: &'w mut BTreeMap<String, Watcher>, name: &str) -> Result<&'w mut Watcher> {
    watchers
        .get_mut(name)
        .ok_or_else(|| SupervisorError::WatcherNotFound(name.to_string()))
}

/// Collect exited children and hand them to their watchers.
///
/// The pid → watcher snapshot is taken before waiting; a child reported by
/// the wait but absent from the snapshot is skipped and picked up by its
/// watcher's own poll on a later pass.
fn reap_processes(
    watchers: &mut BTreeMap<String, Watcher>,
    sv: &mut Supervision<'_>,
    parent: &CommandTag,
) {
    let snapshot: HashMap<Pid, String> = watchers
        .iter()
        .flat_map(|(name, w)| w.pids().into_iter().map(move |pid| (pid, name.clone())))
        .collect();

    while let Some(report) = sv.os.wait_any() {
        let Some(name) = snapshot.get(&report.pid) else {
            debug!(pid = report.pid, "exited child not in snapshot; deferring");
            continue;
        };
        let Some(watcher) = watchers.get_mut(name) else {
            continue;
        };
        if let Err(e) = watcher.reap_process(sv, report.pid, report.status, Some(parent)) {
            warn!(watcher = %name, pid = report.pid, error = %e, "reap failed");
        }
    }
}

impl<P: ProcessBackend, R: Reactor> Arbiter<P, R> {
    pub fn new(os: P, reactor: R, options: ArbiterOptions) -> Self {
        Self {
            watchers: BTreeMap::new(),
            guard: CommandGuard::new(),
            os,
            reactor,
            options,
            stopping: false,
            pending_removal: BTreeSet::new(),
        }
    }

    /// Build an arbiter holding one (not yet started) watcher per config
    /// entry.
    pub fn from_config(config: &ConfigFile, os: P, reactor: R) -> Result<Self> {
        let mut arbiter = Self::new(os, reactor, config.arbiter);
        for def in &config.watchers {
            let watcher = Watcher::new(def.clone())?;
            arbiter.watchers.insert(def.name.clone(), watcher);
        }
        Ok(arbiter)
    }

    fn parts(&mut self) -> (&mut BTreeMap<String, Watcher>, Supervision<'_>) {
        (
            &mut self.watchers,
            Supervision::new(&mut self.os, &mut self.reactor, &self.guard),
        )
    }

    pub fn options(&self) -> ArbiterOptions {
        self.options
    }

    pub fn guard(&self) -> &CommandGuard {
        &self.guard
    }

    pub fn os(&self) -> &P {
        &self.os
    }

    pub fn os_mut(&mut self) -> &mut P {
        &mut self.os
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    pub fn watcher(&self, name: &str) -> Option<&Watcher> {
        self.watchers.get(name)
    }

    pub fn watcher_names(&self) -> Vec<String> {
        self.watchers.keys().cloned().collect()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Quit was requested and every watcher has come to rest.
    pub fn is_finished(&self) -> bool {
        self.stopping && self.watchers.values().all(|w| w.status().is_idle())
    }

    pub fn status(&self) -> ArbiterStatus {
        ArbiterStatus {
            watchers: self.watchers.values().map(Watcher::status_report).collect(),
            restarting: self.guard.is_restarting(),
            stopping: self.stopping,
        }
    }

    /// Reconciliation tick: reap exited children, then let every watcher
    /// converge on its target. Runs under its own internal root.
    pub fn manage_watchers(&mut self) -> Result<()> {
        {
            let (watchers, mut sv) = self.parts();
            let guard = sv.guard();
            let token = guard.acquire(&CommandTag::internal(MANAGE_WATCHERS))?;

            reap_processes(watchers, &mut sv, token.tag());

            for (name, watcher) in watchers.iter_mut() {
                if let Err(e) = watcher.manage_processes(&mut sv, Some(token.tag())) {
                    warn!(watcher = %name, error = %e, "maintenance failed");
                }
            }
        }

        self.drop_removed_watchers();
        self.settle_reload();
        Ok(())
    }

    fn drop_removed_watchers(&mut self) {
        let watchers = &mut self.watchers;
        self.pending_removal.retain(|name| match watchers.get(name) {
            Some(w) if w.status().is_idle() => {
                watchers.remove(name);
                info!(watcher = %name, "watcher removed");
                false
            }
            Some(_) => true,
            None => false,
        });
    }

    fn settle_reload(&mut self) {
        if !self.guard.is_restarting() {
            return;
        }
        let settled = self
            .watchers
            .values()
            .all(|w| !w.is_restart_pending() && w.status() != WatcherStatus::Stopping);
        if settled {
            self.guard.set_restarting(false);
            info!("reload complete");
        }
    }

    /// Start every watcher flagged `autostart`.
    pub fn boot(&mut self) -> Result<()> {
        let tag = CommandTag::internal("arbiter_start_watchers");
        self.start_matching(&tag, |w| w.definition().autostart)
    }

    pub fn start_watchers(&mut self, origin: Origin) -> Result<()> {
        let tag = CommandTag::new("arbiter_start_watchers", origin);
        self.start_matching(&tag, |_| true)
    }

    fn start_matching(&mut self, tag: &CommandTag, filter: impl Fn(&Watcher) -> bool) -> Result<()> {
        let (watchers, mut sv) = self.parts();
        let guard = sv.guard();
        let token = guard.acquire(tag)?;

        let mut first_error = None;
        for (name, watcher) in watchers.iter_mut().filter(|(_, w)| filter(w)) {
            if let Err(e) = watcher.start(&mut sv, Some(token.tag())) {
                error!(watcher = %name, error = %e, "could not start watcher");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn stop_watchers(&mut self, origin: Origin) -> Result<()> {
        let (watchers, mut sv) = self.parts();
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::new("arbiter_stop_watchers", origin))?;

        for (name, watcher) in watchers.iter_mut() {
            if let Err(e) = watcher.stop(&mut sv, Some(token.tag())) {
                warn!(watcher = %name, error = %e, "could not stop watcher");
            }
        }
        Ok(())
    }

    pub fn start_watcher(&mut self, name: &str, origin: Origin) -> Result<()> {
        let (watchers, mut sv) = self.parts();
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::new("watcher_start", origin))?;
        find(watchers, name)?.start(&mut sv, Some(token.tag()))
    }

    pub fn stop_watcher(&mut self, name: &str, origin: Origin) -> Result<StopProgress> {
        let (watchers, mut sv) = self.parts();
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::new("watcher_stop", origin))?;
        find(watchers, name)?.stop(&mut sv, Some(token.tag()))
    }

    pub fn restart_watcher(&mut self, name: &str, origin: Origin) -> Result<()> {
        let (watchers, mut sv) = self.parts();
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::new("watcher_restart", origin))?;
        find(watchers, name)?.restart(&mut sv, Some(token.tag()))
    }

    pub fn set_numprocesses(&mut self, name: &str, count: usize, origin: Origin) -> Result<usize> {
        let (watchers, mut sv) = self.parts();
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::new("watcher_set_numprocesses", origin))?;
        find(watchers, name)?.set_numprocesses(&mut sv, count, Some(token.tag()))
    }

    pub fn add_watcher(&mut self, def: WatcherDefinition, start: bool, origin: Origin) -> Result<()> {
        let watcher = Watcher::new(def)?;
        self.adopt_watcher(watcher, start, origin)
    }

    /// Add an already built watcher (e.g. one with custom sinks).
    pub fn adopt_watcher(&mut self, mut watcher: Watcher, start: bool, origin: Origin) -> Result<()> {
        let (watchers, mut sv) = self.parts();
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::new("arbiter_add_watcher", origin))?;

        let name = watcher.name().to_string();
        if watchers.contains_key(&name) {
            return Err(SupervisorError::WatcherExists(name));
        }
        info!(watcher = %name, "watcher added");
        let result = if start {
            watcher.start(&mut sv, Some(token.tag()))
        } else {
            Ok(())
        };
        watchers.insert(name, watcher);
        result
    }

    /// Stop a watcher and forget it once every process is reaped.
    pub fn remove_watcher(&mut self, name: &str, origin: Origin) -> Result<()> {
        let progress = {
            let (watchers, mut sv) = self.parts();
            let guard = sv.guard();
            let token = guard.acquire(&CommandTag::new("arbiter_rm_watcher", origin))?;
            find(watchers, name)?.stop(&mut sv, Some(token.tag()))?
        };

        match progress {
            StopProgress::Stopped => {
                self.watchers.remove(name);
                self.pending_removal.remove(name);
                info!(watcher = %name, "watcher removed");
            }
            StopProgress::Pending => {
                debug!(watcher = %name, "watcher removal waits for its processes");
                self.pending_removal.insert(name.to_string());
            }
        }
        Ok(())
    }

    /// Graceful reload: restart every watcher. While it runs, other external
    /// commands are rejected.
    pub fn reload(&mut self, origin: Origin) -> Result<()> {
        {
            let (watchers, mut sv) = self.parts();
            let guard = sv.guard();
            let token = guard.acquire(&CommandTag::new(RELOAD_COMMAND, origin))?;

            info!(watchers = watchers.len(), "reloading");
            guard.set_restarting(true);
            for (name, watcher) in watchers.iter_mut() {
                if let Err(e) = watcher.restart(&mut sv, Some(token.tag())) {
                    error!(watcher = %name, error = %e, "restart failed during reload");
                }
            }
        }
        self.settle_reload();
        Ok(())
    }

    /// Stop everything; the loop exits once [`Self::is_finished`] holds.
    pub fn quit(&mut self, origin: Origin) -> Result<()> {
        let (watchers, mut sv) = self.parts();
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::new("arbiter_stop", origin))?;

        info!("arbiter stopping");
        for (name, watcher) in watchers.iter_mut() {
            if let Err(e) = watcher.stop(&mut sv, Some(token.tag())) {
                warn!(watcher = %name, error = %e, "could not stop watcher");
            }
        }
        drop(token);
        self.stopping = true;
        self.settle_reload();
        Ok(())
    }

    fn kill_straggler(&mut self, name: &str, pid: Pid) -> Result<()> {
        let (watchers, mut sv) = self.parts();
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::internal(WATCHER_KILL))?;
        match watchers.get_mut(name) {
            Some(watcher) => {
                watcher.kill_straggler(&mut sv, pid, Some(token.tag()))?;
            }
            None => trace!(watcher = %name, pid, "grace period ended for a removed watcher"),
        }
        Ok(())
    }

    fn respawn(&mut self, name: &str) -> Result<()> {
        if self.stopping {
            return Ok(());
        }
        let (watchers, mut sv) = self.parts();
        let guard = sv.guard();
        let token = guard.acquire(&CommandTag::internal(WATCHER_RESPAWN))?;
        match watchers.get_mut(name) {
            Some(watcher) => watcher.respawn_due(&mut sv, Some(token.tag())),
            None => Ok(()),
        }
    }

    /// Run one control command.
    pub fn execute(&mut self, command: ControlCommand, origin: Origin) -> Result<CommandReply> {
        debug!(command = command.command_id(), ?origin, "executing command");
        match command {
            ControlCommand::StartWatcher(name) => {
                self.start_watcher(&name, origin).map(|()| CommandReply::Done)
            }
            ControlCommand::StopWatcher(name) => {
                self.stop_watcher(&name, origin).map(|_| CommandReply::Done)
            }
            ControlCommand::RestartWatcher(name) => {
                self.restart_watcher(&name, origin).map(|()| CommandReply::Done)
            }
            ControlCommand::SetNumProcesses { watcher, count } => self
                .set_numprocesses(&watcher, count, origin)
                .map(CommandReply::NumProcesses),
            ControlCommand::StartAll => self.start_watchers(origin).map(|()| CommandReply::Done),
            ControlCommand::StopAll => self.stop_watchers(origin).map(|()| CommandReply::Done),
            ControlCommand::AddWatcher { definition, start } => self
                .add_watcher(definition, start, origin)
                .map(|()| CommandReply::Done),
            ControlCommand::RemoveWatcher(name) => {
                self.remove_watcher(&name, origin).map(|()| CommandReply::Done)
            }
            ControlCommand::Reload => self.reload(origin).map(|()| CommandReply::Done),
            ControlCommand::Quit => self.quit(origin).map(|()| CommandReply::Done),
            ControlCommand::Status => Ok(CommandReply::Status(self.status())),
        }
    }

    /// Deferred half of signal handling; runs on the loop thread.
    pub fn handle_signal(&mut self, signum: i32) {
        let name = signal_name(signum);
        info!(signal = %name, "got signal");

        let result = match SignalAction::for_signal(signum) {
            Some(SignalAction::Quit) => self.quit(Origin::Internal),
            Some(SignalAction::Reload) => self.reload(Origin::Internal),
            Some(SignalAction::Ignore) => Ok(()),
            None => {
                warn!(signal = %name, "no handler for signal; ignoring");
                Ok(())
            }
        };
        if let Err(e) = result {
            error!(signal = %name, error = %e, "signal handling failed");
        }
    }

    /// React to one loop event.
    pub fn step(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Output { route, data } => match self.watchers.get_mut(&route.watcher) {
                Some(watcher) => {
                    watcher.deliver_output(&route, &data);
                }
                None => trace!(watcher = %route.watcher, fd = route.fd, "output for unknown watcher"),
            },
            LoopEvent::StreamClosed { route } => {
                debug!(
                    watcher = %route.watcher,
                    pid = route.pid,
                    fd = route.fd,
                    stream = %route.stream,
                    "stream reached EOF"
                );
                if let Some(watcher) = self.watchers.get_mut(&route.watcher) {
                    watcher.stream_closed(&route);
                }
            }
            LoopEvent::GraceExpired { watcher, pid } => {
                if let Err(e) = self.kill_straggler(&watcher, pid) {
                    warn!(watcher = %watcher, pid, error = %e, "grace expiry not handled");
                }
            }
            LoopEvent::Respawn { watcher } => {
                if let Err(e) = self.respawn(&watcher) {
                    warn!(watcher = %watcher, error = %e, "respawn failed");
                }
            }
            LoopEvent::Command { command, reply } => {
                let id = command.command_id();
                let result = self.execute(command, Origin::External);
                if let Err(e) = &result {
                    warn!(command = id, error = %e, "command rejected");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }
}
