// src/stream/redirector.rs

//! Pipe descriptor ⇄ reactor registration bookkeeping for one watcher.
//!
//! `active` holds a descriptor exactly when the reactor has a read handler
//! for it. [`StreamRedirector::stop_one`] is the only place entries leave
//! `active`; it always clears local state even if the reactor reports the
//! descriptor as already gone, so descriptor numbers recycled by the OS never
//! run into a stale registration.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;

use tracing::{debug, trace};

use crate::errors::RedirectError;
use crate::process::{Pid, ProcessHandle, StreamName};
use crate::reactor::{Reactor, RegistrationId, StreamRoute};

use super::sink::{OutputChunk, Sink};

/// Owner of a redirected descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirection {
    pub pid: Pid,
    pub stream: StreamName,
}

pub struct StreamRedirector {
    watcher: String,
    started: bool,
    active: HashMap<RawFd, RegistrationId>,
    pipes: HashMap<RawFd, Redirection>,
    stdout: Box<dyn Sink>,
    stderr: Box<dyn Sink>,
}

impl fmt::Debug for StreamRedirector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRedirector")
            .field("watcher", &self.watcher)
            .field("started", &self.started)
            .field("active", &self.active)
            .field("pipes", &self.pipes)
            .finish_non_exhaustive()
    }
}

impl StreamRedirector {
    pub fn new(watcher: impl Into<String>, stdout: Box<dyn Sink>, stderr: Box<dyn Sink>) -> Self {
        Self {
            watcher: watcher.into(),
            started: false,
            active: HashMap::new(),
            pipes: HashMap::new(),
            stdout,
            stderr,
        }
    }

    /// Mark the redirector live. Returns `false` if it already was.
    pub fn start(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        trace!(watcher = %self.watcher, "redirector started");
        true
    }

    /// Drop every registration and go idle. Returns how many handlers were
    /// stopped.
    pub fn stop(&mut self, reactor: &mut dyn Reactor) -> usize {
        let fds: Vec<RawFd> = self.active.keys().copied().collect();
        let stopped = fds
            .into_iter()
            .filter(|fd| self.stop_one(reactor, *fd))
            .count();
        self.active.clear();
        self.pipes.clear();
        if self.started {
            trace!(watcher = %self.watcher, stopped, "redirector stopped");
        }
        self.started = false;
        stopped
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Register `fd` with the reactor and record its owner.
    ///
    /// A descriptor that is already active, or that the reactor refuses, means
    /// bookkeeping diverged upstream; both are escalated.
    pub fn start_one(
        &mut self,
        reactor: &mut dyn Reactor,
        fd: RawFd,
        stream: StreamName,
        pid: Pid,
    ) -> Result<(), RedirectError> {
        if self.active.contains_key(&fd) {
            return Err(RedirectError::AlreadyActive(fd));
        }

        let route = StreamRoute {
            watcher: self.watcher.clone(),
            pid,
            fd,
            stream,
        };
        let id = reactor
            .register_read(route)
            .map_err(|source| RedirectError::Registration { fd, source })?;

        self.active.insert(fd, id);
        self.pipes.insert(fd, Redirection { pid, stream });
        trace!(watcher = %self.watcher, fd, pid, %stream, "redirecting");
        Ok(())
    }

    /// Best-effort unregister of `fd`, then unconditional removal from local
    /// state. Returns `true` if an entry existed.
    pub fn stop_one(&mut self, reactor: &mut dyn Reactor, fd: RawFd) -> bool {
        if !self.active.contains_key(&fd) {
            return false;
        }

        if let Err(e) = reactor.unregister(fd) {
            debug!(watcher = %self.watcher, fd, error = %e, "handler already gone");
        }

        self.active.remove(&fd);
        if let Some(owner) = self.pipes.remove(&fd) {
            self.end_of_stream(owner);
        }
        true
    }

    /// The reactor saw EOF on `route.fd`. Returns `false` for a stale route.
    pub fn stream_closed(&mut self, route: &StreamRoute) -> bool {
        match self.pipes.get(&route.fd) {
            Some(owner) if owner.pid == route.pid => {
                let owner = *owner;
                self.end_of_stream(owner);
                true
            }
            _ => false,
        }
    }

    fn end_of_stream(&mut self, owner: Redirection) {
        let sink = match owner.stream {
            StreamName::Stdout => &mut self.stdout,
            StreamName::Stderr => &mut self.stderr,
        };
        sink.end_of_stream(&self.watcher, owner.pid, owner.stream);
    }

    /// Redirect every pipe of `process`. On failure, registrations made by
    /// this call are undone before the error is returned.
    pub fn add_redirections(
        &mut self,
        reactor: &mut dyn Reactor,
        process: &ProcessHandle,
    ) -> Result<Vec<RawFd>, RedirectError> {
        let mut added = Vec::new();
        for (stream, fd) in process.pipes() {
            // A recycled descriptor number may still be listed for a dead pipe.
            if self.stop_one(reactor, fd) {
                debug!(watcher = %self.watcher, fd, "cleared stale redirection");
            }
            if let Err(e) = self.start_one(reactor, fd, stream, process.pid()) {
                self.rollback(reactor, &added);
                return Err(e);
            }
            added.push(fd);
        }
        Ok(added)
    }

    /// Stop every redirection of `process`; returns how many existed.
    pub fn remove_redirections(&mut self, reactor: &mut dyn Reactor, process: &ProcessHandle) -> usize {
        process
            .pipes()
            .into_iter()
            .filter(|(_, fd)| self.stop_one(reactor, *fd))
            .count()
    }

    pub fn rollback(&mut self, reactor: &mut dyn Reactor, fds: &[RawFd]) {
        for fd in fds {
            self.stop_one(reactor, *fd);
        }
    }

    /// Route a chunk read from `route.fd` to the configured sink.
    ///
    /// Returns `false` when the chunk is stale: the descriptor is no longer
    /// redirected or now belongs to a different process.
    pub fn deliver(&mut self, route: &StreamRoute, data: &[u8]) -> bool {
        match self.pipes.get(&route.fd) {
            Some(owner) if owner.pid == route.pid => {}
            _ => {
                trace!(watcher = %self.watcher, fd = route.fd, pid = route.pid, "dropping stale output");
                return false;
            }
        }

        let chunk = OutputChunk {
            watcher: &self.watcher,
            pid: route.pid,
            stream: route.stream,
            data,
        };
        match route.stream {
            StreamName::Stdout => self.stdout.deliver(&chunk),
            StreamName::Stderr => self.stderr.deliver(&chunk),
        }
        true
    }

    pub fn is_active(&self, fd: RawFd) -> bool {
        self.active.contains_key(&fd)
    }

    pub fn active_fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.active.keys().copied().collect();
        fds.sort_unstable();
        fds
    }

    pub fn owner(&self, fd: RawFd) -> Option<Redirection> {
        self.pipes.get(&fd).copied()
    }
}
