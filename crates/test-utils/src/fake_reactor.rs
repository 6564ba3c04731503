use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use procwarden::engine::LoopEvent;
use procwarden::errors::ReactorError;
use procwarden::reactor::{Reactor, RegistrationId, StreamRoute, TimerId};

const EBADF: i32 = 9;

/// In-memory reactor that:
/// - keeps its own registration table (and rejects duplicates like a real
///   epoll would)
/// - records every register/unregister call
/// - can be told to lose registrations behind the redirector's back
/// - holds timers until the test fires them.
#[derive(Debug, Default)]
pub struct FakeReactor {
    registered: HashMap<RawFd, (RegistrationId, StreamRoute)>,
    register_calls: Vec<RawFd>,
    unregister_calls: Vec<RawFd>,
    fail_with_ebadf: HashSet<RawFd>,
    timers: BTreeMap<TimerId, (Duration, LoopEvent)>,
    cancelled: Vec<TimerId>,
    next_id: u64,
}

impl FakeReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the registration for `fd` as if something else removed it; the
    /// next `unregister(fd)` reports `NotFound`.
    pub fn forget_registration(&mut self, fd: RawFd) {
        self.registered.remove(&fd);
    }

    /// Make the next `unregister(fd)` fail with EBADF, as when the pipe was
    /// already closed and the kernel dropped the watch on its own.
    pub fn fail_unregister_with_ebadf(&mut self, fd: RawFd) {
        self.fail_with_ebadf.insert(fd);
    }

    pub fn register_calls(&self) -> &[RawFd] {
        &self.register_calls
    }

    pub fn unregister_calls(&self) -> &[RawFd] {
        &self.unregister_calls
    }

    pub fn registered_fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.registered.keys().copied().collect();
        fds.sort_unstable();
        fds
    }

    pub fn route(&self, fd: RawFd) -> Option<&StreamRoute> {
        self.registered.get(&fd).map(|(_, route)| route)
    }

    pub fn pending_timers(&self) -> Vec<(TimerId, Duration)> {
        self.timers
            .iter()
            .map(|(id, (delay, _))| (*id, *delay))
            .collect()
    }

    pub fn cancelled_timers(&self) -> &[TimerId] {
        &self.cancelled
    }

    /// Remove every pending timer and return their events in scheduling
    /// order.
    pub fn fire_all(&mut self) -> Vec<LoopEvent> {
        std::mem::take(&mut self.timers)
            .into_values()
            .map(|(_, event)| event)
            .collect()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl Reactor for FakeReactor {
    fn register_read(&mut self, route: StreamRoute) -> Result<RegistrationId, ReactorError> {
        let fd = route.fd;
        self.register_calls.push(fd);
        if self.registered.contains_key(&fd) {
            return Err(ReactorError::AlreadyRegistered(fd));
        }
        let id = self.next_id();
        self.registered.insert(fd, (id, route));
        Ok(id)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        self.unregister_calls.push(fd);
        if self.fail_with_ebadf.remove(&fd) {
            self.registered.remove(&fd);
            return Err(ReactorError::Io {
                fd,
                source: io::Error::from_raw_os_error(EBADF),
            });
        }
        match self.registered.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(ReactorError::NotFound(fd)),
        }
    }

    fn is_registered(&self, fd: RawFd) -> bool {
        self.registered.contains_key(&fd)
    }

    fn schedule_after(&mut self, delay: Duration, event: LoopEvent) -> TimerId {
        let id = self.next_id();
        self.timers.insert(id, (delay, event));
        id
    }

    fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.cancelled.push(id);
        self.timers.remove(&id).is_some()
    }
}
