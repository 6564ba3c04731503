// src/reactor/tokio_reactor.rs

//! Tokio-backed [`Reactor`].
//!
//! Each read registration owns a private `dup` of the pipe descriptor,
//! switched to non-blocking mode and wrapped in `AsyncFd`. Working on a copy
//! means the registration is keyed on a descriptor the reactor owns: when the
//! process's own pipe end is closed and its number handed out again, the old
//! epoll registration cannot collide with the new one.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::engine::LoopEvent;
use crate::errors::ReactorError;

use super::{Reactor, RegistrationId, StreamRoute, TimerId};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug)]
struct Reader {
    id: RegistrationId,
    task: JoinHandle<()>,
}

/// Reactor that turns pipe readiness and timers into [`LoopEvent`]s.
///
/// Must be used from within a tokio runtime.
#[derive(Debug)]
pub struct TokioReactor {
    events: mpsc::UnboundedSender<LoopEvent>,
    readers: HashMap<RawFd, Reader>,
    timers: HashMap<TimerId, JoinHandle<()>>,
    next_id: u64,
}

impl TokioReactor {
    pub fn new(events: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self {
            events,
            readers: HashMap::new(),
            timers: HashMap::new(),
            next_id: 1,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn registered_count(&self) -> usize {
        self.readers.len()
    }
}

fn watch_copy(fd: RawFd) -> io::Result<OwnedFd> {
    let copy = nix::unistd::dup(fd).map_err(io::Error::from)?;
    // SAFETY: `dup` just returned a fresh descriptor nobody else owns.
    let owned = unsafe { OwnedFd::from_raw_fd(copy) };

    let flags = fcntl(owned.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(owned.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(owned)
}

async fn read_loop(
    source: AsyncFd<OwnedFd>,
    route: StreamRoute,
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let mut ready = match source.readable().await {
            Ok(ready) => ready,
            Err(e) => {
                debug!(fd = route.fd, error = %e, "readiness wait failed");
                break;
            }
        };

        let read = ready.try_io(|inner| {
            nix::unistd::read(inner.get_ref().as_raw_fd(), &mut buf).map_err(io::Error::from)
        });

        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let event = LoopEvent::Output {
                    route: route.clone(),
                    data: buf[..n].to_vec(),
                };
                if events.send(event).is_err() {
                    // Loop is gone; nobody left to deliver to.
                    return;
                }
            }
            Ok(Err(e)) => {
                debug!(fd = route.fd, error = %e, "pipe read failed");
                break;
            }
            Err(_would_block) => continue,
        }
    }

    trace!(fd = route.fd, pid = route.pid, "stream closed");
    let _ = events.send(LoopEvent::StreamClosed { route });
}

impl Reactor for TokioReactor {
    fn register_read(&mut self, route: StreamRoute) -> Result<RegistrationId, ReactorError> {
        let fd = route.fd;
        if self.readers.contains_key(&fd) {
            return Err(ReactorError::AlreadyRegistered(fd));
        }

        let copy = watch_copy(fd).map_err(|source| ReactorError::Io { fd, source })?;
        let source = AsyncFd::with_interest(copy, Interest::READABLE)
            .map_err(|source| ReactorError::Io { fd, source })?;

        let id = self.next_id();
        let task = tokio::spawn(read_loop(source, route, self.events.clone()));
        self.readers.insert(fd, Reader { id, task });
        trace!(fd, registration = id, "read handler registered");
        Ok(id)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        match self.readers.remove(&fd) {
            Some(reader) => {
                reader.task.abort();
                trace!(fd, registration = reader.id, "read handler removed");
                Ok(())
            }
            None => Err(ReactorError::NotFound(fd)),
        }
    }

    fn is_registered(&self, fd: RawFd) -> bool {
        self.readers.contains_key(&fd)
    }

    fn schedule_after(&mut self, delay: Duration, event: LoopEvent) -> TimerId {
        self.timers.retain(|_, task| !task.is_finished());

        let id = self.next_id();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
        self.timers.insert(id, task);
        id
    }

    fn cancel_timer(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(task) => {
                let pending = !task.is_finished();
                task.abort();
                pending
            }
            None => false,
        }
    }
}

impl Drop for TokioReactor {
    fn drop(&mut self) {
        for (_, reader) in self.readers.drain() {
            reader.task.abort();
        }
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }
}
