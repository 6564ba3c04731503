// src/reactor/mod.rs

//! Event-loop reactor seam.
//!
//! The core never touches epoll or tokio tasks directly. It registers pipe
//! descriptors for reading and schedules timers through [`Reactor`]; every
//! readiness callback or timer comes back as a [`LoopEvent`] on the loop
//! queue and is handled on the loop thread.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::engine::LoopEvent;
use crate::errors::ReactorError;
use crate::process::{Pid, StreamName};

pub mod tokio_reactor;

pub use tokio_reactor::TokioReactor;

pub type RegistrationId = u64;
pub type TimerId = u64;

/// Where bytes read from a registered descriptor belong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRoute {
    pub watcher: String,
    pub pid: Pid,
    pub fd: RawFd,
    pub stream: StreamName,
}

pub trait Reactor {
    /// Start watching `route.fd` for readability.
    ///
    /// Fails with [`ReactorError::AlreadyRegistered`] if the descriptor is
    /// already registered.
    fn register_read(&mut self, route: StreamRoute) -> Result<RegistrationId, ReactorError>;

    /// Stop watching `fd`. Fails with [`ReactorError::NotFound`] if the
    /// reactor does not know the descriptor.
    fn unregister(&mut self, fd: RawFd) -> Result<(), ReactorError>;

    fn is_registered(&self, fd: RawFd) -> bool;

    /// Post `event` to the loop queue after `delay`.
    fn schedule_after(&mut self, delay: Duration, event: LoopEvent) -> TimerId;

    /// Cancel a pending timer. Returns `false` if it already fired or is
    /// unknown; a fired timer's event may still be in the queue.
    fn cancel_timer(&mut self, id: TimerId) -> bool;
}
