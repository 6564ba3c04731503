// src/errors.rs

//! Crate-wide error types.
//!
//! Each subsystem has its own small error enum so callers can match on the
//! failure class that matters to them (a conflict is surfaced, a stale
//! reactor registration is swallowed, a duplicate registration is a bug).
//! [`SupervisorError`] is the umbrella type returned by arbiter commands.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// A genuinely different command already holds the exclusive-command slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("arbiter is already running {holder} command")]
pub struct ConflictError {
    /// Identifier of the command currently holding the slot.
    pub holder: String,
}

impl ConflictError {
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
        }
    }
}

/// The OS refused to launch a process.
#[derive(Error, Debug)]
#[error("failed to spawn '{command}': {source}")]
pub struct SpawnError {
    pub command: String,
    #[source]
    pub source: io::Error,
}

impl SpawnError {
    pub fn new(command: impl Into<String>, source: io::Error) -> Self {
        Self {
            command: command.into(),
            source,
        }
    }
}

/// Failures reported by a [`crate::reactor::Reactor`].
#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("fd {0} added twice")]
    AlreadyRegistered(RawFd),

    #[error("fd {0} is not registered")]
    NotFound(RawFd),

    #[error("reactor could not watch fd {fd}: {source}")]
    Io {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

/// Failures raised by the stream redirector when registering a pipe.
///
/// Both variants mean the `active` bookkeeping and the reactor disagree,
/// which is a logic bug upstream rather than a transient condition.
#[derive(Error, Debug)]
pub enum RedirectError {
    #[error("fd {0} is already redirected")]
    AlreadyActive(RawFd),

    #[error("registering fd {fd} with the reactor failed: {source}")]
    Registration {
        fd: RawFd,
        #[source]
        source: ReactorError,
    },
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("watcher not found: {0}")]
    WatcherNotFound(String),

    #[error("watcher already exists: {0}")]
    WatcherExists(String),

    #[error("watcher '{watcher}' is {state}; {command} rejected")]
    InvalidState {
        watcher: String,
        state: String,
        command: String,
    },

    #[error("watcher '{watcher}' gave up after {attempts} spawn attempts: {last_error}")]
    SpawnExhausted {
        watcher: String,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    Redirect(#[from] RedirectError),

    #[error("supervisor loop is not running")]
    LoopClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, SupervisorError>;
