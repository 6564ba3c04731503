// src/guard.rs

//! Exclusive-command slot.
//!
//! Every mutating operation acquires the arbiter's [`CommandGuard`] with a
//! [`CommandTag`] before touching supervision state. A tag is a path such as
//! `manage_watchers/watcher_manage_processes`; its first segment is the
//! logical root. Acquiring while the slot is held by the same root nests
//! (depth + 1), acquiring under a different root is a conflict.
//!
//! Acquisition hands back a [`CommandToken`]; dropping it releases one level,
//! so the slot is restored on every exit path including `?` returns.

use std::cell::{Cell, RefCell};
use std::fmt;

use tracing::{trace, warn};

use crate::errors::ConflictError;

/// Root used by a graceful reload; reported to callers rejected while one
/// is in flight.
pub const RELOAD_COMMAND: &str = "arbiter_reload";

/// Who issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Control surface (`ControlHandle`).
    External,
    /// The loop itself: reconciliation tick, timers, deferred signals.
    Internal,
}

/// Identifier of a (possibly nested) command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTag {
    path: String,
    origin: Origin,
}

impl CommandTag {
    pub fn new(name: &str, origin: Origin) -> Self {
        Self {
            path: name.to_string(),
            origin,
        }
    }

    pub fn external(name: &str) -> Self {
        Self::new(name, Origin::External)
    }

    pub fn internal(name: &str) -> Self {
        Self::new(name, Origin::Internal)
    }

    /// Child tag that runs under this tag's root.
    pub fn nested(&self, name: &str) -> Self {
        Self {
            path: format!("{}/{}", self.path, name),
            origin: self.origin,
        }
    }

    /// `parent/name` when a parent is given, otherwise an external root.
    pub fn under(parent: Option<&CommandTag>, name: &str) -> Self {
        match parent {
            Some(p) => p.nested(name),
            None => Self::external(name),
        }
    }

    pub fn root(&self) -> &str {
        match self.path.split_once('/') {
            Some((root, _)) => root,
            None => &self.path,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_nested(&self) -> bool {
        self.path.contains('/')
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

#[derive(Debug)]
struct Held {
    root: String,
    stack: Vec<String>,
}

/// The arbiter's single exclusive-command slot.
///
/// Loop-thread only (`!Sync` through `RefCell`); it guards logically
/// concurrent commands, not threads.
#[derive(Debug, Default)]
pub struct CommandGuard {
    slot: RefCell<Option<Held>>,
    restarting: Cell<bool>,
}

impl CommandGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, tag: &CommandTag) -> Result<CommandToken<'_>, ConflictError> {
        if self.restarting.get() && tag.origin() == Origin::External && tag.root() != RELOAD_COMMAND
        {
            return Err(ConflictError::new(RELOAD_COMMAND));
        }

        let mut slot = self.slot.borrow_mut();
        let depth = match slot.as_mut() {
            None => {
                *slot = Some(Held {
                    root: tag.root().to_string(),
                    stack: vec![tag.path().to_string()],
                });
                1
            }
            Some(held) if held.root == tag.root() => {
                held.stack.push(tag.path().to_string());
                held.stack.len()
            }
            Some(held) => return Err(ConflictError::new(held.root.clone())),
        };

        trace!(command = %tag, depth, "command slot acquired");
        Ok(CommandToken {
            guard: self,
            tag: tag.clone(),
            depth,
        })
    }

    fn release(&self, tag: &CommandTag) {
        let mut slot = self.slot.borrow_mut();
        let now_empty = match slot.as_mut() {
            Some(held) => {
                held.stack.pop();
                held.stack.is_empty()
            }
            None => {
                warn!(command = %tag, "released a command slot that was not held");
                false
            }
        };
        if now_empty {
            *slot = None;
        }
        trace!(command = %tag, "command slot released");
    }

    /// Root of the command holding the slot, if any.
    pub fn holder(&self) -> Option<String> {
        self.slot.borrow().as_ref().map(|h| h.root.clone())
    }

    /// Full path of the innermost command currently running.
    pub fn current(&self) -> Option<String> {
        self.slot
            .borrow()
            .as_ref()
            .and_then(|h| h.stack.last().cloned())
    }

    pub fn depth(&self) -> usize {
        self.slot.borrow().as_ref().map_or(0, |h| h.stack.len())
    }

    pub fn is_idle(&self) -> bool {
        self.slot.borrow().is_none()
    }

    pub fn set_restarting(&self, on: bool) {
        self.restarting.set(on);
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.get()
    }
}

/// Proof of holding the slot; releases one nesting level on drop.
#[must_use = "the command slot is released as soon as the token is dropped"]
#[derive(Debug)]
pub struct CommandToken<'g> {
    guard: &'g CommandGuard,
    tag: CommandTag,
    depth: usize,
}

impl CommandToken<'_> {
    pub fn tag(&self) -> &CommandTag {
        &self.tag
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn nested(&self, name: &str) -> CommandTag {
        self.tag.nested(name)
    }
}

impl Drop for CommandToken<'_> {
    fn drop(&mut self) {
        self.guard.release(&self.tag);
    }
}
