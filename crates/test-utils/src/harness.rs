use procwarden::engine::{Arbiter, ArbiterOptions};
use procwarden::guard::{CommandGuard, Origin};
use procwarden::watcher::{Supervision, Watcher};

use crate::fake_process::FakeProcessBackend;
use crate::fake_reactor::FakeReactor;

pub type FakeArbiter = Arbiter<FakeProcessBackend, FakeReactor>;

/// Loose collaborators for driving a single [`Watcher`] by hand.
#[derive(Debug, Default)]
pub struct Harness {
    pub os: FakeProcessBackend,
    pub reactor: FakeReactor,
    pub guard: CommandGuard,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh supervision context; use it as a temporary so the fakes stay
    /// inspectable between calls.
    pub fn sv(&mut self) -> Supervision<'_> {
        Supervision::new(&mut self.os, &mut self.reactor, &self.guard)
    }
}

/// Arbiter over fakes holding `watchers` (not started).
pub fn fake_arbiter(watchers: impl IntoIterator<Item = Watcher>) -> FakeArbiter {
    let mut arbiter = Arbiter::new(
        FakeProcessBackend::new(),
        FakeReactor::new(),
        ArbiterOptions::default(),
    );
    for watcher in watchers {
        arbiter
            .adopt_watcher(watcher, false, Origin::Internal)
            .expect("adding a fresh watcher to an idle arbiter");
    }
    arbiter
}
