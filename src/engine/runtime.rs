// src/engine/runtime.rs

use std::fmt;
use std::io;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::process::ProcessBackend;
use crate::reactor::Reactor;
use crate::signals::SignalReceiver;

use super::{Arbiter, LoopEvent};

/// Drives the arbiter from the reconciliation ticker, the loop queue and
/// deferred signals.
///
/// This is a thin IO shell around [`Arbiter`], which holds all supervision
/// semantics. Only one branch runs at a time, so arbiter state is never
/// touched concurrently.
pub struct Runtime<P: ProcessBackend, R: Reactor> {
    arbiter: Arbiter<P, R>,
    event_rx: mpsc::UnboundedReceiver<LoopEvent>,
    signals: Option<SignalReceiver>,
}

impl<P: ProcessBackend, R: Reactor> fmt::Debug for Runtime<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("arbiter", &self.arbiter)
            .field("signals", &self.signals.is_some())
            .finish_non_exhaustive()
    }
}

async fn next_signals(signals: &mut Option<SignalReceiver>) -> io::Result<Vec<i32>> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<P: ProcessBackend, R: Reactor> Runtime<P, R> {
    pub fn new(arbiter: Arbiter<P, R>, event_rx: mpsc::UnboundedReceiver<LoopEvent>) -> Self {
        Self {
            arbiter,
            event_rx,
            signals: None,
        }
    }

    pub fn with_signals(mut self, signals: SignalReceiver) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn arbiter(&self) -> &Arbiter<P, R> {
        &self.arbiter
    }

    /// Main event loop.
    ///
    /// - Starts the autostart watchers.
    /// - Runs the reconciliation tick every `check_delay`.
    /// - Feeds loop events and deferred signals into the arbiter.
    /// - Returns the arbiter once quit completed or the queue closed.
    pub async fn run(mut self) -> Result<Arbiter<P, R>> {
        info!("procwarden arbiter started");

        if let Err(e) = self.arbiter.boot() {
            warn!(error = %e, "some watchers failed to start");
        }

        let mut ticker = tokio::time::interval(self.arbiter.options().check_delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.arbiter.manage_watchers() {
                        warn!(error = %e, "reconciliation tick skipped");
                    }
                }
                event = self.event_rx.recv() => match event {
                    Some(event) => self.arbiter.step(event),
                    None => {
                        info!("loop event channel closed; exiting");
                        break;
                    }
                },
                signals = next_signals(&mut self.signals) => match signals {
                    Ok(signals) => {
                        for signum in signals {
                            self.arbiter.handle_signal(signum);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "signal wake-up pipe failed; signals disabled");
                        self.signals = None;
                    }
                },
            }

            if self.arbiter.is_finished() {
                debug!("every watcher stopped");
                break;
            }
        }

        info!("arbiter exiting");
        Ok(self.arbiter)
    }
}
