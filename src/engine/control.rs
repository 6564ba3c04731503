// src/engine/control.rs

use tokio::sync::{mpsc, oneshot};

use crate::errors::{Result, SupervisorError};
use crate::watcher::WatcherDefinition;

use super::{ArbiterStatus, CommandReply, ControlCommand, LoopEvent};

/// Cloneable entry point for issuing commands to a running arbiter.
///
/// Commands are queued on the loop and executed there under the command
/// guard with external origin.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl ControlHandle {
    pub fn new(events: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { events }
    }

    pub async fn send(&self, command: ControlCommand) -> Result<CommandReply> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(LoopEvent::Command {
                command,
                reply: Some(tx),
            })
            .map_err(|_| SupervisorError::LoopClosed)?;
        rx.await.map_err(|_| SupervisorError::LoopClosed)?
    }

    /// Queue a command without waiting for its outcome.
    pub fn post(&self, command: ControlCommand) -> Result<()> {
        self.events
            .send(LoopEvent::Command {
                command,
                reply: None,
            })
            .map_err(|_| SupervisorError::LoopClosed)
    }

    pub async fn start_watcher(&self, name: &str) -> Result<()> {
        self.send(ControlCommand::StartWatcher(name.to_string()))
            .await
            .map(|_| ())
    }

    pub async fn stop_watcher(&self, name: &str) -> Result<()> {
        self.send(ControlCommand::StopWatcher(name.to_string()))
            .await
            .map(|_| ())
    }

    pub async fn restart_watcher(&self, name: &str) -> Result<()> {
        self.send(ControlCommand::RestartWatcher(name.to_string()))
            .await
            .map(|_| ())
    }

    pub async fn set_numprocesses(&self, name: &str, count: usize) -> Result<usize> {
        match self
            .send(ControlCommand::SetNumProcesses {
                watcher: name.to_string(),
                count,
            })
            .await?
        {
            CommandReply::NumProcesses(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_watcher(&self, definition: WatcherDefinition, start: bool) -> Result<()> {
        self.send(ControlCommand::AddWatcher { definition, start })
            .await
            .map(|_| ())
    }

    pub async fn remove_watcher(&self, name: &str) -> Result<()> {
        self.send(ControlCommand::RemoveWatcher(name.to_string()))
            .await
            .map(|_| ())
    }

    pub async fn reload(&self) -> Result<()> {
        self.send(ControlCommand::Reload).await.map(|_| ())
    }

    pub async fn quit(&self) -> Result<()> {
        self.send(ControlCommand::Quit).await.map(|_| ())
    }

    pub async fn status(&self) -> Result<ArbiterStatus> {
        match self.send(ControlCommand::Status).await? {
            CommandReply::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: CommandReply) -> SupervisorError {
    SupervisorError::Other(anyhow::anyhow!("unexpected reply: {reply:?}"))
}
