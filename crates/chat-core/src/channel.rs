//! Plumbing between a running sync runtime and the shells driving it.

use thiserror::Error;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tracing::warn;

use crate::types::{SyncCommand, SyncEvent};

#[derive(Debug, Error)]
pub enum SyncChannelError {
    /// The runtime has stopped; the undelivered command is handed back.
    #[error("sync runtime stopped before accepting {0:?}")]
    RuntimeStopped(Box<SyncCommand>),
}

impl SyncChannelError {
    pub fn into_command(self) -> SyncCommand {
        match self {
            Self::RuntimeStopped(command) => *command,
        }
    }
}

/// Events of one runtime as seen by one subscriber.
///
/// A subscriber that falls behind loses the oldest events; `next` skips
/// over the gap and [`EventStream::missed`] reports how many were lost.
#[derive(Debug)]
pub struct EventStream {
    inner: broadcast::Receiver<SyncEvent>,
    missed: u64,
}

impl EventStream {
    /// Next event, or `None` once the runtime is gone.
    pub async fn next(&mut self) -> Option<SyncEvent> {
        loop {
            match self.inner.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber fell behind");
                    self.missed = self.missed.saturating_add(skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }
}

/// Sending half of the command queue plus the event fan-out.
#[derive(Clone, Debug)]
pub struct RuntimeLink {
    commands: mpsc::Sender<SyncCommand>,
    events: broadcast::Sender<SyncEvent>,
}

impl RuntimeLink {
    /// Returns the link and the receiving end of its command queue.
    pub fn new(command_capacity: usize, event_capacity: usize) -> (Self, mpsc::Receiver<SyncCommand>) {
        let (commands, command_rx) = mpsc::channel(command_capacity.max(1));
        let (events, _) = broadcast::channel(event_capacity.max(1));
        (Self { commands, events }, command_rx)
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            inner: self.events.subscribe(),
            missed: 0,
        }
    }

    pub async fn send_command(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|mpsc::error::SendError(command)| SyncChannelError::RuntimeStopped(Box::new(command)))
    }

    /// Publish to current subscribers; dropped when there are none.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}
