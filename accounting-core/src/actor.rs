//! Single-writer actor for the processor
//!
//! Every mutating command on this instance goes through one Tokio task, so
//! two commands never interleave their read-modify-write of an ancestor path.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │     HTTP handlers / AccountingService (many tasks)    │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │             ProcessorHandle (Clone)                   │
//! │         Sends messages to actor mailbox               │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │             ProcessorActor (Single Task)              │
//! │      Processor::apply → StoreTxn::commit              │
//! │          (one RocksDB WriteBatch per command)         │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::processor::Processor;
use crate::types::{ActorAndProject, Command};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Message sent to the processor actor
pub enum ProcessorMessage {
    /// Apply a command
    Apply {
        actor: ActorAndProject,
        command: Command,
        response: oneshot::Sender<Result<Vec<bool>>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns the write path
pub struct ProcessorActor {
    /// Mutation engine
    processor: Arc<Processor>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<ProcessorMessage>,
}

impl ProcessorActor {
    /// Create new actor
    pub fn new(processor: Arc<Processor>, mailbox: mpsc::Receiver<ProcessorMessage>) -> Self {
        Self { processor, mailbox }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                ProcessorMessage::Apply {
                    actor,
                    command,
                    response,
                } => {
                    let result = self.processor.apply(&actor, &command);
                    if let Err(e) = &result {
                        tracing::warn!(command = command.name(), error = %e, "Command failed");
                    }
                    // Caller may have given up waiting
                    let _ = response.send(result);
                }
                ProcessorMessage::Shutdown => break,
            }
        }
        tracing::info!("Processor actor stopped");
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct ProcessorHandle {
    sender: mpsc::Sender<ProcessorMessage>,
}

impl ProcessorHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<ProcessorMessage>) -> Self {
        Self { sender }
    }

    /// Apply a command on the writer task
    pub async fn apply(&self, actor: ActorAndProject, command: Command) -> Result<Vec<bool>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProcessorMessage::Apply {
                actor,
                command,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ProcessorMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the processor actor
pub fn spawn_processor_actor(processor: Arc<Processor>, mailbox_capacity: usize) -> ProcessorHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity);
    let actor = ProcessorActor::new(processor, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    ProcessorHandle::new(tx)
}
