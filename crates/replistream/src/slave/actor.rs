//! Slave actor
//!
//! Single-owner wrapper around [`SlaveState`]: one task owns the machine and
//! serializes every mutation through a command channel, so concurrent
//! delivery callbacks, admin requests and snapshot notifications never race
//! on the watermark or the status. Callers hold a cheap, cloneable
//! [`SlaveHandle`].

use crate::common::record::ChangeRecord;
use crate::common::{ReplError, Result};
use crate::slave::state::{CheckOutcome, SlaveState, SlaveStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const COMMAND_BUFFER: usize = 64;

/// Initiates a replication request on behalf of another slave. Used for
/// cascaded setups: when one slave finishes its transition, the next in the
/// chain gets bootstrapped.
#[async_trait]
pub trait ReplicationInitiator: Send + Sync {
    /// Request an initial sync of `prefix` for `slave_id`.
    async fn initiate(&self, slave_id: &str, prefix: &str) -> Result<()>;
}

enum Command {
    Register(oneshot::Sender<Result<()>>),
    Check(Vec<ChangeRecord>, oneshot::Sender<Result<CheckOutcome>>),
    Initiate(oneshot::Sender<Result<()>>),
    SnapshotReady {
        min_sequence: u64,
        max_sequence: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel(oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<SlaveStatus>),
    Watermarks(oneshot::Sender<(u64, u64)>),
}

/// Cloneable handle to one slave actor.
#[derive(Clone)]
pub struct SlaveHandle {
    id: String,
    tx: mpsc::Sender<Command>,
}

impl SlaveHandle {
    /// Slave identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| ReplError::invalid_state(format!("slave actor '{}' terminated", self.id)))?;
        rx.await
            .map_err(|_| ReplError::invalid_state(format!("slave actor '{}' terminated", self.id)))
    }

    /// Register the slave, deriving state from persistence.
    pub async fn register(&self) -> Result<()> {
        self.send(Command::Register).await?
    }

    /// Check one delivered batch.
    pub async fn check(&self, batch: Vec<ChangeRecord>) -> Result<CheckOutcome> {
        self.send(|reply| Command::Check(batch, reply)).await?
    }

    /// Begin a new initial-sync request.
    pub async fn initiate(&self) -> Result<()> {
        self.send(Command::Initiate).await?
    }

    /// Deliver the snapshot watermark interval.
    pub async fn snapshot_ready(&self, min_sequence: u64, max_sequence: u64) -> Result<()> {
        self.send(|reply| Command::SnapshotReady {
            min_sequence,
            max_sequence,
            reply,
        })
        .await?
    }

    /// Cancel an in-flight initial sync.
    pub async fn cancel(&self) -> Result<()> {
        self.send(Command::Cancel).await?
    }

    /// Reported status.
    pub async fn status(&self) -> Result<SlaveStatus> {
        self.send(Command::Status).await
    }

    /// Watermark interval currently in effect.
    pub async fn watermarks(&self) -> Result<(u64, u64)> {
        self.send(Command::Watermarks).await
    }
}

/// The actor task. Spawn with [`SlaveActor::spawn`].
pub struct SlaveActor {
    state: SlaveState,
    initiator: Option<Arc<dyn ReplicationInitiator>>,
    rx: mpsc::Receiver<Command>,
}

impl SlaveActor {
    /// Spawn the actor task for a state machine. The actor stops when the
    /// last handle is dropped.
    pub fn spawn(
        state: SlaveState,
        initiator: Option<Arc<dyn ReplicationInitiator>>,
    ) -> (SlaveHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = SlaveHandle {
            id: state.id().to_string(),
            tx,
        };
        let actor = Self {
            state,
            initiator,
            rx,
        };
        let join = tokio::spawn(actor.run());
        (handle, join)
    }

    async fn run(mut self) {
        info!(slave = %self.state.id(), "slave actor started");
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Register(reply) => {
                    let _ = reply.send(self.state.register().await);
                }
                Command::Check(batch, reply) => {
                    let result = self.state.check(batch).await;
                    if let Ok(CheckOutcome::Checked {
                        became_normal: true,
                        ..
                    }) = &result
                    {
                        self.start_cascade().await;
                    }
                    let _ = reply.send(result);
                }
                Command::Initiate(reply) => {
                    let _ = reply.send(self.state.begin_initial_request().await);
                }
                Command::SnapshotReady {
                    min_sequence,
                    max_sequence,
                    reply,
                } => {
                    let _ = reply.send(self.state.snapshot_ready(min_sequence, max_sequence).await);
                }
                Command::Cancel(reply) => {
                    let _ = reply.send(self.state.cancel_initial_request().await);
                }
                Command::Status(reply) => {
                    let _ = reply.send(self.state.status());
                }
                Command::Watermarks(reply) => {
                    let _ = reply.send(self.state.watermarks());
                }
            }
        }
        info!(slave = %self.state.id(), "slave actor stopped");
    }

    async fn start_cascade(&self) {
        let Some(cascade) = self.state.cascade() else {
            return;
        };
        let Some(initiator) = &self.initiator else {
            warn!(
                slave = %self.state.id(),
                target = %cascade.slave_id,
                "cascade target configured but no initiator wired"
            );
            return;
        };
        info!(
            slave = %self.state.id(),
            target = %cascade.slave_id,
            prefix = %cascade.prefix,
            "starting cascaded replication"
        );
        if let Err(e) = initiator.initiate(&cascade.slave_id, &cascade.prefix).await {
            // Cascade failure does not poison this slave; the target stays
            // un-bootstrapped and monitoring picks it up.
            error!(
                slave = %self.state.id(),
                target = %cascade.slave_id,
                error = %e,
                "cascaded replication request failed"
            );
        }
    }
}
