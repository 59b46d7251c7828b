//! The host transaction bracket.
//!
//! Every externally visible effect of the framework — checkpoint writes and
//! deletes, outbound session messages, state-machine updates — is staged on
//! a [`DbTransaction`] and committed in one step. Checkpoint mutations are
//! applied atomically; updates are broadcast before any message reaches the
//! bus, so an `Added` event always precedes the flow's first observable
//! side effect. Partial success is impossible: a failed commit leaves the
//! store untouched and publishes nothing.

use crate::checkpoint::CheckpointStore;
use crate::flow::event::StateMachineUpdate;
use crate::flow::RunId;
use crate::net::{MessageBus, WireMessage};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A staged checkpoint mutation.
#[derive(Clone, Debug)]
pub enum CheckpointOp {
    Put { run_id: RunId, blob: Vec<u8> },
    Remove { run_id: RunId },
}

/// Effects accumulated between a suspension (or lifecycle operation) and
/// its commit.
#[derive(Default)]
pub struct DbTransaction {
    pub(crate) checkpoint_ops: Vec<CheckpointOp>,
    pub(crate) outbound: Vec<WireMessage>,
    pub(crate) updates: Vec<StateMachineUpdate>,
}

impl DbTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_checkpoint(&mut self, run_id: RunId, blob: Vec<u8>) {
        self.checkpoint_ops.push(CheckpointOp::Put { run_id, blob });
    }

    pub fn remove_checkpoint(&mut self, run_id: RunId) {
        self.checkpoint_ops.push(CheckpointOp::Remove { run_id });
    }

    pub fn send_message(&mut self, message: WireMessage) {
        self.outbound.push(message);
    }

    pub fn emit_update(&mut self, update: StateMachineUpdate) {
        self.updates.push(update);
    }
}

/// Host database failures. Always fatal to the flow that committed, never
/// to the node.
#[derive(Clone, Debug)]
pub enum DbError {
    CommitFailed(String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::CommitFailed(msg) => write!(f, "Host transaction commit failed: {}", msg),
        }
    }
}

impl std::error::Error for DbError {}

/// Commit boundary over the checkpoint store, the message bus, and the
/// state-machine update stream.
pub struct HostDb {
    store: Arc<dyn CheckpointStore>,
    bus: Arc<dyn MessageBus>,
    updates_tx: broadcast::Sender<StateMachineUpdate>,
    logger: slog::Logger,
}

impl HostDb {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        bus: Arc<dyn MessageBus>,
        update_buffer: usize,
        logger: slog::Logger,
    ) -> Self {
        let (updates_tx, _) = broadcast::channel(update_buffer);
        Self {
            store,
            bus,
            updates_tx,
            logger,
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Subscribe to state-machine updates. Slow subscribers lag past the
    /// channel bound and observe `RecvError::Lagged` as the loss marker;
    /// they never block commits.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<StateMachineUpdate> {
        self.updates_tx.subscribe()
    }

    /// Commit a transaction: apply checkpoint mutations atomically, then
    /// broadcast updates, then publish outbound messages.
    ///
    /// A publish failure does not undo the commit. The checkpoint keeps its
    /// own copy of the suspension's outbound messages, and redelivery on
    /// resume plus receiver-side dedup covers the gap.
    pub async fn commit(&self, txn: DbTransaction) -> Result<(), DbError> {
        self.store
            .apply(&txn.checkpoint_ops)
            .map_err(|e| DbError::CommitFailed(e.to_string()))?;

        for update in txn.updates {
            let _ = self.updates_tx.send(update);
        }

        for message in txn.outbound {
            if let Err(e) = self.bus.publish(message).await {
                slog::warn!(self.logger, "Failed to publish outbound message"; "error" => %e);
            }
        }

        Ok(())
    }
}
