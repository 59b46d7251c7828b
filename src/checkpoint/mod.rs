//! Durable checkpoints of suspended flows.
//!
//! A checkpoint is everything needed to resume a flow byte-for-byte: the
//! flow's identity and input, the journal of outcomes of every suspension
//! point it has passed, its session table, and the outbound messages of
//! its latest suspension (republished on resume; receivers discard
//! duplicates). The blob layout is private to the framework apart from the
//! mandatory leading schema-version byte.

use crate::db::CheckpointOp;
use crate::flow::error::FlowError;
use crate::flow::{InitiatedBy, RunId};
use crate::net::WireMessage;
use crate::session::SessionTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Bumped whenever the blob layout changes. A mismatch on resume is fatal
/// to that flow and reported out-of-band; there is no schema migration.
pub const CHECKPOINT_SCHEMA_VERSION: u8 = 1;

/// Outcome of one passed suspension point, in execution order. Replaying
/// the journal against the flow's logic reconstructs the continuation
/// without touching the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SuspensionOutcome {
    /// The entry point ran and the initial checkpoint was taken.
    EntryPoint,
    /// A session was opened towards a party (init emitted, any first
    /// payload piggybacked).
    SessionOpened { session_id: u64 },
    /// A data message was emitted on an established session.
    Sent { session_id: u64 },
    /// A payload was delivered to the flow.
    Received { session_id: u64, payload: Vec<u8> },
    /// A ledger transaction the flow was waiting on committed.
    LedgerCommitted { tx_hash: String },
    /// A timed suspension elapsed.
    Slept { millis: u64 },
    /// A sub-flow boundary was crossed.
    SubFlowEntered { name: String },
}

/// Serialized continuation of one suspended flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub flow_name: String,
    pub flow_version: u32,
    pub initiated_by: InitiatedBy,
    pub input: Vec<u8>,
    pub journal: Vec<SuspensionOutcome>,
    pub sessions: SessionTable,
    /// Payload that rode in on the session init, for responder flows.
    /// Handed to the flow at instantiation, never through a receive.
    pub init_payload: Option<Vec<u8>>,
    /// Outbound messages of the suspension that wrote this blob.
    /// Republished on resume.
    pub pending_outbound: Vec<WireMessage>,
}

impl Checkpoint {
    /// Encode for the store: schema-version byte, then the body.
    pub fn encode(&self) -> Result<Vec<u8>, FlowError> {
        let body = serde_json::to_vec(self).map_err(|e| FlowError::Serialization(e.to_string()))?;
        let mut blob = Vec::with_capacity(body.len() + 1);
        blob.push(CHECKPOINT_SCHEMA_VERSION);
        blob.extend_from_slice(&body);
        Ok(blob)
    }

    /// Decode from the store, failing fast on an unknown schema.
    pub fn decode(blob: &[u8]) -> Result<Checkpoint, FlowError> {
        match blob.first() {
            Some(&CHECKPOINT_SCHEMA_VERSION) => serde_json::from_slice(&blob[1..])
                .map_err(|e| FlowError::Fatal(format!("Corrupt checkpoint: {}", e))),
            Some(&version) => Err(FlowError::Fatal(format!(
                "Unsupported checkpoint schema version {} (expected {})",
                version, CHECKPOINT_SCHEMA_VERSION
            ))),
            None => Err(FlowError::Fatal("Empty checkpoint blob".to_string())),
        }
    }
}

/// Checkpoint store failures.
#[derive(Clone, Debug)]
pub enum StoreError {
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Checkpoint store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Keyed durable map of run-id → blob.
///
/// Mutations arrive as a batch staged by the host transaction and must be
/// applied atomically: checkpoint state and the transaction's other side
/// effects commit or fail together. `list` is called once at startup to
/// enumerate flows for resurrection.
pub trait CheckpointStore: Send + Sync {
    fn apply(&self, ops: &[CheckpointOp]) -> Result<(), StoreError>;
    fn list(&self) -> Vec<(RunId, Vec<u8>)>;
    fn contains(&self, run_id: &RunId) -> bool;
}

/// Store backed by a process-local map. The real node plugs a relational
/// store in behind the same trait.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    blobs: Mutex<HashMap<RunId, Vec<u8>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().unwrap().is_empty()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn apply(&self, ops: &[CheckpointOp]) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock().unwrap();
        for op in ops {
            match op {
                CheckpointOp::Put { run_id, blob } => {
                    blobs.insert(*run_id, blob.clone());
                }
                CheckpointOp::Remove { run_id } => {
                    blobs.remove(run_id);
                }
            }
        }
        Ok(())
    }

    fn list(&self) -> Vec<(RunId, Vec<u8>)> {
        let blobs = self.blobs.lock().unwrap();
        blobs.iter().map(|(id, blob)| (*id, blob.clone())).collect()
    }

    fn contains(&self, run_id: &RunId) -> bool {
        self.blobs.lock().unwrap().contains_key(run_id)
    }
}
