//! State-machine change events emitted by the flow manager.

use crate::flow::{InitiatedBy, RunId};
use serde::{Deserialize, Serialize};

/// Snapshot view of one live flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowDescriptor {
    pub run_id: RunId,
    pub flow_name: String,
    /// Version this side registered; for responders, the version selected
    /// by the handshake.
    pub flow_version: u32,
    pub initiated_by: InitiatedBy,
}

/// Events on the state-machine change stream.
///
/// `Added` is committed in the same host transaction as the flow's initial
/// checkpoint, so subscribers observe it before any side effect of the
/// flow. `Removed` carries the serialized terminal result
/// (`Result<Vec<u8>, FlowError>` encoded with the framework codec).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StateMachineUpdate {
    Added { descriptor: FlowDescriptor },
    Removed { run_id: RunId, result: Vec<u8> },
}

impl StateMachineUpdate {
    pub fn run_id(&self) -> RunId {
        match self {
            StateMachineUpdate::Added { descriptor } => descriptor.run_id,
            StateMachineUpdate::Removed { run_id, .. } => *run_id,
        }
    }
}

/// One flow's association with a ledger transaction it observed as
/// recorded. Streamed on the transaction-mapping feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowTransactionMapping {
    pub run_id: RunId,
    pub tx_hash: String,
}
