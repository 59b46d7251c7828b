//! The flow framework: registry, suspending execution context, lifecycle
//! manager, and change stream.

pub mod context;
pub mod error;
pub mod event;
pub mod handle;
pub mod manager;
pub mod progress;
pub mod registry;

use crate::net::Party;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use context::FlowContext;
pub use error::{BusinessError, FlowError};
pub use event::{FlowDescriptor, FlowTransactionMapping, StateMachineUpdate};
pub use handle::{FlowHandle, TypedFlowHandle};
pub use manager::FlowManager;
pub use progress::{ProgressStep, ProgressTracker};
pub use registry::FlowRegistry;

/// Globally unique identifier of one flow run. Assigned at creation and
/// stable across restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who caused a flow to exist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InitiatedBy {
    /// Started by an authenticated RPC client.
    Rpc { username: String },
    /// Spawned to service a counterparty's session init.
    Peer { party: Party },
    /// Started by the node's scheduler.
    Scheduled,
    /// Started from the node shell.
    Shell,
}
