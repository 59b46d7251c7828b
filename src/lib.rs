//! ledgerflow: a checkpointed, resumable flow framework for a distributed
//! ledger node.
//!
//! Flows are sequential async programs that may send, receive, and
//! send-and-receive with counterparties, spawn sub-flows, raise declared
//! business errors across the wire, and survive process restarts by
//! round-tripping their in-flight state through the checkpoint store.

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod flow;
pub mod ledger;
pub mod net;
pub mod rpc;
pub mod session;

pub use checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
pub use config::NodeConfig;
pub use flow::{
    BusinessError, FlowContext, FlowDescriptor, FlowError, FlowHandle, FlowManager,
    FlowTransactionMapping, InitiatedBy, RunId, StateMachineUpdate, TypedFlowHandle,
};
pub use ledger::LedgerTracker;
pub use net::{InMemoryNetwork, MessageBus, NetworkDirectory, Party, WireMessage};
pub use rpc::{Feed, FlowRpcService, RpcUser};
