//! Error kinds for flow execution.
//!
//! Three families cross paths here: declared business errors that are safe
//! to transmit to a counterparty, protocol errors surfaced locally as
//! `UnexpectedFlowEnd`, and fatal runtime errors that terminate the flow
//! but never the node.

use serde::{Deserialize, Serialize};

/// An error explicitly declared safe to send across a session.
///
/// Only the class name and message travel; stack traces never reach the
/// wire. The receiving flow re-raises this as [`FlowError::Counterparty`],
/// not as the local type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessError {
    /// Fully-qualified name of the error type at the thrower.
    pub class_name: String,
    pub message: String,
}

impl BusinessError {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BusinessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)
    }
}

impl std::error::Error for BusinessError {}

/// Errors that can occur during flow operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FlowError {
    /// A declared business error raised by this flow. Serialized onto every
    /// open session as an error end before the flow terminates.
    Business(BusinessError),
    /// A counterparty's business error, re-raised locally as a peer-typed
    /// copy of the original.
    Counterparty(BusinessError),
    /// The counterparty session ended, was rejected, or produced something
    /// other than what this flow was waiting for.
    UnexpectedFlowEnd(String),
    /// The flow was terminated by an external kill request.
    Killed,
    /// Host transaction failure, checkpoint corruption, or another
    /// non-recoverable runtime fault.
    Fatal(String),
    /// Serialization error
    Serialization(String),
    /// Deserialization error
    Deserialization(String),
    /// Flow class not registered
    NotFound(String),
    /// Registration already exists
    AlreadyExists(String),
    /// The registry is frozen; registrations are only accepted at startup.
    RegistryFrozen,
    /// The caller lacks permission to start this flow.
    PermissionDenied(String),
    /// The flow is not marked as startable over RPC.
    NotStartableByRpc(String),
    /// The node is shutting down and no longer accepts work.
    ShuttingDown,
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowError::Business(e) => write!(f, "{}", e),
            FlowError::Counterparty(e) => write!(f, "Counterparty raised {}", e),
            FlowError::UnexpectedFlowEnd(msg) => write!(f, "Unexpected flow end: {}", msg),
            FlowError::Killed => write!(f, "Flow was killed"),
            FlowError::Fatal(msg) => write!(f, "Fatal flow error: {}", msg),
            FlowError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            FlowError::Deserialization(msg) => write!(f, "Deserialization error: {}", msg),
            FlowError::NotFound(name) => write!(f, "Flow '{}' not found", name),
            FlowError::AlreadyExists(name) => write!(f, "'{}' already exists", name),
            FlowError::RegistryFrozen => write!(f, "Flow registry is frozen"),
            FlowError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            FlowError::NotStartableByRpc(name) => {
                write!(f, "Flow '{}' is not startable by RPC", name)
            }
            FlowError::ShuttingDown => write!(f, "Node is shutting down"),
        }
    }
}

impl std::error::Error for FlowError {}

impl FlowError {
    /// The business error to put on the wire when this flow terminates with
    /// this error, if any. Everything non-business crosses as a bare error
    /// end so local detail stays local.
    pub fn wire_error(&self) -> Option<BusinessError> {
        match self {
            FlowError::Business(e) => Some(e.clone()),
            _ => None,
        }
    }
}
