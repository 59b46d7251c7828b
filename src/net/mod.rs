//! Party addressing and the node-to-node message bus.
//!
//! The framework assumes a reliable, party-addressed transport with FIFO
//! delivery per (sender, recipient) pair. This module defines that contract
//! plus an in-memory implementation used by tests and in-process clusters,
//! and the directory that resolves logical parties to concrete endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// An opaque logical identity addressable by the messaging layer.
///
/// Several endpoints may advertise the same party (e.g. a replicated
/// service); the directory picks a concrete endpoint per session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Party(pub String);

impl Party {
    pub fn new(name: impl Into<String>) -> Self {
        Party(name.into())
    }
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Concrete address of one node on the bus.
pub type EndpointId = String;

/// A framed message in flight between two endpoints.
///
/// The body is an encoded session message; the envelope carries only
/// addressing, so the bus never inspects protocol content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub from_endpoint: EndpointId,
    pub from_party: Party,
    pub to_endpoint: EndpointId,
    pub bytes: Vec<u8>,
}

/// Errors from the messaging layer.
#[derive(Clone, Debug)]
pub enum NetError {
    /// No endpoint with this id is registered.
    UnknownEndpoint(EndpointId),
    /// No endpoint advertises this party.
    UnknownParty(Party),
    /// The recipient's inbox has been torn down.
    EndpointClosed(EndpointId),
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::UnknownEndpoint(id) => write!(f, "Unknown endpoint '{}'", id),
            NetError::UnknownParty(party) => write!(f, "No endpoint advertises party '{}'", party),
            NetError::EndpointClosed(id) => write!(f, "Endpoint '{}' is closed", id),
        }
    }
}

impl std::error::Error for NetError {}

/// Reliable, addressed, at-least-once message bus.
///
/// Implementations must preserve send order per (sender, recipient) pair.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver a message to its destination endpoint.
    async fn publish(&self, message: WireMessage) -> Result<(), NetError>;
}

/// Directory resolving logical parties to endpoints.
///
/// When a party is advertised by more than one endpoint, `next_endpoint`
/// rotates through them in strict registration order.
#[derive(Default)]
pub struct NetworkDirectory {
    entries: Mutex<HashMap<Party, Vec<EndpointId>>>,
    cursors: Mutex<HashMap<Party, usize>>,
}

impl NetworkDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise an endpoint for a party. Order of registration fixes the
    /// rotation order for shared identities.
    pub fn register(&self, party: Party, endpoint: EndpointId) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(party).or_default().push(endpoint);
    }

    /// Pick the next endpoint for a party, rotating across all advertised
    /// endpoints. The chosen endpoint is pinned into the session by the
    /// caller and reused for every subsequent message on that session.
    pub fn next_endpoint(&self, party: &Party) -> Result<EndpointId, NetError> {
        let entries = self.entries.lock().unwrap();
        let endpoints = entries
            .get(party)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| NetError::UnknownParty(party.clone()))?;

        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors.entry(party.clone()).or_insert(0);
        let endpoint = endpoints[*cursor % endpoints.len()].clone();
        *cursor += 1;
        Ok(endpoint)
    }

    /// All endpoints advertised for a party.
    pub fn endpoints_of(&self, party: &Party) -> Vec<EndpointId> {
        let entries = self.entries.lock().unwrap();
        entries.get(party).cloned().unwrap_or_default()
    }
}

/// In-memory message bus connecting endpoints in one process.
///
/// Each endpoint owns an unbounded inbox; a single queue per recipient
/// preserves per-sender FIFO ordering.
#[derive(Default)]
pub struct InMemoryNetwork {
    inboxes: Mutex<HashMap<EndpointId, mpsc::UnboundedSender<WireMessage>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and hand back its inbox. Re-registering the
    /// same id replaces the previous inbox, which is how a restarted node
    /// reattaches to the bus.
    pub fn register(&self, endpoint: impl Into<EndpointId>) -> mpsc::UnboundedReceiver<WireMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inboxes = self.inboxes.lock().unwrap();
        inboxes.insert(endpoint.into(), tx);
        rx
    }

    /// Drop an endpoint's inbox. Later publishes to it fail.
    pub fn deregister(&self, endpoint: &str) {
        let mut inboxes = self.inboxes.lock().unwrap();
        inboxes.remove(endpoint);
    }
}

#[async_trait]
impl MessageBus for InMemoryNetwork {
    async fn publish(&self, message: WireMessage) -> Result<(), NetError> {
        let sender = {
            let inboxes = self.inboxes.lock().unwrap();
            inboxes
                .get(&message.to_endpoint)
                .cloned()
                .ok_or_else(|| NetError::UnknownEndpoint(message.to_endpoint.clone()))?
        };
        let to_endpoint = message.to_endpoint.clone();
        sender
            .send(message)
            .map_err(|_| NetError::EndpointClosed(to_endpoint))
    }
}
