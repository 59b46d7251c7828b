//! Shared harness: an in-memory cluster of flow nodes plus a recording
//! bus that keeps the decoded wire trace for assertions.

#![allow(dead_code)]

use async_trait::async_trait;
use ledgerflow::session::{decode_message, SessionMessage};
use ledgerflow::{
    FlowManager, InMemoryCheckpointStore, InMemoryNetwork, LedgerTracker, MessageBus,
    NetworkDirectory, NodeConfig, Party, WireMessage,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One decoded message observed on the bus.
#[derive(Clone, Debug)]
pub struct TracedMessage {
    pub from: String,
    pub to: String,
    pub message: SessionMessage,
}

/// Bus wrapper that records every published message before delivery.
pub struct RecordingBus {
    inner: Arc<InMemoryNetwork>,
    trace: Mutex<Vec<TracedMessage>>,
}

impl RecordingBus {
    pub fn new(inner: Arc<InMemoryNetwork>) -> Self {
        Self {
            inner,
            trace: Mutex::new(Vec::new()),
        }
    }

    pub fn trace(&self) -> Vec<TracedMessage> {
        self.trace.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.trace
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.message.tag().to_string())
            .collect()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, message: WireMessage) -> Result<(), ledgerflow::net::NetError> {
        if let Ok(decoded) = decode_message(&message.bytes) {
            self.trace.lock().unwrap().push(TracedMessage {
                from: message.from_endpoint.clone(),
                to: message.to_endpoint.clone(),
                message: decoded,
            });
        }
        self.inner.publish(message).await
    }
}

pub struct TestNet {
    pub network: Arc<InMemoryNetwork>,
    pub bus: Arc<RecordingBus>,
    pub directory: Arc<NetworkDirectory>,
    pub ledger: Arc<LedgerTracker>,
}

pub struct TestNode {
    pub manager: Arc<FlowManager>,
    pub store: Arc<InMemoryCheckpointStore>,
}

impl TestNet {
    pub fn new() -> Self {
        let network = Arc::new(InMemoryNetwork::new());
        Self {
            bus: Arc::new(RecordingBus::new(network.clone())),
            network,
            directory: Arc::new(NetworkDirectory::new()),
            ledger: Arc::new(LedgerTracker::new()),
        }
    }

    /// Build a node and advertise its endpoint for its party.
    pub fn node(&self, endpoint: &str, party: &str) -> TestNode {
        self.directory.register(Party::new(party), endpoint.to_string());
        self.node_over_store(endpoint, party, Arc::new(InMemoryCheckpointStore::new()))
    }

    /// Build a node over an existing checkpoint store without advertising
    /// again. This is how a restart is modeled: same endpoint, same store,
    /// fresh manager.
    pub fn node_over_store(
        &self,
        endpoint: &str,
        party: &str,
        store: Arc<InMemoryCheckpointStore>,
    ) -> TestNode {
        let config = NodeConfig::new(endpoint, party).with_drain_timeout(Duration::from_secs(1));
        let manager = FlowManager::new(
            config,
            store.clone(),
            self.bus.clone(),
            self.directory.clone(),
            self.ledger.clone(),
        );
        TestNode { manager, store }
    }
}

impl TestNode {
    /// Register the node's inbox and open it for traffic.
    pub async fn open(&self, net: &TestNet) {
        let inbox = net.network.register(self.manager.endpoint().clone());
        self.manager
            .start(inbox)
            .await
            .expect("Node should start");
    }
}

/// Poll until `condition` holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
