//! Node configuration for the flow framework.

use std::time::Duration;

/// Configuration for a flow-framework node.
pub struct NodeConfig {
    /// Endpoint identifier this node registers with the message bus
    /// (e.g. "bank-a-0"). Several endpoints may serve one logical party.
    pub endpoint: String,

    /// Logical party identity this node speaks for (e.g. "BankA").
    pub party: String,

    /// Application identity string carried in session handshakes.
    pub app_id: String,

    /// Capacity of the state-machine update broadcast channel. Slow
    /// subscribers lag past this bound instead of blocking flows.
    pub update_buffer: usize,

    /// How long a graceful shutdown waits for in-flight flows to reach
    /// their next suspension point before their tasks are stopped.
    pub drain_timeout: Duration,
}

impl NodeConfig {
    /// Create a configuration with default buffering and drain settings.
    pub fn new(endpoint: impl Into<String>, party: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            party: party.into(),
            app_id: "ledgerflow".to_string(),
            update_buffer: 1024,
            drain_timeout: Duration::from_secs(5),
        }
    }

    /// Set the application identity string.
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Set the update broadcast buffer capacity.
    pub fn with_update_buffer(mut self, capacity: usize) -> Self {
        self.update_buffer = capacity;
        self
    }

    /// Set the graceful-shutdown drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}
