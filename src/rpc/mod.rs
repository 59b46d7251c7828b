//! RPC lifecycle surface for flows.
//!
//! Wraps the flow manager with per-call authentication: starting a flow
//! requires the `StartFlow.<name>` permission (or the global override) and
//! the flow must carry the startable-by-RPC marker. Feeds pair an
//! immutable snapshot with a live delta stream; closing the stream is the
//! client's responsibility.

use crate::flow::error::FlowError;
use crate::flow::event::{FlowDescriptor, FlowTransactionMapping, StateMachineUpdate};
use crate::flow::manager::FlowManager;
use crate::flow::progress::ProgressStep;
use crate::flow::{InitiatedBy, TypedFlowHandle};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Permission granting every flow-start right.
pub const ALL_FLOWS_PERMISSION: &str = "ALL";

/// Permission string required to start the named flow.
pub fn start_flow_permission(flow_name: &str) -> String {
    format!("StartFlow.{}", flow_name)
}

/// An authenticated RPC client.
#[derive(Clone, Debug)]
pub struct RpcUser {
    pub username: String,
    permissions: HashSet<String>,
}

impl RpcUser {
    pub fn new(
        username: impl Into<String>,
        permissions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            username: username.into(),
            permissions: permissions.into_iter().collect(),
        }
    }

    pub fn can_start(&self, flow_name: &str) -> bool {
        self.permissions.contains(ALL_FLOWS_PERMISSION)
            || self.permissions.contains(&start_flow_permission(flow_name))
    }
}

/// An immutable snapshot paired with the stream of deltas since it was
/// taken.
pub struct Feed<S, U> {
    pub snapshot: S,
    pub updates: broadcast::Receiver<U>,
}

/// Handle for a tracked start: the result future plus the progress feed.
pub struct FlowProgressHandle<O> {
    pub handle: TypedFlowHandle<O>,
    pub progress: Feed<(Vec<String>, Option<usize>), ProgressStep>,
}

/// The flow-lifecycle operations exposed to RPC clients.
pub struct FlowRpcService {
    manager: Arc<FlowManager>,
}

impl FlowRpcService {
    pub fn new(manager: Arc<FlowManager>) -> Self {
        Self { manager }
    }

    fn authorize(&self, user: &RpcUser, flow_name: &str) -> Result<(), FlowError> {
        let (_, startable_by_rpc) = self
            .manager
            .initiator_info(flow_name)
            .ok_or_else(|| FlowError::NotFound(flow_name.to_string()))?;
        if !startable_by_rpc {
            return Err(FlowError::NotStartableByRpc(flow_name.to_string()));
        }
        if !user.can_start(flow_name) {
            return Err(FlowError::PermissionDenied(format!(
                "User '{}' may not start flow '{}'",
                user.username, flow_name
            )));
        }
        Ok(())
    }

    /// Start a flow for an authenticated user.
    pub async fn start_flow<I, O>(
        &self,
        user: &RpcUser,
        flow_name: &str,
        input: I,
    ) -> Result<TypedFlowHandle<O>, FlowError>
    where
        I: serde::Serialize,
        O: serde::de::DeserializeOwned,
    {
        self.authorize(user, flow_name)?;
        self.manager
            .start_flow(
                flow_name,
                input,
                InitiatedBy::Rpc {
                    username: user.username.clone(),
                },
            )
            .await
    }

    /// Start a flow and additionally stream its progress steps.
    pub async fn start_tracked_flow<I, O>(
        &self,
        user: &RpcUser,
        flow_name: &str,
        input: I,
    ) -> Result<FlowProgressHandle<O>, FlowError>
    where
        I: serde::Serialize,
        O: serde::de::DeserializeOwned,
    {
        self.authorize(user, flow_name)?;
        let handle: TypedFlowHandle<O> = self
            .manager
            .start_flow(
                flow_name,
                input,
                InitiatedBy::Rpc {
                    username: user.username.clone(),
                },
            )
            .await?;
        let tracker = self
            .manager
            .progress_of(&handle.run_id())
            .ok_or_else(|| FlowError::NotFound(format!("Flow run {}", handle.run_id())))?;
        let updates = tracker.subscribe();
        let snapshot = tracker.snapshot();
        Ok(FlowProgressHandle {
            handle,
            progress: Feed { snapshot, updates },
        })
    }

    /// Current state machines plus the add/remove stream.
    pub fn state_machines_feed(&self) -> Feed<Vec<FlowDescriptor>, StateMachineUpdate> {
        // Subscribe before snapshotting so nothing falls in the gap; a
        // flow added in between shows up in both, which clients tolerate.
        let updates = self.manager.subscribe_updates();
        let snapshot = self.manager.state_machines();
        Feed { snapshot, updates }
    }

    /// Associations between state machines and the ledger transactions
    /// they observed as recorded, plus the live stream of new ones.
    pub fn state_machine_recorded_transaction_mapping_feed(
        &self,
    ) -> Feed<Vec<FlowTransactionMapping>, FlowTransactionMapping> {
        let updates = self.manager.subscribe_transaction_mappings();
        let snapshot = self.manager.transaction_mappings();
        Feed { snapshot, updates }
    }

    /// Names of flows registered as startable on this node.
    pub fn registered_flows(&self) -> Vec<String> {
        self.manager.registered_flows()
    }
}
