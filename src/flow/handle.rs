//! Handles to running flows.

use crate::flow::error::FlowError;
use crate::flow::event::StateMachineUpdate;
use crate::flow::manager::FlowManager;
use crate::flow::RunId;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Handle to one flow run: its id plus a future-like view of the terminal
/// result, fed by the state-machine change stream.
pub struct FlowHandle {
    run_id: RunId,
    updates: broadcast::Receiver<StateMachineUpdate>,
    manager: Arc<FlowManager>,
}

impl FlowHandle {
    pub(crate) fn new(
        run_id: RunId,
        updates: broadcast::Receiver<StateMachineUpdate>,
        manager: Arc<FlowManager>,
    ) -> Self {
        Self {
            run_id,
            updates,
            manager,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Wait for the flow's terminal transition and return the serialized
    /// result (`Result<Vec<u8>, FlowError>` in the framework codec).
    pub async fn result_bytes(mut self) -> Result<Vec<u8>, FlowError> {
        // The flow may already be done; the result slot outlives the event.
        if let Some(bytes) = self.manager.result_of(&self.run_id) {
            return Ok(bytes);
        }
        loop {
            match self.updates.recv().await {
                Ok(StateMachineUpdate::Removed { run_id, result }) if run_id == self.run_id => {
                    return Ok(result)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // We may have lagged past our own Removed event.
                    if let Some(bytes) = self.manager.result_of(&self.run_id) {
                        return Ok(bytes);
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FlowError::ShuttingDown),
            }
        }
    }
}

/// Typed view over [`FlowHandle`].
pub struct TypedFlowHandle<O> {
    inner: FlowHandle,
    _phantom: std::marker::PhantomData<O>,
}

impl<O> TypedFlowHandle<O>
where
    O: serde::de::DeserializeOwned,
{
    pub fn new(inner: FlowHandle) -> Self {
        Self {
            inner,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.inner.run_id()
    }

    /// Wait for completion and decode the typed result. Flow errors
    /// (business, counterparty, protocol, fatal) come back as `Err`.
    pub async fn result(self) -> Result<O, FlowError> {
        let bytes = self.inner.result_bytes().await?;
        let result: Result<Vec<u8>, FlowError> = serde_json::from_slice(&bytes)
            .map_err(|e| FlowError::Deserialization(e.to_string()))?;
        let output_bytes = result?;
        serde_json::from_slice(&output_bytes).map_err(|e| FlowError::Deserialization(e.to_string()))
    }
}
