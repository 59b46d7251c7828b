//! Registry of startable flows and responder factories.
//!
//! Initiating flows register under a (name, version) key; responders
//! register against the *initiating* flow's name, and the handshake picks
//! the highest registered responder version not above what the initiator
//! requested. The registry is populated at startup and frozen before the
//! node opens for traffic; dynamic additions exist only for test
//! harnesses, through the explicitly unchecked entry point.

use crate::flow::context::FlowContext;
use crate::flow::error::FlowError;
use crate::net::Party;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type FlowFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, FlowError>> + Send>>;

/// Type-erased initiating flow. Takes the serialized input and the
/// execution context; yields the serialized output.
///
/// Flow logic between suspension points must be deterministic in the input
/// and previously received values: a resumed flow is re-executed against
/// its journal, and a non-deterministic flow would diverge from its own
/// checkpoint.
pub struct BoxedFlow {
    executor: Box<dyn Fn(Vec<u8>, FlowContext) -> FlowFuture + Send + Sync>,
}

impl BoxedFlow {
    pub fn new<I, O, F, Fut>(function: F) -> Self
    where
        I: for<'de> serde::Deserialize<'de> + Send + 'static,
        O: serde::Serialize + Send + 'static,
        F: Fn(I, FlowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, FlowError>> + Send + 'static,
    {
        let function = Arc::new(function);
        let executor = Box::new(move |input_bytes: Vec<u8>, context: FlowContext| {
            let function = function.clone();
            Box::pin(async move {
                let input: I = serde_json::from_slice(&input_bytes)
                    .map_err(|e| FlowError::Deserialization(e.to_string()))?;
                let output = function(input, context).await?;
                serde_json::to_vec(&output).map_err(|e| FlowError::Serialization(e.to_string()))
            }) as FlowFuture
        });
        BoxedFlow { executor }
    }

    pub fn execute(&self, input: Vec<u8>, context: FlowContext) -> FlowFuture {
        (self.executor)(input, context)
    }
}

/// Type-erased responder flow, spawned to service a counterparty's init.
pub struct BoxedResponder {
    executor: Box<dyn Fn(FlowContext, Party) -> FlowFuture + Send + Sync>,
}

impl BoxedResponder {
    pub fn new<O, F, Fut>(function: F) -> Self
    where
        O: serde::Serialize + Send + 'static,
        F: Fn(FlowContext, Party) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, FlowError>> + Send + 'static,
    {
        let function = Arc::new(function);
        let executor = Box::new(move |context: FlowContext, counterparty: Party| {
            let function = function.clone();
            Box::pin(async move {
                let output = function(context, counterparty).await?;
                serde_json::to_vec(&output).map_err(|e| FlowError::Serialization(e.to_string()))
            }) as FlowFuture
        });
        BoxedResponder { executor }
    }

    pub fn execute(&self, context: FlowContext, counterparty: Party) -> FlowFuture {
        (self.executor)(context, counterparty)
    }
}

/// One initiating-flow registration.
pub struct InitiatorRegistration {
    pub version: u32,
    /// Machine-readable marker: only flows registered with this set may be
    /// started through the RPC surface.
    pub startable_by_rpc: bool,
    pub flow: Arc<BoxedFlow>,
}

/// Process-wide flow registry with an init-at-startup, frozen-thereafter
/// lifecycle.
#[derive(Default)]
pub struct FlowRegistry {
    initiators: HashMap<(String, u32), InitiatorRegistration>,
    responders: HashMap<String, BTreeMap<u32, Arc<BoxedResponder>>>,
    frozen: bool,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initiating flow under (name, version).
    ///
    /// `startable_by_rpc` gates the RPC surface; peer-initiated spawning
    /// never consults it.
    pub fn register_initiator<I, O, F, Fut>(
        &mut self,
        name: &str,
        version: u32,
        startable_by_rpc: bool,
        function: F,
    ) -> Result<(), FlowError>
    where
        I: for<'de> serde::Deserialize<'de> + Send + 'static,
        O: serde::Serialize + Send + 'static,
        F: Fn(I, FlowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, FlowError>> + Send + 'static,
    {
        if self.frozen {
            return Err(FlowError::RegistryFrozen);
        }
        let key = (name.to_string(), version);
        if self.initiators.contains_key(&key) {
            return Err(FlowError::AlreadyExists(format!(
                "Initiating flow '{}' version {}",
                name, version
            )));
        }
        self.initiators.insert(
            key,
            InitiatorRegistration {
                version,
                startable_by_rpc,
                flow: Arc::new(BoxedFlow::new(function)),
            },
        );
        Ok(())
    }

    /// Register a responder for an initiating flow name at a version.
    ///
    /// Registering twice for the same (name, version) is rejected: a
    /// customization may not re-attach to a name that already carries a
    /// registration at that version.
    pub fn register_responder<O, F, Fut>(
        &mut self,
        initiating_name: &str,
        version: u32,
        function: F,
    ) -> Result<(), FlowError>
    where
        O: serde::Serialize + Send + 'static,
        F: Fn(FlowContext, Party) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, FlowError>> + Send + 'static,
    {
        if self.frozen {
            return Err(FlowError::RegistryFrozen);
        }
        self.insert_responder(initiating_name, version, function)
    }

    /// Bypass the frozen check. For test harnesses only; production
    /// registration happens before [`FlowRegistry::freeze`].
    pub fn register_responder_unchecked<O, F, Fut>(
        &mut self,
        initiating_name: &str,
        version: u32,
        function: F,
    ) -> Result<(), FlowError>
    where
        O: serde::Serialize + Send + 'static,
        F: Fn(FlowContext, Party) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, FlowError>> + Send + 'static,
    {
        self.insert_responder(initiating_name, version, function)
    }

    fn insert_responder<O, F, Fut>(
        &mut self,
        initiating_name: &str,
        version: u32,
        function: F,
    ) -> Result<(), FlowError>
    where
        O: serde::Serialize + Send + 'static,
        F: Fn(FlowContext, Party) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, FlowError>> + Send + 'static,
    {
        let versions = self.responders.entry(initiating_name.to_string()).or_default();
        if versions.contains_key(&version) {
            return Err(FlowError::AlreadyExists(format!(
                "Responder for '{}' version {}",
                initiating_name, version
            )));
        }
        versions.insert(version, Arc::new(BoxedResponder::new(function)));
        Ok(())
    }

    /// Freeze the registry. Called when the node opens for traffic.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn initiator(&self, name: &str, version: u32) -> Option<&InitiatorRegistration> {
        self.initiators.get(&(name.to_string(), version))
    }

    /// Highest registered version of an initiating flow.
    pub fn latest_version(&self, name: &str) -> Option<u32> {
        self.initiators
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .max()
    }

    /// Select a responder: the highest registered version not above what
    /// the initiator requested.
    pub fn responder_for(
        &self,
        initiating_name: &str,
        requested_version: u32,
    ) -> Option<(u32, Arc<BoxedResponder>)> {
        let versions = self.responders.get(initiating_name)?;
        versions
            .range(..=requested_version)
            .next_back()
            .map(|(version, responder)| (*version, responder.clone()))
    }

    /// Names of all registered initiating flows, deduplicated and sorted.
    pub fn registered_flows(&self) -> Vec<String> {
        let mut names: Vec<String> = self.initiators.keys().map(|(n, _)| n.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.initiators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.initiators.is_empty()
    }
}
