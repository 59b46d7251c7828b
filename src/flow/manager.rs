//! The flow state machine manager.
//!
//! Owns the registry, the set of live flows, session routing, and the
//! state-machine change stream. Starting a node is a fixed sequence:
//! register flows, then `start`, which freezes the registry, resurrects
//! every checkpointed flow, and only then opens the inbound handler to
//! traffic.

use crate::checkpoint::{Checkpoint, CheckpointStore, SuspensionOutcome};
use crate::config::NodeConfig;
use crate::db::{DbError, DbTransaction, HostDb};
use crate::flow::context::{ContextParams, FlowContext};
use crate::flow::error::FlowError;
use crate::flow::event::{FlowDescriptor, FlowTransactionMapping, StateMachineUpdate};
use crate::flow::handle::{FlowHandle, TypedFlowHandle};
use crate::flow::progress::ProgressTracker;
use crate::flow::registry::{BoxedFlow, BoxedResponder, FlowRegistry};
use crate::flow::{InitiatedBy, RunId};
use crate::ledger::LedgerTracker;
use crate::net::{EndpointId, MessageBus, NetworkDirectory, Party, WireMessage};
use crate::session::{
    decode_message, encode_message, new_session_id, ErrorSessionEnd, NormalSessionEnd,
    SessionConfirm, SessionInit, SessionMessage, SessionReject, SessionRecord, SessionTable,
};
use slog::Drain;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// What the manager hands a flow's inbound queue.
pub(crate) enum InboundMessage {
    Session {
        from_endpoint: EndpointId,
        #[allow(dead_code)]
        from_party: Party,
        message: SessionMessage,
    },
    /// Kill request; observed at the flow's next suspension point.
    Abort,
}

/// What code a resurrected or fresh flow runs.
enum FlowKind {
    Initiator { flow: Arc<BoxedFlow>, input: Vec<u8> },
    Responder { responder: Arc<BoxedResponder>, counterparty: Party },
}

struct LiveFlow {
    descriptor: FlowDescriptor,
    abort: Arc<AtomicBool>,
    sessions: Arc<Mutex<SessionTable>>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    progress: ProgressTracker,
    task: Option<JoinHandle<()>>,
}

pub struct FlowManager {
    endpoint: EndpointId,
    party: Party,
    app_id: String,
    logger: slog::Logger,
    registry: Mutex<FlowRegistry>,
    db: Arc<HostDb>,
    store: Arc<dyn CheckpointStore>,
    bus: Arc<dyn MessageBus>,
    directory: Arc<NetworkDirectory>,
    ledger: Arc<LedgerTracker>,
    live: Mutex<HashMap<RunId, LiveFlow>>,
    /// Recipient routing: session id → owning flow's inbound queue.
    routes: Mutex<HashMap<u64, mpsc::UnboundedSender<InboundMessage>>>,
    /// Messages for sessions whose flow is not yet in memory, buffered
    /// under the destination session id.
    pending_messages: Mutex<HashMap<u64, Vec<InboundMessage>>>,
    /// Initiator session ids already serviced; duplicate inits are dropped
    /// instead of spawning a second responder.
    seen_inits: Mutex<HashSet<u64>>,
    results: Mutex<HashMap<RunId, Vec<u8>>>,
    /// Progress trackers of finished flows, kept so a tracked start can
    /// still attach its feed after a fast flow completed.
    finished_progress: Mutex<HashMap<RunId, ProgressTracker>>,
    tx_mappings: Mutex<Vec<FlowTransactionMapping>>,
    tx_mapping_tx: broadcast::Sender<FlowTransactionMapping>,
    network_ready: watch::Sender<bool>,
    accepting_inbound: AtomicBool,
    draining: AtomicBool,
    drain_timeout: Duration,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl FlowManager {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn CheckpointStore>,
        bus: Arc<dyn MessageBus>,
        directory: Arc<NetworkDirectory>,
        ledger: Arc<LedgerTracker>,
    ) -> Arc<Self> {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let logger = slog::Logger::root(drain, slog::o!("node" => config.endpoint.clone()));

        let db = Arc::new(HostDb::new(
            store.clone(),
            bus.clone(),
            config.update_buffer,
            logger.clone(),
        ));
        let (network_ready, _) = watch::channel(false);
        let (tx_mapping_tx, _) = broadcast::channel(config.update_buffer);

        Arc::new(Self {
            endpoint: config.endpoint,
            party: Party::new(config.party),
            app_id: config.app_id,
            logger,
            registry: Mutex::new(FlowRegistry::new()),
            db,
            store,
            bus,
            directory,
            ledger,
            live: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            pending_messages: Mutex::new(HashMap::new()),
            seen_inits: Mutex::new(HashSet::new()),
            results: Mutex::new(HashMap::new()),
            finished_progress: Mutex::new(HashMap::new()),
            tx_mappings: Mutex::new(Vec::new()),
            tx_mapping_tx,
            network_ready,
            accepting_inbound: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            drain_timeout: config.drain_timeout,
            pump: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn party(&self) -> &Party {
        &self.party
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn directory(&self) -> &Arc<NetworkDirectory> {
        &self.directory
    }

    pub fn ledger(&self) -> &Arc<LedgerTracker> {
        &self.ledger
    }

    pub fn logger(&self) -> &slog::Logger {
        &self.logger
    }

    pub(crate) async fn commit(&self, txn: DbTransaction) -> Result<(), DbError> {
        self.db.commit(txn).await
    }

    // ---- registration ----

    /// Register an initiating flow. Must happen before [`FlowManager::start`].
    pub fn register_initiator<I, O, F, Fut>(
        &self,
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
        let mut registry = self.registry.lock().unwrap();
        registry.register_initiator(name, version, startable_by_rpc, function)
    }

    /// Register a responder for an initiating flow name.
    pub fn register_responder<O, F, Fut>(
        &self,
        initiating_name: &str,
        version: u32,
        function: F,
    ) -> Result<(), FlowError>
    where
        O: serde::Serialize + Send + 'static,
        F: Fn(FlowContext, Party) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, FlowError>> + Send + 'static,
    {
        let mut registry = self.registry.lock().unwrap();
        registry.register_responder(initiating_name, version, function)
    }

    /// Registry introspection: (latest version, startable-by-RPC marker).
    pub fn initiator_info(&self, name: &str) -> Option<(u32, bool)> {
        let registry = self.registry.lock().unwrap();
        let version = registry.latest_version(name)?;
        let registration = registry.initiator(name, version)?;
        Some((registration.version, registration.startable_by_rpc))
    }

    /// Names of registered initiating flows.
    pub fn registered_flows(&self) -> Vec<String> {
        self.registry.lock().unwrap().registered_flows()
    }

    // ---- lifecycle ----

    /// Open the node: freeze the registry, resurrect every checkpointed
    /// flow, then start consuming inbound traffic from `inbox`.
    pub async fn start(
        self: &Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<WireMessage>,
    ) -> Result<(), FlowError> {
        self.registry.lock().unwrap().freeze();
        self.resurrect_all().await;
        self.accepting_inbound.store(true, Ordering::SeqCst);
        self.network_ready.send_replace(true);

        let manager = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if !manager.accepting_inbound.load(Ordering::SeqCst) {
                    break;
                }
                manager.dispatch(message).await;
            }
        });
        *self.pump.lock().unwrap() = Some(pump);
        Ok(())
    }

    /// Start a flow on this node. `initiated_by` records provenance; RPC
    /// permission checks happen in the RPC layer, peer-initiated flows
    /// never pass through here.
    pub async fn start_flow<I, O>(
        self: &Arc<Self>,
        name: &str,
        input: I,
        initiated_by: InitiatedBy,
    ) -> Result<TypedFlowHandle<O>, FlowError>
    where
        I: serde::Serialize,
        O: serde::de::DeserializeOwned,
    {
        if self.draining.load(Ordering::SeqCst) {
            return Err(FlowError::ShuttingDown);
        }
        // Starts queue until the network is ready; the entry point has not
        // run and no checkpoint exists until then.
        let mut ready = self.network_ready.subscribe();
        while !*ready.borrow_and_update() {
            ready.changed().await.map_err(|_| FlowError::ShuttingDown)?;
        }

        let (version, flow) = {
            let registry = self.registry.lock().unwrap();
            let version = registry
                .latest_version(name)
                .ok_or_else(|| FlowError::NotFound(name.to_string()))?;
            let registration = registry
                .initiator(name, version)
                .ok_or_else(|| FlowError::NotFound(name.to_string()))?;
            (version, registration.flow.clone())
        };
        let input_bytes =
            serde_json::to_vec(&input).map_err(|e| FlowError::Serialization(e.to_string()))?;

        let handle = self
            .launch_flow(
                name.to_string(),
                version,
                initiated_by,
                input_bytes.clone(),
                FlowKind::Initiator { flow, input: input_bytes },
            )
            .await?;
        Ok(TypedFlowHandle::new(handle))
    }

    /// Instantiate a flow: commit its initial checkpoint and `Added` event
    /// in one transaction (plus any handshake messages), then hand it to
    /// the scheduler. A failed commit discards the flow entirely.
    async fn launch_flow(
        self: &Arc<Self>,
        flow_name: String,
        flow_version: u32,
        initiated_by: InitiatedBy,
        input: Vec<u8>,
        kind: FlowKind,
    ) -> Result<FlowHandle, FlowError> {
        self.launch_with_sessions(
            flow_name,
            flow_version,
            initiated_by,
            input,
            kind,
            SessionTable::new(),
            None,
            Vec::new(),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch_with_sessions(
        self: &Arc<Self>,
        flow_name: String,
        flow_version: u32,
        initiated_by: InitiatedBy,
        input: Vec<u8>,
        kind: FlowKind,
        session_table: SessionTable,
        init_payload: Option<Vec<u8>>,
        handshake_outbound: Vec<WireMessage>,
    ) -> Result<FlowHandle, FlowError> {
        let run_id = RunId::new();
        let descriptor = FlowDescriptor {
            run_id,
            flow_name: flow_name.clone(),
            flow_version,
            initiated_by: initiated_by.clone(),
        };
        let journal = vec![SuspensionOutcome::EntryPoint];
        let checkpoint = Checkpoint {
            run_id,
            flow_name: flow_name.clone(),
            flow_version,
            initiated_by: initiated_by.clone(),
            input: input.clone(),
            journal: journal.clone(),
            sessions: session_table.clone(),
            init_payload: init_payload.clone(),
            pending_outbound: handshake_outbound.clone(),
        };
        let blob = checkpoint.encode()?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let abort = Arc::new(AtomicBool::new(false));
        let sessions = Arc::new(Mutex::new(session_table));
        let progress = ProgressTracker::default();
        let session_ids = sessions.lock().unwrap().session_ids();

        // Subscribe before committing so the handle cannot miss a Removed
        // event from a fast flow.
        let handle = FlowHandle::new(run_id, self.db.subscribe_updates(), self.clone());

        let mut txn = DbTransaction::new();
        txn.put_checkpoint(run_id, blob);
        txn.emit_update(StateMachineUpdate::Added {
            descriptor: descriptor.clone(),
        });
        for message in handshake_outbound {
            txn.send_message(message);
        }
        self.db
            .commit(txn)
            .await
            .map_err(|e| FlowError::Fatal(e.to_string()))?;

        {
            let mut live = self.live.lock().unwrap();
            live.insert(
                run_id,
                LiveFlow {
                    descriptor,
                    abort: abort.clone(),
                    sessions: sessions.clone(),
                    inbound_tx: inbound_tx.clone(),
                    progress: progress.clone(),
                    task: None,
                },
            );
        }
        for session_id in session_ids {
            self.register_route(session_id, &inbound_tx);
        }

        slog::info!(self.logger, "Started flow";
                    "run_id" => %run_id, "flow" => %flow_name, "version" => flow_version);

        let context = FlowContext::new(ContextParams {
            run_id,
            flow_name,
            flow_version,
            initiated_by,
            input,
            manager: self.clone(),
            logger: self.logger.new(slog::o!("run_id" => run_id.to_string())),
            inbound: inbound_rx,
            sessions,
            journal,
            init_payload,
            abort,
            progress,
        });
        self.spawn_driver(run_id, context, kind);
        Ok(handle)
    }

    fn spawn_driver(self: &Arc<Self>, run_id: RunId, context: FlowContext, kind: FlowKind) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let result = match kind {
                FlowKind::Initiator { flow, input } => flow.execute(input, context).await,
                FlowKind::Responder { responder, counterparty } => {
                    responder.execute(context, counterparty).await
                }
            };
            manager.finish_flow(run_id, result).await;
        });
        let mut live = self.live.lock().unwrap();
        if let Some(entry) = live.get_mut(&run_id) {
            entry.task = Some(task);
        }
    }

    /// Terminal transition: delete the checkpoint, fan out session ends,
    /// and emit `Removed`, all in one transaction. Checkpoint deletion is
    /// the sole marker of completion.
    async fn finish_flow(self: &Arc<Self>, run_id: RunId, result: Result<Vec<u8>, FlowError>) {
        let entry = {
            let mut live = self.live.lock().unwrap();
            live.remove(&run_id)
        };
        let Some(entry) = entry else { return };

        match &result {
            Ok(_) => slog::info!(self.logger, "Flow finished"; "run_id" => %run_id),
            Err(e) => slog::warn!(self.logger, "Flow failed"; "run_id" => %run_id, "error" => %e),
        }

        let open_sessions = entry.sessions.lock().unwrap().open_sessions();
        let mut txn = DbTransaction::new();
        txn.remove_checkpoint(run_id);
        for record in &open_sessions {
            // A session still awaiting confirmation has no peer address to
            // end towards; the peer learns of the failure from its own
            // protocol timeouts.
            let (Some(peer_id), Some(endpoint)) = (record.peer_id, record.endpoint.clone()) else {
                continue;
            };
            let message = match &result {
                Ok(_) => SessionMessage::NormalEnd(NormalSessionEnd {
                    recipient_session_id: peer_id,
                }),
                Err(e) => SessionMessage::ErrorEnd(ErrorSessionEnd {
                    recipient_session_id: peer_id,
                    error: e.wire_error(),
                }),
            };
            match self.wire_to(&endpoint, &message) {
                Ok(wire) => txn.send_message(wire),
                Err(e) => {
                    slog::error!(self.logger, "Failed to encode session end"; "error" => %e)
                }
            }
        }

        let result_bytes = serde_json::to_vec(&result).unwrap_or_else(|e| {
            serde_json::to_vec(&Err::<Vec<u8>, FlowError>(FlowError::Serialization(
                e.to_string(),
            )))
            .unwrap_or_default()
        });
        self.results.lock().unwrap().insert(run_id, result_bytes.clone());
        self.finished_progress
            .lock()
            .unwrap()
            .insert(run_id, entry.progress.clone());
        txn.emit_update(StateMachineUpdate::Removed {
            run_id,
            result: result_bytes,
        });

        if let Err(e) = self.db.commit(txn).await {
            slog::error!(self.logger, "Failed to commit terminal transition";
                         "run_id" => %run_id, "error" => %e);
        }

        let mut routes = self.routes.lock().unwrap();
        for session_id in entry.sessions.lock().unwrap().session_ids() {
            routes.remove(&session_id);
        }
    }

    // ---- inbound handling ----

    async fn dispatch(self: &Arc<Self>, wire: WireMessage) {
        let message = match decode_message(&wire.bytes) {
            Ok(message) => message,
            Err(e) => {
                slog::warn!(self.logger, "Dropping undecodable message";
                            "from" => %wire.from_endpoint, "error" => %e);
                return;
            }
        };
        match message {
            SessionMessage::Init(init) => {
                self.handle_init(wire.from_endpoint, wire.from_party, init).await;
            }
            other => {
                let Some(session_id) = other.recipient_session_id() else {
                    return;
                };
                let inbound = InboundMessage::Session {
                    from_endpoint: wire.from_endpoint,
                    from_party: wire.from_party,
                    message: other,
                };
                let route = {
                    let routes = self.routes.lock().unwrap();
                    routes.get(&session_id).cloned()
                };
                match route {
                    Some(tx) => {
                        let _ = tx.send(inbound);
                    }
                    None => {
                        // Receiver not instantiated yet; buffer under the
                        // destination session id.
                        let mut pending = self.pending_messages.lock().unwrap();
                        pending.entry(session_id).or_default().push(inbound);
                    }
                }
            }
        }
    }

    /// Service a session init: look up a responder factory for the
    /// initiating flow at a compatible version, confirm the session, and
    /// launch the responder. Unknown names get exactly one reject.
    async fn handle_init(
        self: &Arc<Self>,
        from_endpoint: EndpointId,
        from_party: Party,
        init: SessionInit,
    ) {
        let duplicate = {
            let mut seen = self.seen_inits.lock().unwrap();
            !seen.insert(init.initiator_session_id)
        };
        if duplicate {
            // A restarted initiator republishes its init; the original
            // confirm may have died with its old inbox. Answer with the
            // confirmation again instead of spawning a second responder.
            slog::debug!(self.logger, "Re-confirming duplicate session init";
                         "initiator_session_id" => init.initiator_session_id);
            self.reconfirm_session(&from_endpoint, &init).await;
            return;
        }

        let responder = {
            let registry = self.registry.lock().unwrap();
            registry.responder_for(&init.flow_name, init.flow_version)
        };
        let Some((version, responder)) = responder else {
            slog::info!(self.logger, "Rejecting session init";
                        "flow" => %init.flow_name, "from" => %from_party);
            let reject = SessionMessage::Reject(SessionReject {
                initiator_session_id: init.initiator_session_id,
                error_message: format!("Don't know {}", init.flow_name),
            });
            match self.wire_to(&from_endpoint, &reject) {
                Ok(wire) => {
                    if let Err(e) = self.bus.publish(wire).await {
                        slog::warn!(self.logger, "Failed to publish reject"; "error" => %e);
                    }
                }
                Err(e) => slog::error!(self.logger, "Failed to encode reject"; "error" => %e),
            }
            return;
        };

        let own_id = new_session_id();
        let init_payload = init.first_payload.clone();
        let mut session_table = SessionTable::new();
        session_table.insert(SessionRecord::confirmed(
            own_id,
            init.initiator_session_id,
            from_party.clone(),
            from_endpoint.clone(),
            init.flow_version,
            init_payload.is_some(),
        ));

        let confirm = SessionMessage::Confirm(SessionConfirm {
            initiator_session_id: init.initiator_session_id,
            confirmer_session_id: own_id,
            flow_version: version,
            app_id: self.app_id.clone(),
        });
        let confirm_wire = match self.wire_to(&from_endpoint, &confirm) {
            Ok(wire) => wire,
            Err(e) => {
                slog::error!(self.logger, "Failed to encode confirm"; "error" => %e);
                return;
            }
        };

        let launch = self
            .launch_with_sessions(
                init.flow_name.clone(),
                version,
                InitiatedBy::Peer { party: from_party.clone() },
                Vec::new(),
                FlowKind::Responder { responder, counterparty: from_party },
                session_table,
                init_payload,
                vec![confirm_wire],
            )
            .await;
        if let Err(e) = launch {
            slog::error!(self.logger, "Failed to launch responder";
                         "flow" => %init.flow_name, "error" => %e);
        }
    }

    /// Find the responder session already serving this init and repeat
    /// its confirmation.
    async fn reconfirm_session(&self, from_endpoint: &EndpointId, init: &SessionInit) {
        let confirm = {
            let live = self.live.lock().unwrap();
            live.values().find_map(|entry| {
                let sessions = entry.sessions.lock().unwrap();
                sessions.session_ids().into_iter().find_map(|session_id| {
                    let record = sessions.get(session_id)?;
                    if !record.initiated_here
                        && record.peer_id == Some(init.initiator_session_id)
                    {
                        Some(SessionConfirm {
                            initiator_session_id: init.initiator_session_id,
                            confirmer_session_id: record.own_id,
                            flow_version: entry.descriptor.flow_version,
                            app_id: self.app_id.clone(),
                        })
                    } else {
                        None
                    }
                })
            })
        };
        let Some(confirm) = confirm else { return };
        match self.wire_to(from_endpoint, &SessionMessage::Confirm(confirm)) {
            Ok(wire) => {
                if let Err(e) = self.bus.publish(wire).await {
                    slog::warn!(self.logger, "Failed to republish confirm"; "error" => %e);
                }
            }
            Err(e) => slog::error!(self.logger, "Failed to encode confirm"; "error" => %e),
        }
    }

    // ---- resurrection ----

    /// Enumerate checkpoints and bring every suspended flow back before
    /// the inbound handler opens.
    async fn resurrect_all(self: &Arc<Self>) {
        for (run_id, blob) in self.store.list() {
            match Checkpoint::decode(&blob) {
                Ok(checkpoint) => {
                    if let Err(e) = self.resurrect(checkpoint).await {
                        slog::error!(self.logger, "Failed to resurrect flow";
                                     "run_id" => %run_id, "error" => %e);
                    }
                }
                // Schema mismatch or corruption is fatal to this flow;
                // reported here, out of band.
                Err(e) => slog::error!(self.logger, "Unreadable checkpoint";
                                       "run_id" => %run_id, "error" => %e),
            }
        }
    }

    async fn resurrect(self: &Arc<Self>, checkpoint: Checkpoint) -> Result<(), FlowError> {
        let kind = {
            let registry = self.registry.lock().unwrap();
            match &checkpoint.initiated_by {
                InitiatedBy::Peer { party } => {
                    let (_, responder) = registry
                        .responder_for(&checkpoint.flow_name, checkpoint.flow_version)
                        .ok_or_else(|| FlowError::NotFound(checkpoint.flow_name.clone()))?;
                    FlowKind::Responder { responder, counterparty: party.clone() }
                }
                _ => {
                    let registration = registry
                        .initiator(&checkpoint.flow_name, checkpoint.flow_version)
                        .ok_or_else(|| FlowError::NotFound(checkpoint.flow_name.clone()))?;
                    FlowKind::Initiator {
                        flow: registration.flow.clone(),
                        input: checkpoint.input.clone(),
                    }
                }
            }
        };

        let run_id = checkpoint.run_id;
        let descriptor = FlowDescriptor {
            run_id,
            flow_name: checkpoint.flow_name.clone(),
            flow_version: checkpoint.flow_version,
            initiated_by: checkpoint.initiated_by.clone(),
        };
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let abort = Arc::new(AtomicBool::new(false));
        let sessions = Arc::new(Mutex::new(checkpoint.sessions.clone()));
        let progress = ProgressTracker::default();
        let session_ids = sessions.lock().unwrap().session_ids();

        // Remember serviced inits so a counterparty republishing its init
        // cannot spawn a second responder.
        {
            let table = sessions.lock().unwrap();
            let mut seen = self.seen_inits.lock().unwrap();
            for session_id in table.session_ids() {
                if let Some(record) = table.get(session_id) {
                    if !record.initiated_here {
                        if let Some(peer_id) = record.peer_id {
                            seen.insert(peer_id);
                        }
                    }
                }
            }
        }

        {
            let mut live = self.live.lock().unwrap();
            live.insert(
                run_id,
                LiveFlow {
                    descriptor,
                    abort: abort.clone(),
                    sessions: sessions.clone(),
                    inbound_tx: inbound_tx.clone(),
                    progress: progress.clone(),
                    task: None,
                },
            );
        }
        for session_id in session_ids {
            self.register_route(session_id, &inbound_tx);
        }

        // Republish the latest suspension's messages; receivers dedup.
        for message in checkpoint.pending_outbound.clone() {
            if let Err(e) = self.bus.publish(message).await {
                slog::warn!(self.logger, "Failed to republish pending message";
                            "run_id" => %run_id, "error" => %e);
            }
        }

        slog::info!(self.logger, "Resurrected flow";
                    "run_id" => %run_id, "flow" => %checkpoint.flow_name,
                    "journal_len" => checkpoint.journal.len());

        let context = FlowContext::new(ContextParams {
            run_id,
            flow_name: checkpoint.flow_name,
            flow_version: checkpoint.flow_version,
            initiated_by: checkpoint.initiated_by,
            input: checkpoint.input,
            manager: self.clone(),
            logger: self.logger.new(slog::o!("run_id" => run_id.to_string())),
            inbound: inbound_rx,
            sessions,
            journal: checkpoint.journal,
            init_payload: checkpoint.init_payload,
            abort,
            progress,
        });
        self.spawn_driver(run_id, context, kind);
        Ok(())
    }

    // ---- routing ----

    pub(crate) fn register_session_route(&self, run_id: RunId, session_id: u64) {
        let inbound_tx = {
            let live = self.live.lock().unwrap();
            live.get(&run_id).map(|entry| entry.inbound_tx.clone())
        };
        if let Some(tx) = inbound_tx {
            self.register_route(session_id, &tx);
        }
    }

    fn register_route(&self, session_id: u64, tx: &mpsc::UnboundedSender<InboundMessage>) {
        self.routes.lock().unwrap().insert(session_id, tx.clone());
        let buffered = self.pending_messages.lock().unwrap().remove(&session_id);
        if let Some(messages) = buffered {
            for message in messages {
                let _ = tx.send(message);
            }
        }
    }

    fn wire_to(&self, endpoint: &EndpointId, message: &SessionMessage) -> Result<WireMessage, FlowError> {
        let bytes = encode_message(message).map_err(|e| FlowError::Serialization(e.to_string()))?;
        Ok(WireMessage {
            from_endpoint: self.endpoint.clone(),
            from_party: self.party.clone(),
            to_endpoint: endpoint.clone(),
            bytes,
        })
    }

    // ---- introspection and control ----

    /// Snapshot of all live flows.
    pub fn state_machines(&self) -> Vec<FlowDescriptor> {
        let live = self.live.lock().unwrap();
        live.values().map(|entry| entry.descriptor.clone()).collect()
    }

    /// Subscribe to the state-machine change stream.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<StateMachineUpdate> {
        self.db.subscribe_updates()
    }

    /// Serialized terminal result of a finished flow, if known.
    pub fn result_of(&self, run_id: &RunId) -> Option<Vec<u8>> {
        self.results.lock().unwrap().get(run_id).cloned()
    }

    /// Record that a flow observed a ledger transaction as committed.
    pub(crate) fn record_transaction_mapping(&self, run_id: RunId, tx_hash: &str) {
        let mapping = FlowTransactionMapping {
            run_id,
            tx_hash: tx_hash.to_string(),
        };
        self.tx_mappings.lock().unwrap().push(mapping.clone());
        let _ = self.tx_mapping_tx.send(mapping);
    }

    /// Flow-to-transaction associations recorded so far.
    pub fn transaction_mappings(&self) -> Vec<FlowTransactionMapping> {
        self.tx_mappings.lock().unwrap().clone()
    }

    /// Subscribe to new flow-to-transaction associations.
    pub fn subscribe_transaction_mappings(&self) -> broadcast::Receiver<FlowTransactionMapping> {
        self.tx_mapping_tx.subscribe()
    }

    /// Progress tracker of a live or recently finished flow.
    pub fn progress_of(&self, run_id: &RunId) -> Option<ProgressTracker> {
        {
            let live = self.live.lock().unwrap();
            if let Some(entry) = live.get(run_id) {
                return Some(entry.progress.clone());
            }
        }
        self.finished_progress.lock().unwrap().get(run_id).cloned()
    }

    /// Mark a flow for termination at its next suspension point. There is
    /// no asynchronous kill; a flow between suspensions runs to the next
    /// one first.
    pub fn kill_flow(&self, run_id: &RunId) -> bool {
        let live = self.live.lock().unwrap();
        match live.get(run_id) {
            Some(entry) => {
                entry.abort.store(true, Ordering::SeqCst);
                let _ = entry.inbound_tx.send(InboundMessage::Abort);
                true
            }
            None => false,
        }
    }

    /// Graceful shutdown: halt inbound traffic, give in-flight flows the
    /// configured grace to reach their next suspension point (which
    /// checkpoints) or finish, then stop the remaining tasks.
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.accepting_inbound.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        loop {
            let busy = {
                let live = self.live.lock().unwrap();
                live.values()
                    .any(|entry| entry.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false))
            };
            if !busy || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let mut live = self.live.lock().unwrap();
        for entry in live.values_mut() {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
        slog::info!(self.logger, "Flow manager stopped");
    }

    /// Tear the node down without draining, as a crash would. Checkpoints
    /// stay authoritative; a new manager over the same store resumes every
    /// suspended flow. Test harnesses only.
    pub fn halt(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.accepting_inbound.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        let mut live = self.live.lock().unwrap();
        for (_, mut entry) in live.drain() {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
        self.routes.lock().unwrap().clear();
        self.pending_messages.lock().unwrap().clear();
    }
}
