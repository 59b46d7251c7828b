//! Flow execution context and its suspending primitives.
//!
//! A flow is an ordinary sequential async function; the context provides
//! the operations that may suspend it: `send`, `receive`,
//! `send_and_receive`, `wait_for_ledger_commit`, `sleep_for`, and the
//! sub-flow boundary. Every suspension appends its outcome to a journal
//! and commits a checkpoint (plus any outbound messages) in one host
//! transaction before the effect becomes observable.
//!
//! Resumption is replay: the flow function is re-executed from its input,
//! and while journal entries remain each primitive returns the recorded
//! outcome without touching the wire. Once the journal is exhausted the
//! primitives go live again.

use crate::checkpoint::{Checkpoint, SuspensionOutcome};
use crate::db::DbTransaction;
use crate::flow::error::FlowError;
use crate::flow::manager::{FlowManager, InboundMessage};
use crate::flow::progress::ProgressTracker;
use crate::flow::{InitiatedBy, RunId};
use crate::net::{EndpointId, Party, WireMessage};
use crate::session::{
    encode_message, new_session_id, SessionData, SessionInit, SessionMessage, SessionRecord,
    SessionState, SessionTable,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub(crate) struct ContextParams {
    pub run_id: RunId,
    pub flow_name: String,
    pub flow_version: u32,
    pub initiated_by: InitiatedBy,
    pub input: Vec<u8>,
    pub manager: Arc<FlowManager>,
    pub logger: slog::Logger,
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
    pub sessions: Arc<Mutex<SessionTable>>,
    pub journal: Vec<SuspensionOutcome>,
    pub init_payload: Option<Vec<u8>>,
    pub abort: Arc<AtomicBool>,
    pub progress: ProgressTracker,
}

/// Context handed to a flow function for its whole run.
pub struct FlowContext {
    run_id: RunId,
    flow_name: String,
    flow_version: u32,
    initiated_by: InitiatedBy,
    input: Vec<u8>,
    manager: Arc<FlowManager>,
    logger: slog::Logger,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    /// Shared with the manager so terminal handling can fan out session
    /// ends after the flow future is gone.
    sessions: Arc<Mutex<SessionTable>>,
    journal: Vec<SuspensionOutcome>,
    /// Next journal entry to replay. Past the end means live execution.
    cursor: usize,
    /// Data that arrived for sessions other than the one currently awaited.
    stash: HashMap<u64, VecDeque<SessionData>>,
    /// Payload that rode in on the session init, for responder flows.
    init_payload: Option<Vec<u8>>,
    abort: Arc<AtomicBool>,
    progress: ProgressTracker,
}

impl FlowContext {
    pub(crate) fn new(params: ContextParams) -> Self {
        Self {
            run_id: params.run_id,
            flow_name: params.flow_name,
            flow_version: params.flow_version,
            initiated_by: params.initiated_by,
            input: params.input,
            manager: params.manager,
            logger: params.logger,
            inbound: params.inbound,
            sessions: params.sessions,
            journal: params.journal,
            // Entry 0 is always EntryPoint, consumed by the initial
            // checkpoint at start.
            cursor: 1,
            stash: HashMap::new(),
            init_payload: params.init_payload,
            abort: params.abort,
            progress: params.progress,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The party this node speaks for.
    pub fn our_identity(&self) -> Party {
        self.manager.party().clone()
    }

    pub fn logger(&self) -> &slog::Logger {
        &self.logger
    }

    /// Version the counterparty on this session actually speaks, known
    /// once the handshake completes.
    pub fn peer_version(&self, party: &Party) -> Option<u32> {
        let sessions = self.sessions.lock().unwrap();
        let session_id = sessions.bound_session(party)?;
        sessions.get(session_id)?.peer_version
    }

    /// Report a progress step on this flow's progress feed.
    pub fn progress_to(&self, label: &str) {
        self.progress.set_step(label);
    }

    /// Payload that rode in on the session init, for responder flows.
    /// Handed over at instantiation and durable in the checkpoint; it is
    /// never delivered through `receive`.
    pub fn init_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, FlowError> {
        match &self.init_payload {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| FlowError::Deserialization(e.to_string())),
        }
    }

    /// Send a payload to a party, opening a session if none is bound.
    ///
    /// Opening piggybacks the payload on the session init; on an
    /// established session this emits a data message. Either way the
    /// checkpoint commits before the message leaves the node.
    pub async fn send<S: Serialize>(&mut self, party: &Party, payload: &S) -> Result<(), FlowError> {
        self.check_abort()?;
        let bytes =
            serde_json::to_vec(payload).map_err(|e| FlowError::Serialization(e.to_string()))?;
        if self.replaying() {
            return match self.next_replay() {
                SuspensionOutcome::SessionOpened { .. } | SuspensionOutcome::Sent { .. } => Ok(()),
                other => Err(self.journal_mismatch("send", &other)),
            };
        }
        self.emit_send(party, bytes).await
    }

    /// Wait for a payload of type `T` from a party.
    ///
    /// Fails with `UnexpectedFlowEnd` naming `T` if the session ends,
    /// errors, or is rejected before a payload arrives.
    pub async fn receive<T: DeserializeOwned>(&mut self, party: &Party) -> Result<T, FlowError> {
        self.receive_internal(party, None).await
    }

    /// Like [`FlowContext::receive`] but gives up after `timeout`,
    /// converting the timeout into an `UnexpectedFlowEnd`.
    pub async fn receive_within<T: DeserializeOwned>(
        &mut self,
        party: &Party,
        timeout: std::time::Duration,
    ) -> Result<T, FlowError> {
        self.receive_internal(party, Some(Instant::now() + timeout)).await
    }

    async fn receive_internal<T: DeserializeOwned>(
        &mut self,
        party: &Party,
        deadline: Option<Instant>,
    ) -> Result<T, FlowError> {
        self.check_abort()?;
        let expected = std::any::type_name::<T>();
        if self.replaying() {
            // A receive-first flow opened the session as part of this
            // suspension; consume that entry before the delivery.
            if matches!(self.peek_replay(), Some(SuspensionOutcome::SessionOpened { .. })) {
                self.next_replay();
            }
        } else if self.open_bound_session(party).is_none() {
            self.open_session(party, None).await?;
        }
        let payload = self.receive_value(party, expected, deadline).await?;
        serde_json::from_slice(&payload).map_err(|e| {
            FlowError::UnexpectedFlowEnd(format!(
                "Failed to deserialize message from {} into {}: {}",
                party, expected, e
            ))
        })
    }

    /// Send a payload and wait for the typed reply, as a single suspension
    /// point.
    pub async fn send_and_receive<T: DeserializeOwned, S: Serialize>(
        &mut self,
        party: &Party,
        payload: &S,
    ) -> Result<T, FlowError> {
        self.check_abort()?;
        let expected = std::any::type_name::<T>();
        let bytes =
            serde_json::to_vec(payload).map_err(|e| FlowError::Serialization(e.to_string()))?;
        if self.replaying() {
            match self.next_replay() {
                SuspensionOutcome::SessionOpened { .. } | SuspensionOutcome::Sent { .. } => {}
                other => return Err(self.journal_mismatch("send_and_receive", &other)),
            }
        } else {
            self.emit_send(party, bytes).await?;
        }
        let payload = self.receive_value(party, expected, None).await?;
        serde_json::from_slice(&payload).map_err(|e| {
            FlowError::UnexpectedFlowEnd(format!(
                "Failed to deserialize message from {} into {}: {}",
                party, expected, e
            ))
        })
    }

    /// Suspend until the given ledger transaction is durably recorded.
    pub async fn wait_for_ledger_commit(&mut self, tx_hash: &str) -> Result<(), FlowError> {
        self.check_abort()?;
        if self.replaying() {
            return match self.next_replay() {
                SuspensionOutcome::LedgerCommitted { .. } => Ok(()),
                other => Err(self.journal_mismatch("wait_for_ledger_commit", &other)),
            };
        }
        self.manager.ledger().wait_for_commit(tx_hash).await;
        self.check_abort()?;
        self.journal.push(SuspensionOutcome::LedgerCommitted {
            tx_hash: tx_hash.to_string(),
        });
        self.cursor = self.journal.len();
        self.commit_suspension(vec![]).await?;
        self.manager.record_transaction_mapping(self.run_id, tx_hash);
        Ok(())
    }

    /// Suspend for a duration. Best effort: a restart during the sleep
    /// replays up to it and sleeps the full duration again.
    pub async fn sleep_for(&mut self, duration: std::time::Duration) -> Result<(), FlowError> {
        self.check_abort()?;
        if self.replaying() {
            return match self.next_replay() {
                SuspensionOutcome::Slept { .. } => Ok(()),
                other => Err(self.journal_mismatch("sleep_for", &other)),
            };
        }
        tokio::time::sleep(duration).await;
        self.check_abort()?;
        self.journal.push(SuspensionOutcome::Slept {
            millis: duration.as_millis() as u64,
        });
        self.cursor = self.journal.len();
        self.commit_suspension(vec![]).await
    }

    /// Run a sub-flow. The boundary is a suspension point; party bindings
    /// created inside are dropped on exit, so a later sub-flow against the
    /// same party opens a fresh session (and, for a replicated identity,
    /// the next endpoint in rotation).
    pub async fn sub_flow<T, F>(&mut self, name: &str, body: F) -> Result<T, FlowError>
    where
        F: for<'a> FnOnce(
            &'a mut FlowContext,
        ) -> Pin<Box<dyn Future<Output = Result<T, FlowError>> + Send + 'a>>,
    {
        self.check_abort()?;
        if self.replaying() {
            match self.next_replay() {
                SuspensionOutcome::SubFlowEntered { .. } => {}
                other => return Err(self.journal_mismatch("sub_flow", &other)),
            }
        } else {
            self.journal.push(SuspensionOutcome::SubFlowEntered {
                name: name.to_string(),
            });
            self.cursor = self.journal.len();
            self.commit_suspension(vec![]).await?;
        }
        self.sessions.lock().unwrap().push_scope();
        let result = body(self).await;
        self.sessions.lock().unwrap().pop_scope();
        result
    }

    // ---- internals ----

    fn check_abort(&self) -> Result<(), FlowError> {
        if self.abort.load(Ordering::SeqCst) {
            Err(FlowError::Killed)
        } else {
            Ok(())
        }
    }

    fn replaying(&self) -> bool {
        self.cursor < self.journal.len()
    }

    fn peek_replay(&self) -> Option<&SuspensionOutcome> {
        self.journal.get(self.cursor)
    }

    fn next_replay(&mut self) -> SuspensionOutcome {
        let entry = self.journal[self.cursor].clone();
        self.cursor += 1;
        entry
    }

    fn journal_mismatch(&self, operation: &str, entry: &SuspensionOutcome) -> FlowError {
        FlowError::Fatal(format!(
            "Checkpoint journal mismatch at {}: found {:?}; flow logic must be deterministic",
            operation, entry
        ))
    }

    /// The session bound to this party, if it is still usable.
    fn open_bound_session(&self, party: &Party) -> Option<u64> {
        let sessions = self.sessions.lock().unwrap();
        sessions.bound_session(party)
    }

    fn wire_message(
        &self,
        endpoint: EndpointId,
        message: &SessionMessage,
    ) -> Result<WireMessage, FlowError> {
        let bytes = encode_message(message).map_err(|e| FlowError::Serialization(e.to_string()))?;
        Ok(WireMessage {
            from_endpoint: self.manager.endpoint().clone(),
            from_party: self.manager.party().clone(),
            to_endpoint: endpoint,
            bytes,
        })
    }

    /// Open a fresh session towards a party: pick the next endpoint for
    /// the identity, emit the init (with any piggybacked first payload),
    /// and checkpoint. Live mode only.
    async fn open_session(
        &mut self,
        party: &Party,
        first_payload: Option<Vec<u8>>,
    ) -> Result<u64, FlowError> {
        let endpoint = self
            .manager
            .directory()
            .next_endpoint(party)
            .map_err(|e| FlowError::Fatal(e.to_string()))?;
        let session_id = new_session_id();
        let record = SessionRecord::initiating(
            session_id,
            party.clone(),
            endpoint.clone(),
            first_payload.is_some(),
        );
        self.sessions.lock().unwrap().insert(record);
        self.manager.register_session_route(self.run_id, session_id);

        let init = SessionMessage::Init(SessionInit {
            initiator_session_id: session_id,
            flow_name: self.flow_name.clone(),
            flow_version: self.flow_version,
            app_id: self.manager.app_id().to_string(),
            first_payload,
        });
        let wire = self.wire_message(endpoint, &init)?;

        slog::debug!(self.logger, "Opening session"; "session_id" => session_id, "party" => %party);
        self.journal.push(SuspensionOutcome::SessionOpened { session_id });
        self.cursor = self.journal.len();
        self.commit_suspension(vec![wire]).await?;
        Ok(session_id)
    }

    /// Live half of a send: open a session with the payload piggybacked,
    /// or emit a data message on the bound session.
    async fn emit_send(&mut self, party: &Party, bytes: Vec<u8>) -> Result<(), FlowError> {
        match self.open_bound_session(party) {
            None => {
                self.open_session(party, Some(bytes)).await?;
                Ok(())
            }
            Some(session_id) => {
                self.ensure_confirmed(session_id, party).await?;
                let (endpoint, peer_id, seq) = {
                    let mut sessions = self.sessions.lock().unwrap();
                    let record = sessions
                        .get_mut(session_id)
                        .ok_or_else(|| FlowError::Fatal("Unknown session".to_string()))?;
                    let endpoint = record
                        .endpoint
                        .clone()
                        .ok_or_else(|| FlowError::Fatal("Session has no endpoint".to_string()))?;
                    let peer_id = record
                        .peer_id
                        .ok_or_else(|| FlowError::Fatal("Session has no peer id".to_string()))?;
                    (endpoint, peer_id, record.take_send_seq())
                };
                let data = SessionMessage::Data(SessionData {
                    recipient_session_id: peer_id,
                    seq,
                    payload: bytes,
                });
                let wire = self.wire_message(endpoint, &data)?;
                self.journal.push(SuspensionOutcome::Sent { session_id });
                self.cursor = self.journal.len();
                self.commit_suspension(vec![wire]).await
            }
        }
    }

    /// Wait until the session leaves `Initiating`, applying inbound
    /// traffic as it arrives.
    async fn ensure_confirmed(&mut self, session_id: u64, party: &Party) -> Result<(), FlowError> {
        loop {
            let (state, remote_error, reject_reason) = {
                let sessions = self.sessions.lock().unwrap();
                let record = sessions
                    .get(session_id)
                    .ok_or_else(|| FlowError::Fatal("Unknown session".to_string()))?;
                (record.state, record.remote_error.clone(), record.reject_reason.clone())
            };
            match state {
                SessionState::Confirmed => return Ok(()),
                SessionState::Ended => {
                    return Err(FlowError::UnexpectedFlowEnd(format!(
                        "Session with {} has already ended",
                        party
                    )))
                }
                SessionState::Errored => {
                    return Err(self.session_error(party, remote_error, reject_reason, "confirmation"))
                }
                SessionState::Initiating => {
                    let message = self.next_inbound(None, party, "confirmation").await?;
                    self.apply_inbound(message)?;
                }
            }
        }
    }

    fn session_error(
        &self,
        party: &Party,
        remote_error: Option<crate::flow::error::BusinessError>,
        reject_reason: Option<String>,
        expected: &str,
    ) -> FlowError {
        if let Some(error) = remote_error {
            return FlowError::Counterparty(error);
        }
        if let Some(reason) = reject_reason {
            return FlowError::UnexpectedFlowEnd(format!(
                "Counterparty {} rejected the session: {}",
                party, reason
            ));
        }
        FlowError::UnexpectedFlowEnd(format!(
            "Counterparty flow on {} ended unexpectedly while this flow expected {}",
            party, expected
        ))
    }

    /// Core delivery loop for one session: surface terminal session states,
    /// hand back the next undelivered payload, apply everything else.
    async fn receive_value(
        &mut self,
        party: &Party,
        expected: &'static str,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>, FlowError> {
        if self.replaying() {
            return match self.next_replay() {
                SuspensionOutcome::Received { payload, .. } => Ok(payload),
                other => Err(self.journal_mismatch("receive", &other)),
            };
        }
        let session_id = self
            .open_bound_session(party)
            .ok_or_else(|| FlowError::Fatal(format!("No session bound to {}", party)))?;
        loop {
            // Deliver queued data before looking at session state: the
            // counterparty may have sent its last payload and ended in one
            // breath, and the payload wins.
            if let Some(data) = self.take_pending_data(session_id) {
                let accepted = {
                    let mut sessions = self.sessions.lock().unwrap();
                    match sessions.get_mut(session_id) {
                        Some(record) => record.register_delivery(data.seq),
                        None => false,
                    }
                };
                if !accepted {
                    slog::debug!(self.logger, "Discarding redelivered message";
                                 "session_id" => session_id, "seq" => data.seq);
                    continue;
                }
                // Ingestion is transactional: the journal entry and the
                // updated delivery sequence commit before the flow sees
                // the payload.
                self.journal.push(SuspensionOutcome::Received {
                    session_id,
                    payload: data.payload.clone(),
                });
                self.cursor = self.journal.len();
                self.commit_suspension(vec![]).await?;
                return Ok(data.payload);
            }

            {
                let sessions = self.sessions.lock().unwrap();
                let record = sessions
                    .get(session_id)
                    .ok_or_else(|| FlowError::Fatal("Unknown session".to_string()))?;
                match record.state {
                    SessionState::Ended => {
                        return Err(FlowError::UnexpectedFlowEnd(format!(
                            "Counterparty flow on {} ended while this flow expected a {}",
                            party, expected
                        )))
                    }
                    SessionState::Errored => {
                        let remote_error = record.remote_error.clone();
                        let reject_reason = record.reject_reason.clone();
                        drop(sessions);
                        return Err(self.session_error(party, remote_error, reject_reason, expected));
                    }
                    _ => {}
                }
            }

            let message = self.next_inbound(deadline, party, expected).await?;
            self.apply_inbound(message)?;
        }
    }

    /// Next undelivered payload stashed for this session.
    fn take_pending_data(&mut self, session_id: u64) -> Option<SessionData> {
        self.stash.get_mut(&session_id).and_then(|queue| queue.pop_front())
    }

    async fn next_inbound(
        &mut self,
        deadline: Option<Instant>,
        party: &Party,
        expected: &str,
    ) -> Result<InboundMessage, FlowError> {
        let received = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.inbound.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(FlowError::UnexpectedFlowEnd(format!(
                        "Timed out waiting for {} from {}",
                        expected, party
                    )))
                }
            },
            None => self.inbound.recv().await,
        };
        received.ok_or(FlowError::ShuttingDown)
    }

    /// Fold one inbound message into session state. Data is stashed per
    /// session; handshake and terminal messages update their records.
    fn apply_inbound(&mut self, message: InboundMessage) -> Result<(), FlowError> {
        let (from_endpoint, session_message) = match message {
            InboundMessage::Abort => return Err(FlowError::Killed),
            InboundMessage::Session {
                from_endpoint,
                message,
                ..
            } => (from_endpoint, message),
        };
        match session_message {
            SessionMessage::Confirm(confirm) => {
                let mut sessions = self.sessions.lock().unwrap();
                if let Some(record) = sessions.get_mut(confirm.initiator_session_id) {
                    if record.state == SessionState::Initiating {
                        record.confirm(
                            confirm.confirmer_session_id,
                            confirm.flow_version,
                            from_endpoint,
                        );
                    }
                }
            }
            SessionMessage::Data(data) => {
                self.stash
                    .entry(data.recipient_session_id)
                    .or_default()
                    .push_back(data);
            }
            SessionMessage::NormalEnd(end) => {
                let mut sessions = self.sessions.lock().unwrap();
                if let Some(record) = sessions.get_mut(end.recipient_session_id) {
                    record.mark_ended();
                }
            }
            SessionMessage::ErrorEnd(end) => {
                let mut sessions = self.sessions.lock().unwrap();
                if let Some(record) = sessions.get_mut(end.recipient_session_id) {
                    record.remote_error = end.error;
                    record.mark_errored();
                }
            }
            SessionMessage::Reject(reject) => {
                let mut sessions = self.sessions.lock().unwrap();
                if let Some(record) = sessions.get_mut(reject.initiator_session_id) {
                    record.reject_reason = Some(reject.error_message);
                    record.mark_errored();
                }
            }
            // Inits create flows at the manager; one never reaches a
            // running flow.
            SessionMessage::Init(_) => {}
        }
        Ok(())
    }

    /// Write the checkpoint for the suspension just journaled, together
    /// with its outbound messages, in one host transaction.
    async fn commit_suspension(&mut self, outbound: Vec<WireMessage>) -> Result<(), FlowError> {
        let checkpoint = Checkpoint {
            run_id: self.run_id,
            flow_name: self.flow_name.clone(),
            flow_version: self.flow_version,
            initiated_by: self.initiated_by.clone(),
            input: self.input.clone(),
            journal: self.journal.clone(),
            sessions: self.sessions.lock().unwrap().clone(),
            init_payload: self.init_payload.clone(),
            pending_outbound: outbound.clone(),
        };
        let blob = checkpoint.encode()?;

        let mut txn = DbTransaction::new();
        txn.put_checkpoint(self.run_id, blob);
        for message in outbound {
            txn.send_message(message);
        }
        self.manager
            .commit(txn)
            .await
            .map_err(|e| FlowError::Fatal(e.to_string()))
    }
}
