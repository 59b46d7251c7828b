//! Per-session protocol state.
//!
//! Each session is a four-state machine:
//!
//! ```text
//! [start] --init--> Initiating --confirm--> Confirmed --(end | error-end)--> {Ended | Errored}
//! Initiating --reject--> Errored
//! ```

use crate::net::{EndpointId, Party};
use serde::{Deserialize, Serialize};

/// Protocol state of one endpoint of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Init sent, confirm not yet received.
    Initiating,
    /// Both session ids known; data may flow.
    Confirmed,
    /// Counterparty finished normally.
    Ended,
    /// Counterparty errored or rejected the session.
    Errored,
}

/// One endpoint's record of a session. Serialized into the owning flow's
/// checkpoint, so everything here must be stable across restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    /// This side's session id.
    pub own_id: u64,
    /// Peer's session id, known after confirmation (or immediately on the
    /// confirming side).
    pub peer_id: Option<u64>,
    /// Logical counterparty identity.
    pub party: Party,
    /// Concrete endpoint pinned for this session. Chosen by round-robin on
    /// init at the initiator; fixed to the sender's endpoint on the
    /// confirming side.
    pub endpoint: Option<EndpointId>,
    /// Protocol version the peer speaks, known after the handshake.
    pub peer_version: Option<u32>,
    pub state: SessionState,
    /// True on the side that sent the init.
    pub initiated_here: bool,
    /// Sequence number the next outbound data message will carry.
    pub next_send_seq: u64,
    /// Highest sequence number delivered to the flow so far.
    pub last_delivered_seq: Option<u64>,
    /// Business error received in an error end, surfaced at the next
    /// receive on this session.
    pub remote_error: Option<crate::flow::error::BusinessError>,
    /// Reason carried by a session reject.
    pub reject_reason: Option<String>,
}

impl SessionRecord {
    /// A fresh initiator-side record. `with_payload` is true when the init
    /// carries a payload, which occupies sequence number zero.
    pub fn initiating(own_id: u64, party: Party, endpoint: EndpointId, with_payload: bool) -> Self {
        Self {
            own_id,
            peer_id: None,
            party,
            endpoint: Some(endpoint),
            peer_version: None,
            state: SessionState::Initiating,
            initiated_here: true,
            next_send_seq: if with_payload { 1 } else { 0 },
            last_delivered_seq: None,
            remote_error: None,
            reject_reason: None,
        }
    }

    /// A confirmer-side record, fully established from the incoming init.
    /// An init payload counts as delivery of sequence number zero: it is
    /// handed to the responder at instantiation, not through its receive
    /// queue.
    pub fn confirmed(
        own_id: u64,
        peer_id: u64,
        party: Party,
        endpoint: EndpointId,
        peer_version: u32,
        with_payload: bool,
    ) -> Self {
        Self {
            own_id,
            peer_id: Some(peer_id),
            party,
            endpoint: Some(endpoint),
            peer_version: Some(peer_version),
            state: SessionState::Confirmed,
            initiated_here: false,
            next_send_seq: 0,
            last_delivered_seq: if with_payload { Some(0) } else { None },
            remote_error: None,
            reject_reason: None,
        }
    }

    /// Apply a confirmation: learn the peer's id and version and pin the
    /// endpoint that answered.
    pub fn confirm(&mut self, peer_id: u64, peer_version: u32, endpoint: EndpointId) {
        self.peer_id = Some(peer_id);
        self.peer_version = Some(peer_version);
        self.endpoint = Some(endpoint);
        self.state = SessionState::Confirmed;
    }

    pub fn mark_ended(&mut self) {
        self.state = SessionState::Ended;
    }

    pub fn mark_errored(&mut self) {
        self.state = SessionState::Errored;
    }

    /// Whether this side may still exchange messages on the session.
    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Initiating | SessionState::Confirmed)
    }

    /// Claim the next outbound sequence number.
    pub fn take_send_seq(&mut self) -> u64 {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        seq
    }

    /// Record a delivery. Returns false for a redelivered message, which
    /// the caller must discard.
    pub fn register_delivery(&mut self, seq: u64) -> bool {
        if let Some(last) = self.last_delivered_seq {
            if seq <= last {
                return false;
            }
        }
        self.last_delivered_seq = Some(seq);
        true
    }
}
