//! Wire-level session messages and their codec.

use crate::flow::error::BusinessError;
use serde::{Deserialize, Serialize};

/// Opens a session. Carries everything the recipient needs to pick a
/// responder: the initiating flow's name, the protocol version the
/// initiator speaks, and the application identity. A first payload may
/// ride along so a send-first initiator needs no extra round trip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInit {
    pub initiator_session_id: u64,
    pub flow_name: String,
    pub flow_version: u32,
    pub app_id: String,
    pub first_payload: Option<Vec<u8>>,
}

/// Accepts a session. `flow_version` is the version the confirmer actually
/// speaks, which may be lower than requested.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfirm {
    pub initiator_session_id: u64,
    pub confirmer_session_id: u64,
    pub flow_version: u32,
    pub app_id: String,
}

/// Application payload. `seq` increases by one per message per direction
/// and is stable across sender restarts, so receivers can discard
/// redelivered messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub recipient_session_id: u64,
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// The sender's flow finished; nothing further arrives on this session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalSessionEnd {
    pub recipient_session_id: u64,
}

/// The sender's flow ended in error. Carries a declared business error or
/// nothing at all; undeclared failures never leak detail onto the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorSessionEnd {
    pub recipient_session_id: u64,
    pub error: Option<BusinessError>,
}

/// The recipient refused to open the session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionReject {
    pub initiator_session_id: u64,
    pub error_message: String,
}

/// The tagged union of everything that travels on a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionMessage {
    Init(SessionInit),
    Confirm(SessionConfirm),
    Data(SessionData),
    NormalEnd(NormalSessionEnd),
    ErrorEnd(ErrorSessionEnd),
    Reject(SessionReject),
}

impl SessionMessage {
    /// Session id this message should be routed to at the recipient.
    /// `Init` has no destination session yet; it creates one.
    pub fn recipient_session_id(&self) -> Option<u64> {
        match self {
            SessionMessage::Init(_) => None,
            SessionMessage::Confirm(m) => Some(m.initiator_session_id),
            SessionMessage::Data(m) => Some(m.recipient_session_id),
            SessionMessage::NormalEnd(m) => Some(m.recipient_session_id),
            SessionMessage::ErrorEnd(m) => Some(m.recipient_session_id),
            SessionMessage::Reject(m) => Some(m.initiator_session_id),
        }
    }

    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            SessionMessage::Init(_) => "Init",
            SessionMessage::Confirm(_) => "Confirm",
            SessionMessage::Data(_) => "Data",
            SessionMessage::NormalEnd(_) => "NormalEnd",
            SessionMessage::ErrorEnd(_) => "ErrorEnd",
            SessionMessage::Reject(_) => "Reject",
        }
    }
}

/// Codec failures. A decode failure at a receiver is a protocol error for
/// the session it belongs to, never fatal to the node.
#[derive(Clone, Debug)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Encode(msg) => write!(f, "Failed to encode session message: {}", msg),
            CodecError::Decode(msg) => write!(f, "Failed to decode session message: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode a session message for the wire.
pub fn encode_message(message: &SessionMessage) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a session message from the wire.
pub fn decode_message(bytes: &[u8]) -> Result<SessionMessage, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Pick a fresh session id: 63 random bits, so ids survive being handled
/// as non-negative signed integers by peers.
pub fn new_session_id() -> u64 {
    rand::random::<u64>() & (u64::MAX >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: SessionMessage) {
        let bytes = encode_message(&message).expect("Should encode");
        let decoded = decode_message(&bytes).expect("Should decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_roundtrip_init() {
        roundtrip(SessionMessage::Init(SessionInit {
            initiator_session_id: 42,
            flow_name: "payments.TwoPartyTrade".to_string(),
            flow_version: 2,
            app_id: "ledgerflow".to_string(),
            first_payload: Some(b"10".to_vec()),
        }));
        roundtrip(SessionMessage::Init(SessionInit {
            initiator_session_id: 42,
            flow_name: "payments.TwoPartyTrade".to_string(),
            flow_version: 1,
            app_id: "ledgerflow".to_string(),
            first_payload: None,
        }));
    }

    #[test]
    fn test_roundtrip_confirm() {
        roundtrip(SessionMessage::Confirm(SessionConfirm {
            initiator_session_id: 42,
            confirmer_session_id: 77,
            flow_version: 1,
            app_id: "ledgerflow".to_string(),
        }));
    }

    #[test]
    fn test_roundtrip_data_and_ends() {
        roundtrip(SessionMessage::Data(SessionData {
            recipient_session_id: 77,
            seq: 3,
            payload: b"\"hello\"".to_vec(),
        }));
        roundtrip(SessionMessage::NormalEnd(NormalSessionEnd {
            recipient_session_id: 77,
        }));
        roundtrip(SessionMessage::ErrorEnd(ErrorSessionEnd {
            recipient_session_id: 77,
            error: Some(crate::flow::error::BusinessError::new(
                "MyFlowException",
                "Nothing useful",
            )),
        }));
        roundtrip(SessionMessage::ErrorEnd(ErrorSessionEnd {
            recipient_session_id: 77,
            error: None,
        }));
        roundtrip(SessionMessage::Reject(SessionReject {
            initiator_session_id: 42,
            error_message: "Don't know not.a.real.Class".to_string(),
        }));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decode_message(b"not a session message"),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_session_ids_fit_in_63_bits() {
        for _ in 0..1000 {
            assert_eq!(new_session_id() >> 63, 0);
        }
    }

    #[test]
    fn test_routing_ids() {
        let init = SessionMessage::Init(SessionInit {
            initiator_session_id: 1,
            flow_name: "f".to_string(),
            flow_version: 1,
            app_id: "a".to_string(),
            first_payload: None,
        });
        assert_eq!(init.recipient_session_id(), None);

        let data = SessionMessage::Data(SessionData {
            recipient_session_id: 9,
            seq: 0,
            payload: vec![],
        });
        assert_eq!(data.recipient_session_id(), Some(9));
    }
}
