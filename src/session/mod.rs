//! Session protocol: wire messages, per-session state machine, and the
//! per-flow session table.

pub mod message;
pub mod state;
pub mod table;

pub use message::{
    decode_message, encode_message, new_session_id, CodecError, ErrorSessionEnd, NormalSessionEnd,
    SessionConfirm, SessionData, SessionInit, SessionMessage, SessionReject,
};
pub use state::{SessionRecord, SessionState};
pub use table::SessionTable;
