//! The per-flow session table.
//!
//! Maps session ids to records and logical parties to the session a flow
//! primitive should use. The table is serialized whole into the flow's
//! checkpoint, so a resumed flow finds its sessions exactly as it left
//! them.

use crate::net::Party;
use crate::session::state::SessionRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionTable {
    sessions: HashMap<u64, SessionRecord>,
    /// Current party → session binding. Primitives addressed by party use
    /// the bound session; an unbound party gets a fresh session.
    bindings: HashMap<Party, u64>,
    /// Binding snapshots taken at sub-flow entry. Bindings created inside a
    /// sub-flow are dropped when it exits, so a later sub-flow against the
    /// same party opens a fresh session.
    #[serde(skip)]
    scopes: Vec<HashMap<Party, u64>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: SessionRecord) {
        self.bindings.insert(record.party.clone(), record.own_id);
        self.sessions.insert(record.own_id, record);
    }

    pub fn get(&self, session_id: u64) -> Option<&SessionRecord> {
        self.sessions.get(&session_id)
    }

    pub fn get_mut(&mut self, session_id: u64) -> Option<&mut SessionRecord> {
        self.sessions.get_mut(&session_id)
    }

    /// The session currently bound to a party, if any.
    pub fn bound_session(&self, party: &Party) -> Option<u64> {
        self.bindings.get(party).copied()
    }

    pub fn session_ids(&self) -> Vec<u64> {
        self.sessions.keys().copied().collect()
    }

    /// Records of sessions this side may still write to. Used at terminal
    /// transition to fan out session ends.
    pub fn open_sessions(&self) -> Vec<SessionRecord> {
        self.sessions.values().filter(|r| r.is_open()).cloned().collect()
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(self.bindings.clone());
    }

    pub fn pop_scope(&mut self) {
        if let Some(saved) = self.scopes.pop() {
            self.bindings = saved;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
