//! Interface to the node's transaction-recording machinery.
//!
//! The ledger itself is an external collaborator; flows only need to wait
//! until a transaction they depend on is durably recorded.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Tracks which ledger transactions have committed and parks waiters until
/// theirs does.
#[derive(Default)]
pub struct LedgerTracker {
    committed: Mutex<HashSet<String>>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

impl LedgerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a transaction as durably recorded and wake its waiters.
    pub fn record_commit(&self, tx_hash: &str) {
        {
            let mut committed = self.committed.lock().unwrap();
            if !committed.insert(tx_hash.to_string()) {
                return;
            }
        }
        let waiters = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.remove(tx_hash).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Resolve once the transaction is recorded; immediately if it already
    /// was.
    pub async fn wait_for_commit(&self, tx_hash: &str) {
        let rx = {
            let committed = self.committed.lock().unwrap();
            if committed.contains(tx_hash) {
                return;
            }
            let (tx, rx) = oneshot::channel();
            let mut waiters = self.waiters.lock().unwrap();
            waiters.entry(tx_hash.to_string()).or_default().push(tx);
            rx
        };
        // A dropped sender only happens at teardown; treat it as a wakeup.
        let _ = rx.await;
    }
}
