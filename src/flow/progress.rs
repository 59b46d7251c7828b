//! Progress reporting for tracked flows.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// One reported step of a flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStep {
    pub index: usize,
    pub label: String,
}

struct TrackerState {
    steps: Vec<String>,
    current: Option<usize>,
}

/// Records the steps a flow reports and broadcasts each change.
///
/// Steps are appended as the flow first reports them; re-reporting a known
/// label moves the cursor back to it. Subscribers that fall behind lag
/// rather than block the flow.
#[derive(Clone)]
pub struct ProgressTracker {
    state: Arc<Mutex<TrackerState>>,
    tx: broadcast::Sender<ProgressStep>,
}

impl ProgressTracker {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                steps: Vec::new(),
                current: None,
            })),
            tx,
        }
    }

    /// Move to the step with this label, registering it if new.
    pub fn set_step(&self, label: &str) {
        let step = {
            let mut state = self.state.lock().unwrap();
            let index = match state.steps.iter().position(|s| s == label) {
                Some(index) => index,
                None => {
                    state.steps.push(label.to_string());
                    state.steps.len() - 1
                }
            };
            state.current = Some(index);
            ProgressStep {
                index,
                label: label.to_string(),
            }
        };
        let _ = self.tx.send(step);
    }

    /// Steps reported so far plus the current position.
    pub fn snapshot(&self) -> (Vec<String>, Option<usize>) {
        let state = self.state.lock().unwrap();
        (state.steps.clone(), state.current)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressStep> {
        self.tx.subscribe()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(64)
    }
}
