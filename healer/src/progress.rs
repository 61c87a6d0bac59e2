//! Best-effort progress notifications.
//!
//! The orchestrator publishes one event per state transition on a bounded
//! broadcast channel. Publishing never blocks: with no subscribers the event is
//! discarded, and a slow subscriber loses old events (`RecvError::Lagged`)
//! instead of holding the loop back.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::state::LoopState;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub state: LoopState,
    pub iteration: u32,
    pub message: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct ProgressChannel {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ProgressEvent) {
        if self.sender.send(event).is_err() {
            trace!("no progress subscribers");
        }
    }
}
