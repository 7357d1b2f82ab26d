//! State Broadcast Bus
//!
//! Session state is replicated, not shared. Each execution context (a
//! foreground UI, a background service started on boot) owns its own
//! [`SessionStateMachine`](crate::state::SessionStateMachine). Every local
//! transition is announced on the bus as a [`SessionEvent`], and the other
//! side replays it into its own copy.
//!
//! The two copies may disagree between send and receive. Consumers must
//! tolerate that window.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per receiver before it starts lagging
const BUS_CAPACITY: usize = 64;

/// State-change announcement
///
/// This is the wire contract for cross-process consumers; it serializes
/// as `{"state": "RUNNING"}` or `{"state": "ERROR", "errorMessage": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SessionEvent {
    /// Encode as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode from JSON
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Event tagged with the machine that produced it
///
/// Replicators skip messages from their own machine so an announcement
/// never loops back into its sender.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub origin: u64,
    pub event: SessionEvent,
}

/// Local publish/subscribe bus for session events
#[derive(Debug, Clone)]
pub struct StateBus {
    tx: broadcast::Sender<BusMessage>,
}

impl StateBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Announce an event to every current receiver
    pub fn announce(&self, origin: u64, event: SessionEvent) {
        if self.tx.send(BusMessage { origin, event }).is_err() {
            debug!("No bus receivers for session event");
        }
    }

    /// Open a new receiver that sees events announced from now on
    pub fn receiver(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

impl Default for StateBus {
    fn default() -> Self {
        Self::new()
    }
}
