//! Fire-and-forget execution-status-changed notifications.
//!
//! The tracker publishes one event after each successful step append.
//! Delivery is best-effort: no subscribers and lagging subscribers are both
//! fine, the publish path never blocks and never fails the append.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::domain::ExecutionStatus;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub execution_id: Uuid,
    pub batch_id: Uuid,
    pub tenant: String,
    pub status: ExecutionStatus,
    pub time: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StatusNotifier {
    tx: broadcast::Sender<StatusChanged>,
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChanged> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StatusChanged) {
        // Err just means nobody is listening right now.
        if self.tx.send(event).is_err() {
            debug!("status event dropped, no subscribers");
        }
    }
}
