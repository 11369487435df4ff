use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Pushed to live subscribers whenever a reading lands. Best-effort only;
/// delivery is neither acknowledged nor ordered relative to persistence.
#[derive(Debug, Clone, Serialize)]
pub struct ReadingEvent {
    pub sensor_id: i64,
    pub sensor_type: String,
    pub name: String,
    pub unit: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct LiveFeed {
    tx: broadcast::Sender<ReadingEvent>,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReadingEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget. Having no subscribers is normal, not an error.
    pub fn publish(&self, event: ReadingEvent) {
        let _ = self.tx.send(event);
    }
}
