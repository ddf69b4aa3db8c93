//! Process-local publish/subscribe fan-out.
//!
//! Topics are created lazily (`workers`, `spec:<id>`). Delivery is
//! best-effort over bounded broadcast channels: a slow subscriber lags and
//! loses the oldest events rather than stalling publishers. Ordering within
//! a topic is preserved. Snapshots-on-connect are composed by the
//! subscribing route from the Store; the bus only carries deltas.

use chrono::{DateTime, Utc};
use serde::Serialize;
use specwright_core::WorkerEvent;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Bounded per-topic buffer; older events drop for laggards past this.
const TOPIC_CAPACITY: usize = 256;

/// Topic for worker pool and queue events.
pub const WORKERS_TOPIC: &str = "workers";

/// One published event.
#[derive(Debug, Clone, Serialize)]
pub struct BusMessage {
    pub topic: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// JSON-encoded payload.
    pub data: String,
}

/// Topic-keyed broadcast bus.
#[derive(Debug, Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topic name for a spec's event stream.
    pub fn spec_topic(spec_id: &specwright_core::Id) -> String {
        format!("spec:{spec_id}")
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Subscribe to a topic; events published after this call are delivered
    /// in order, subject to the lag bound.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender(topic).subscribe()
    }

    /// Publish a pre-encoded payload. Publishing never blocks; with no
    /// subscribers the event is dropped.
    pub fn publish(&self, topic: &str, name: &str, data: String) {
        let message = BusMessage {
            topic: topic.to_string(),
            name: name.to_string(),
            timestamp: Utc::now(),
            data,
        };
        let receivers = self.sender(topic).send(message).unwrap_or(0);
        debug!(topic = %topic, event = %name, receivers, "bus publish");
    }

    /// Publish a worker event on the `workers` topic.
    pub fn publish_worker(&self, event: &WorkerEvent) {
        match event.to_json() {
            Ok(json) => self.publish(WORKERS_TOPIC, event.name(), json),
            Err(e) => debug!(error = %e, "failed to encode worker event"),
        }
    }
}
