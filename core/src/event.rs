use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    String(String),
    Map(HashMap<String, serde_json::Value>),
}

/// Pull progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullEvent {
    /// Event key (e.g., "pull.blob.fetched")
    pub key: EventKey,

    /// Event payload
    pub payload: EventPayload,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl PullEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with no payload
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, EventPayload::Empty)
    }

    /// Create an event with a string payload
    pub fn with_string(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(key, EventPayload::String(message.into()))
    }

    /// Create an event with a map payload
    pub fn with_map(key: impl Into<String>, map: HashMap<String, serde_json::Value>) -> Self {
        Self::new(key, EventPayload::Map(map))
    }

    /// Look up a field of a map payload.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        match &self.payload {
            EventPayload::Map(map) => map.get(name),
            _ => None,
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<PullEvent>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: PullEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PullEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events with a filter
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&PullEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            filter: Arc::new(filter),
        }
    }
}

/// Event stream with filtering
pub struct EventStream {
    receiver: broadcast::Receiver<PullEvent>,
    filter: Arc<dyn Fn(&PullEvent) -> bool + Send + Sync>,
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<PullEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.filter)(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Event catalog - predefined event keys
pub mod events {
    pub const PULL_STARTED: &str = "pull.started";
    pub const PULL_MANIFEST_RESOLVED: &str = "pull.manifest.resolved";
    pub const PULL_PRUNE_EVICTED: &str = "pull.prune.evicted";
    pub const PULL_BLOB_SKIPPED: &str = "pull.blob.skipped";
    pub const PULL_BLOB_FETCHED: &str = "pull.blob.fetched";
    pub const PULL_BLOB_RETRY: &str = "pull.blob.retry";
    pub const PULL_PUBLISHED: &str = "pull.published";
    pub const PULL_FAILED: &str = "pull.failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_subscribe() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(PullEvent::with_string(events::PULL_STARTED, "ghcr.io/org/vm:1.0"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, events::PULL_STARTED);
        assert!(matches!(event.payload, EventPayload::String(ref s) if s == "ghcr.io/org/vm:1.0"));
    }

    #[tokio::test]
    async fn test_filtered_stream_skips_other_keys() {
        let emitter = EventEmitter::new(16);
        let mut stream = emitter.subscribe_filtered(|e| e.key == events::PULL_PUBLISHED);

        emitter.emit(PullEvent::empty(events::PULL_STARTED));
        emitter.emit(PullEvent::empty(events::PULL_PUBLISHED));

        let event = stream.recv().await.unwrap();
        assert_eq!(event.key, events::PULL_PUBLISHED);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let emitter = EventEmitter::default();
        emitter.emit(PullEvent::empty(events::PULL_FAILED));
    }

    #[test]
    fn test_map_payload_field() {
        let mut map = HashMap::new();
        map.insert("size_bytes".to_string(), serde_json::json!(42));
        let event = PullEvent::with_map(events::PULL_BLOB_FETCHED, map);
        assert_eq!(event.field("size_bytes"), Some(&serde_json::json!(42)));
        assert_eq!(event.field("missing"), None);
    }
}
