//! Event bus for pub/sub messaging
//!
//! Broadcasts lifecycle events to subscribers (the `/events` stream, tests,
//! internal watchers). A bounded journal keeps recent history for clients
//! that connect with `since`.

use std::collections::HashMap;
use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Entity class an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Container,
    Image,
    Volume,
    Sandbox,
    Vm,
    Daemon,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Container => write!(f, "container"),
            EventType::Image => write!(f, "image"),
            EventType::Volume => write!(f, "volume"),
            EventType::Sandbox => write!(f, "sandbox"),
            EventType::Vm => write!(f, "vm"),
            EventType::Daemon => write!(f, "daemon"),
        }
    }
}

/// The entity an event happened to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

/// A single event record, shaped for the `/events` stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "Type")]
    pub event_type: EventType,

    #[serde(rename = "Action")]
    pub action: String,

    #[serde(rename = "Actor")]
    pub actor: Actor,

    /// Seconds since the epoch
    pub time: i64,

    /// Nanoseconds since the epoch
    #[serde(rename = "timeNano")]
    pub time_nano: i64,
}

impl EventRecord {
    pub fn new(event_type: EventType, action: impl Into<String>, id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            event_type,
            action: action.into(),
            actor: Actor {
                id: id.into(),
                attributes: HashMap::new(),
            },
            time: now.timestamp(),
            time_nano: now.timestamp_nanos_opt().unwrap_or(0),
        }
    }

    /// Attach an actor attribute, e.g. the container name or image tag
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.actor.attributes.insert(key.into(), value.into());
        self
    }
}

/// Capacity of the in-memory journal backing `since` queries
const JOURNAL_CAPACITY: usize = 1024;

/// Event bus for broadcasting events to multiple subscribers
///
/// Uses a tokio broadcast channel; subscribers that fall behind lose events
/// (lagged). The journal keeps the last `JOURNAL_CAPACITY` records.
pub struct EventBus {
    sender: broadcast::Sender<EventRecord>,
    // Keep a receiver to prevent the channel from closing
    _receiver: broadcast::Receiver<EventRecord>,
    journal: Mutex<VecDeque<EventRecord>>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    /// Create a new event bus with custom channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self {
            sender,
            _receiver,
            journal: Mutex::new(VecDeque::with_capacity(JOURNAL_CAPACITY)),
        }
    }

    /// Subscribe to events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers and the journal
    pub fn publish(&self, record: EventRecord) {
        {
            let mut journal = self.journal.lock();
            if journal.len() == JOURNAL_CAPACITY {
                journal.pop_front();
            }
            journal.push_back(record.clone());
        }
        // Ignore send errors (no receivers)
        let _ = self.sender.send(record);
    }

    /// Convenience constructor + publish
    pub fn emit(&self, event_type: EventType, action: &str, id: &str) {
        self.publish(EventRecord::new(event_type, action, id));
    }

    /// Journal records with `time >= since` (seconds since epoch)
    pub fn since(&self, since: i64) -> Vec<EventRecord> {
        self.journal
            .lock()
            .iter()
            .filter(|r| r.time >= since)
            .cloned()
            .collect()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
            journal: Mutex::new(self.journal.lock().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_pubsub() {
        let bus = EventBus::new();

        let mut rx = bus.subscribe();

        bus.emit(EventType::Container, "start", "abc123");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Container);
        assert_eq!(event.action, "start");
        assert_eq!(event.actor.id, "abc123");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();

        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(EventType::Image, "import", "sha256:feed");

        assert_eq!(rx1.recv().await.unwrap().action, "import");
        assert_eq!(rx2.recv().await.unwrap().action, "import");
    }

    #[test]
    fn test_journal_since() {
        let bus = EventBus::new();

        bus.emit(EventType::Container, "create", "a");
        bus.emit(EventType::Container, "start", "a");

        let all = bus.since(0);
        assert_eq!(all.len(), 2);

        let future = bus.since(i64::MAX);
        assert!(future.is_empty());
    }

    #[test]
    fn test_record_serialization_shape() {
        let record = EventRecord::new(EventType::Container, "die", "abc")
            .with_attribute("exitCode", "137");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["Type"], "container");
        assert_eq!(json["Action"], "die");
        assert_eq!(json["Actor"]["ID"], "abc");
        assert_eq!(json["Actor"]["Attributes"]["exitCode"], "137");
        assert!(json["timeNano"].as_i64().unwrap() > 0);
    }
}
