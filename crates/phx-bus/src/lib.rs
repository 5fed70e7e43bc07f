//! In-process topic-based event fan-out.
//!
//! Subscribers register under a session id with a set of topics they care
//! about; publishing copies a message to every subscriber whose topic set
//! contains the message's topic. Each subscriber has a bounded `flume`
//! channel (default 256, `BusConfig::subscriber_buffer`) — a full channel
//! drops the message for that subscriber and bumps its overflow counter
//! rather than blocking the publisher; the bus never holds a lock across
//! an I/O operation. The subscriber set itself is an `RwLock<HashMap<..>>`:
//! a read lock covers `publish`, a write lock covers subscribe/unsubscribe.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub topic: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(message_type: impl Into<String>, topic: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            topic: topic.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

struct Subscriber {
    topics: HashSet<String>,
    sender: flume::Sender<BusMessage>,
    overflow: Arc<AtomicU64>,
}

/// A session's handle to its inbox and its own overflow counter.
pub struct Subscription {
    pub session_id: String,
    pub receiver: flume::Receiver<BusMessage>,
    overflow: Arc<AtomicU64>,
}

impl Subscription {
    /// Count of messages dropped for this subscriber because its buffer was full.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<String, Subscriber>>>,
    buffer_size: usize,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            buffer_size,
        }
    }

    /// Registers a session with an initial topic set, replacing any prior
    /// subscription for the same session id.
    pub fn subscribe(&self, session_id: impl Into<String>, topics: impl IntoIterator<Item = String>) -> Subscription {
        let session_id = session_id.into();
        let (tx, rx) = flume::bounded(self.buffer_size);
        let overflow = Arc::new(AtomicU64::new(0));
        let sub = Subscriber {
            topics: topics.into_iter().collect(),
            sender: tx,
            overflow: overflow.clone(),
        };
        self.subscribers
            .write()
            .expect("bus subscriber lock poisoned")
            .insert(session_id.clone(), sub);
        Subscription {
            session_id,
            receiver: rx,
            overflow,
        }
    }

    /// Idempotent: unsubscribing a session that is already gone (or racing
    /// with its own session-terminate path) is a no-op.
    pub fn unsubscribe(&self, session_id: &str) {
        self.subscribers
            .write()
            .expect("bus subscriber lock poisoned")
            .remove(session_id);
    }

    pub fn add_topic(&self, session_id: &str, topic: impl Into<String>) {
        if let Some(sub) = self
            .subscribers
            .write()
            .expect("bus subscriber lock poisoned")
            .get_mut(session_id)
        {
            sub.topics.insert(topic.into());
        }
    }

    pub fn remove_topic(&self, session_id: &str, topic: &str) {
        if let Some(sub) = self
            .subscribers
            .write()
            .expect("bus subscriber lock poisoned")
            .get_mut(session_id)
        {
            sub.topics.remove(topic);
        }
    }

    /// Copies `message` to every subscriber whose topic set contains
    /// `message.topic`. Never blocks: a full channel increments that
    /// subscriber's overflow counter and moves on.
    pub fn publish(&self, message: BusMessage) {
        let subscribers = self.subscribers.read().expect("bus subscriber lock poisoned");
        for sub in subscribers.values() {
            if !sub.topics.contains(&message.topic) {
                continue;
            }
            if sub.sender.try_send(message.clone()).is_err() {
                sub.overflow.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic = %message.topic, "event bus subscriber buffer full, dropping message");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("bus subscriber lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_only_to_matching_topic() {
        let bus = EventBus::new(8);
        let sub_a = bus.subscribe("a", ["experiments".to_string()]);
        let sub_b = bus.subscribe("b", ["tasks".to_string()]);

        bus.publish(BusMessage::new("experiment_started", "experiments", serde_json::json!({})));

        assert!(sub_a.receiver.try_recv().is_ok());
        assert!(sub_b.receiver.try_recv().is_err());
    }

    #[test]
    fn full_buffer_drops_and_increments_overflow() {
        let bus = EventBus::new(1);
        let sub = bus.subscribe("a", ["fleet".to_string()]);

        bus.publish(BusMessage::new("agent_heartbeat", "fleet", serde_json::json!({})));
        bus.publish(BusMessage::new("agent_heartbeat", "fleet", serde_json::json!({})));

        assert_eq!(sub.overflow_count(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new(8);
        bus.subscribe("a", ["experiments".to_string()]);
        bus.unsubscribe("a");
        bus.unsubscribe("a");
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn publish_order_preserved_per_subscriber() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe("a", ["experiments".to_string()]);
        bus.publish(BusMessage::new("experiment_started", "experiments", serde_json::json!(1)));
        bus.publish(BusMessage::new("experiment_phase_updated", "experiments", serde_json::json!(2)));

        let first = sub.receiver.try_recv().unwrap();
        let second = sub.receiver.try_recv().unwrap();
        assert_eq!(first.data, serde_json::json!(1));
        assert_eq!(second.data, serde_json::json!(2));
    }

    #[test]
    fn topic_can_be_added_and_removed_after_subscribe() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe("a", []);
        bus.publish(BusMessage::new("x", "fleet", serde_json::json!({})));
        assert!(sub.receiver.try_recv().is_err());

        bus.add_topic("a", "fleet");
        bus.publish(BusMessage::new("x", "fleet", serde_json::json!({})));
        assert!(sub.receiver.try_recv().is_ok());

        bus.remove_topic("a", "fleet");
        bus.publish(BusMessage::new("x", "fleet", serde_json::json!({})));
        assert!(sub.receiver.try_recv().is_err());
    }
}
