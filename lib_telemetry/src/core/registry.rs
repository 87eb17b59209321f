//! # Topic Registry
//!
//! Maps a full topic string to the callbacks registered for it, in registration
//! order. It is shared between the transport's network thread (which reads the
//! topic list on every reconnect) and the tokio runtime (which subscribes,
//! unsubscribes and dispatches), so every operation takes the lock once and
//! returns owned data. Callbacks are never invoked while the lock is held.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

/// A topic consumer. Receives the logical key (topic without its prefix) and
/// the delivered value. An `Err` is logged by the dispatcher and does not stop
/// delivery to the next callback.
pub type TopicCallback = Arc<dyn Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Thread-safe topic → ordered callback list.
#[derive(Default)]
pub struct TopicRegistry {
    topics: Mutex<BTreeMap<String, Vec<TopicCallback>>>,
}

impl TopicRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<TopicCallback>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `callback` to the topic's list, creating the entry if needed.
    /// The same callback registered twice is invoked twice.
    ///
    /// Returns `true` when this call created the topic entry.
    pub fn subscribe(&self, topic: &str, callback: TopicCallback) -> bool {
        let mut topics = self.lock();
        let created = !topics.contains_key(topic);
        topics.entry(topic.to_string()).or_default().push(callback);
        created
    }

    /// Removes the topic and all of its callbacks. Returns whether an entry existed.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.lock().remove(topic).is_some()
    }

    /// Snapshot of the callbacks for `topic`, empty when none are registered.
    pub fn callbacks_for(&self, topic: &str) -> Vec<TopicCallback> {
        self.lock().get(topic).cloned().unwrap_or_default()
    }

    /// Snapshot of every topic currently present, used for resubscription.
    pub fn topics(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Whether `topic` has an entry.
    pub fn contains(&self, topic: &str) -> bool {
        self.lock().contains_key(topic)
    }

    /// Number of topics with an entry.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no topic is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
