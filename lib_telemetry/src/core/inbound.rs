//! # Inbound Queue Dispatcher
//!
//! The transport delivers messages on its own network thread, outside the tokio
//! runtime. That thread only ever calls `UnboundedSender::send`, which is
//! thread-safe and never blocks; everything else happens in a single task on
//! the runtime that drains the queue and invokes callbacks.
//!
//! ## Dispatch rules
//!
//! 1. The logical key is the topic with `"<prefix>/"` stripped.
//! 2. The payload is parsed as JSON. Text that does not parse is delivered as
//!    `{"raw": <text>}` rather than dropped. An object with a `metadata` key is
//!    unwrapped one level. Anything else is delivered as parsed.
//! 3. Callbacks for the topic run in registration order. An error or a panic in
//!    one callback is logged and the next callback still runs.
//!
//! The loop waits only on the queue. Stopping it goes through a
//! `CancellationToken`; `UnboundedReceiver::recv` is cancel-safe, so an item
//! that has not been handed out yet stays in the queue.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::registry::TopicRegistry;

/// One message handed from the network thread to the dispatch task.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    /// Full transport topic.
    pub topic: String,
    /// Payload text as received.
    pub raw_payload: String,
    /// Arrival time in epoch seconds.
    pub received_at: f64,
}

impl QueueItem {
    /// Builds an item stamped with the current time.
    pub fn now(topic: impl Into<String>, raw_payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            raw_payload: raw_payload.into(),
            received_at: epoch_seconds(),
        }
    }
}

/// Current wall-clock time in fractional epoch seconds.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Drains the inbound queue and delivers to registered callbacks.
#[derive(Clone)]
pub struct InboundDispatcher {
    registry: Arc<TopicRegistry>,
    topic_prefix: String,
}

impl InboundDispatcher {
    /// Creates a dispatcher reading callbacks from `registry`.
    pub fn new(registry: Arc<TopicRegistry>, topic_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            topic_prefix: topic_prefix.into(),
        }
    }

    /// Strips `"<prefix>/"` from `topic`. Topics outside the prefix are returned whole.
    pub fn logical_key<'a>(&self, topic: &'a str) -> &'a str {
        topic
            .strip_prefix(self.topic_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(topic)
    }

    /// Turns payload text into the value handed to callbacks.
    pub fn decode_payload(raw: &str) -> Value {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(mut map)) => match map.remove("metadata") {
                Some(metadata) => metadata,
                None => Value::Object(map),
            },
            Ok(value) => value,
            Err(e) => {
                log::debug!("Payload is not JSON ({}), delivering it raw", e);
                json!({ "raw": raw })
            }
        }
    }

    /// # Dispatch
    ///
    /// Delivers one item to every callback registered for its topic. Returns
    /// how many callbacks completed without error.
    pub fn dispatch(&self, item: &QueueItem) -> usize {
        let callbacks = self.registry.callbacks_for(&item.topic);
        if callbacks.is_empty() {
            log::trace!("No callbacks for topic {}", item.topic);
            return 0;
        }

        let key = self.logical_key(&item.topic);
        let value = Self::decode_payload(&item.raw_payload);
        log::trace!(
            "Dispatching {} to {} callback(s), queued for {:.3}s",
            item.topic,
            callbacks.len(),
            (epoch_seconds() - item.received_at).max(0.0)
        );

        let mut succeeded = 0;
        for (index, callback) in callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback(key, &value))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => {
                    log::error!("Callback #{} for {} failed: {:#}", index, item.topic, e);
                }
                Err(_) => {
                    log::error!("Callback #{} for {} panicked", index, item.topic);
                }
            }
        }
        succeeded
    }

    /// # Run
    ///
    /// The dispatch loop. Returns when `shutdown` is cancelled or every sender
    /// has been dropped.
    pub async fn run(self, mut queue: mpsc::UnboundedReceiver<QueueItem>, shutdown: CancellationToken) {
        log::info!("Inbound dispatcher started");
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.dispatch(&item);
        }
        log::info!("Inbound dispatcher stopped");
    }
}
