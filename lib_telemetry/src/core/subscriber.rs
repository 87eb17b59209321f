//! # Topic Subscriber
//!
//! Handler for an upstream topic transport plus the public subscribe API used by
//! run-lifecycle code. It owns the topic registry, the rate limiter and the
//! sending half of the inbound queue.
//!
//! The transport calls [`FeedHandler`] methods from its own network thread.
//! Those methods touch only thread-safe state (the registry lock, the rate
//! limiter lock, an atomic flag and the queue sender) and never the tokio
//! runtime directly.
//!
//! ## Connection lifecycle
//!
//! `Disconnected → Connecting → Connected → Disconnected`. Every accepted
//! connect replays all registered topics to the transport, first connect and
//! reconnect alike. Leaving `Connected` clears the connected flag but keeps the
//! registry, so callers never need to register again after a drop or a restart.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::inbound::{InboundDispatcher, QueueItem};
use crate::core::rate_limiter::RateLimiter;
use crate::core::registry::{TopicCallback, TopicRegistry};

/// Errors raised by a topic transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A configured certificate file does not exist.
    #[error("certificate file not found: {}", .0.display())]
    MissingCertificate(PathBuf),

    /// A certificate file exists but could not be used.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// TLS client configuration failed.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// The upstream URL could not be parsed or has an unsupported scheme.
    #[error("invalid transport url: {0}")]
    InvalidUrl(String),

    /// The transport's network thread is no longer running.
    #[error("transport is not connected")]
    NotConnected,

    /// The network thread could not be spawned.
    #[error("failed to start network thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Outcome reported with every connect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    /// The upstream accepted the connection.
    Accepted,
    /// The upstream answered but refused, with its status code.
    Refused(u16),
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed on request through [`Transport::disconnect`].
    Requested,
    /// The upstream closed the connection.
    ClosedByPeer,
    /// A network or protocol error ended the connection.
    Error(String),
}

/// Operations a transport exposes to its handler and to the subscriber.
pub trait Transport: Send + Sync {
    /// Asks the upstream to start delivering `topic`.
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    /// Asks the upstream to stop delivering `topic`.
    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
    /// Closes the connection and stops reconnecting. Does not block.
    fn disconnect(&self);
    /// Blocks until the transport's background work has exited. Call after
    /// [`Transport::disconnect`].
    fn join(&self) {}
}

/// Callbacks a transport invokes from its network thread.
pub trait FeedHandler: Send + Sync {
    /// Called after every connect attempt that got an answer from the upstream.
    fn on_connect(&self, transport: &dyn Transport, code: ConnectCode);
    /// Called whenever an established connection ends.
    fn on_disconnect(&self, reason: DisconnectReason);
    /// Called for every message received on a subscribed topic.
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Rate limit applied to one class of high-frequency topics.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRule {
    /// Class name, used as the key prefix (e.g. `data`).
    pub class: String,
    /// Topics starting with this prefix belong to the class.
    pub topic_prefix: String,
    /// Minimum spacing between processed messages per key.
    pub window: Duration,
}

impl RateLimitRule {
    /// Rate-limit key for `topic`, `"<class>_<last topic segment>"`, or `None`
    /// when the topic is not in this class.
    pub fn key_for(&self, topic: &str) -> Option<String> {
        if !topic.starts_with(&self.topic_prefix) {
            return None;
        }
        let entity = topic.rsplit('/').next().unwrap_or(topic);
        Some(format!("{}_{}", self.class, entity))
    }
}

/// Settings for a [`TopicSubscriber`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberConfig {
    /// Prefix joined to logical keys with `/` to form topics.
    pub topic_prefix: String,
    /// Rate limits checked before a message is queued.
    pub rate_limits: Vec<RateLimitRule>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "live-video-captioning".to_string(),
            rate_limits: Vec::new(),
        }
    }
}

/// # Topic Subscriber
///
/// Public entry point for topic consumers and the handler given to the transport.
pub struct TopicSubscriber {
    config: SubscriberConfig,
    registry: Arc<TopicRegistry>,
    rate_limiter: RateLimiter,
    queue: Mutex<Option<mpsc::UnboundedSender<QueueItem>>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    connected: AtomicBool,
    shutdown: Mutex<CancellationToken>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TopicSubscriber {
    /// Creates a subscriber with an empty registry. Nothing is connected or
    /// running until [`initialize`](Self::initialize) and [`start`](Self::start).
    pub fn new(config: SubscriberConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(TopicRegistry::new()),
            rate_limiter: RateLimiter::new(),
            queue: Mutex::new(None),
            transport: Mutex::new(None),
            connected: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
        })
    }

    /// The subscriber's settings.
    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// The registry shared with the dispatch loop.
    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Transport topic for a logical key.
    pub fn topic_for(&self, key: &str) -> String {
        format!("{}/{}", self.config.topic_prefix, key)
    }

    /// Whether the transport reported an accepted connection that has not ended.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.transport).clone()
    }

    /// # Subscribe To Topic
    ///
    /// Registers `callback` for `key`. When the transport is connected the
    /// topic is subscribed right away; otherwise the next connect picks it up.
    pub fn subscribe_to_topic(&self, key: &str, callback: TopicCallback) {
        let topic = self.topic_for(key);
        self.registry.subscribe(&topic, callback);
        log::info!("Registered callback for {}", topic);

        if self.is_connected() {
            if let Some(transport) = self.current_transport() {
                if let Err(e) = transport.subscribe(&topic) {
                    log::warn!("Subscribe to {} deferred to next connect: {}", topic, e);
                }
            }
        }
    }

    /// # Unsubscribe From Topic
    ///
    /// Drops every callback for `key`. Unknown keys are ignored.
    pub fn unsubscribe_from_topic(&self, key: &str) {
        let topic = self.topic_for(key);
        if !self.registry.unsubscribe(&topic) {
            return;
        }
        log::info!("Removed callbacks for {}", topic);

        if self.is_connected() {
            if let Some(transport) = self.current_transport() {
                if let Err(e) = transport.unsubscribe(&topic) {
                    log::warn!("Unsubscribe from {} failed: {}", topic, e);
                }
            }
        }
    }

    /// # Initialize
    ///
    /// Creates the transport through `connect`, handing it this subscriber as
    /// its handler. A setup error (bad URL, missing certificate) is returned so
    /// the caller can decide whether to abort startup.
    pub fn initialize<F>(self: &Arc<Self>, connect: F) -> Result<(), TransportError>
    where
        F: FnOnce(Arc<dyn FeedHandler>) -> Result<Arc<dyn Transport>, TransportError>,
    {
        let handler: Arc<dyn FeedHandler> = Arc::clone(self) as Arc<dyn FeedHandler>;
        let transport = connect(handler)?;
        if let Some(previous) = lock(&self.transport).replace(transport) {
            previous.disconnect();
        }
        Ok(())
    }

    /// # Start
    ///
    /// Opens the inbound queue and spawns the dispatch loop on the current
    /// tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        *lock(&self.shutdown) = token.clone();
        *lock(&self.queue) = Some(tx);

        let dispatcher = InboundDispatcher::new(Arc::clone(&self.registry), self.config.topic_prefix.clone());
        tokio::spawn(dispatcher.run(rx, token))
    }

    /// # Stop
    ///
    /// Cancels the dispatch loop, closes the transport and clears the connected
    /// flag. The registry is left intact.
    pub fn stop(&self) {
        self.halt();
        log::info!("Topic subscriber stopped");
    }

    /// Like [`stop`](Self::stop), then waits on a blocking thread until the
    /// transport's network thread has exited.
    pub async fn stop_and_join(&self) {
        if let Some(transport) = self.halt() {
            if let Err(e) = tokio::task::spawn_blocking(move || transport.join()).await {
                log::error!("Joining the transport failed: {}", e);
            }
        }
        log::info!("Topic subscriber stopped and joined");
    }

    fn halt(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.shutdown).cancel();
        lock(&self.queue).take();
        let transport = lock(&self.transport).take();
        if let Some(transport) = &transport {
            transport.disconnect();
        }
        self.connected.store(false, Ordering::SeqCst);
        transport
    }

    fn admit_rate_limited(&self, topic: &str, now: f64) -> bool {
        for rule in &self.config.rate_limits {
            if let Some(key) = rule.key_for(topic) {
                if !self
                    .rate_limiter
                    .should_process(&key, now, rule.window.as_secs_f64())
                {
                    log::trace!("Rate limited {} (key {})", topic, key);
                    return false;
                }
            }
        }
        true
    }
}

impl FeedHandler for TopicSubscriber {
    fn on_connect(&self, transport: &dyn Transport, code: ConnectCode) {
        match code {
            ConnectCode::Accepted => {
                self.connected.store(true, Ordering::SeqCst);
                let topics = self.registry.topics();
                log::info!("Transport connected, resubscribing {} topic(s)", topics.len());
                for topic in topics {
                    if let Err(e) = transport.subscribe(&topic) {
                        log::warn!("Resubscribe to {} failed: {}", topic, e);
                    }
                }
            }
            ConnectCode::Refused(status) => {
                self.connected.store(false, Ordering::SeqCst);
                log::warn!("Transport connection refused with status {}", status);
            }
        }
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        self.connected.store(false, Ordering::SeqCst);
        match reason {
            DisconnectReason::Requested => log::info!("Transport disconnected"),
            other => log::warn!("Transport disconnected unexpectedly: {:?}", other),
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        let item = QueueItem::now(topic, String::from_utf8_lossy(payload));
        if !self.admit_rate_limited(topic, item.received_at) {
            return;
        }

        let sender = lock(&self.queue).clone();
        match sender {
            Some(sender) => {
                if sender.send(item).is_err() {
                    log::warn!("Dispatch loop is gone, dropping message on {}", topic);
                }
            }
            None => log::warn!("Dispatch loop not running, dropping message on {}", topic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct RecordingTransport {
        subscribed: Mutex<Vec<String>>,
        unsubscribed: Mutex<Vec<String>>,
        disconnects: Mutex<usize>,
        joins: Mutex<usize>,
    }

    impl Transport for RecordingTransport {
        fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.subscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.unsubscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        fn disconnect(&self) {
            *self.disconnects.lock().unwrap() += 1;
        }

        fn join(&self) {
            assert_eq!(*self.disconnects.lock().unwrap(), 1, "joined before disconnect");
            *self.joins.lock().unwrap() += 1;
        }
    }

    fn noop() -> TopicCallback {
        Arc::new(|_, _| Ok(()))
    }

    fn with_transport(subscriber: &Arc<TopicSubscriber>) -> Arc<RecordingTransport> {
        let transport = Arc::new(RecordingTransport::default());
        let handle = Arc::clone(&transport);
        subscriber
            .initialize(move |_handler| Ok(handle as Arc<dyn Transport>))
            .unwrap();
        transport
    }

    fn config(prefix: &str) -> SubscriberConfig {
        SubscriberConfig {
            topic_prefix: prefix.to_string(),
            rate_limits: Vec::new(),
        }
    }

    #[test]
    fn topic_is_prefix_slash_key() {
        let subscriber = TopicSubscriber::new(config("pfx"));
        assert_eq!(subscriber.topic_for("run123"), "pfx/run123");
    }

    #[test]
    fn subscribe_registers_under_the_topic() {
        let subscriber = TopicSubscriber::new(config("t"));
        subscriber.subscribe_to_topic("r1", noop());
        subscriber.subscribe_to_topic("r1", noop());
        assert_eq!(subscriber.registry().callbacks_for("t/r1").len(), 2);
        assert!(!subscriber.is_connected());
    }

    #[test]
    fn accepted_connect_resubscribes_every_topic() {
        let subscriber = TopicSubscriber::new(config("t"));
        subscriber.subscribe_to_topic("r1", noop());
        subscriber.subscribe_to_topic("r2", noop());
        let transport = with_transport(&subscriber);

        subscriber.on_connect(transport.as_ref(), ConnectCode::Accepted);
        assert!(subscriber.is_connected());
        assert_eq!(*transport.subscribed.lock().unwrap(), vec!["t/r1", "t/r2"]);

        // A reconnect replays the same topics again.
        subscriber.on_disconnect(DisconnectReason::ClosedByPeer);
        subscriber.on_connect(transport.as_ref(), ConnectCode::Accepted);
        assert_eq!(transport.subscribed.lock().unwrap().len(), 4);
    }

    #[test]
    fn refused_connect_leaves_flag_cleared() {
        let subscriber = TopicSubscriber::new(config("t"));
        let transport = with_transport(&subscriber);
        subscriber.on_connect(transport.as_ref(), ConnectCode::Refused(401));
        assert!(!subscriber.is_connected());
        assert!(transport.subscribed.lock().unwrap().is_empty());
    }

    #[test]
    fn disconnect_clears_flag_but_keeps_registry() {
        let subscriber = TopicSubscriber::new(config("t"));
        subscriber.subscribe_to_topic("r1", noop());
        let transport = with_transport(&subscriber);
        subscriber.on_connect(transport.as_ref(), ConnectCode::Accepted);

        subscriber.on_disconnect(DisconnectReason::Error("reset".into()));
        assert!(!subscriber.is_connected());
        assert!(subscriber.registry().contains("t/r1"));
    }

    #[test]
    fn subscribing_while_connected_hits_the_transport_immediately() {
        let subscriber = TopicSubscriber::new(config("t"));
        let transport = with_transport(&subscriber);
        subscriber.on_connect(transport.as_ref(), ConnectCode::Accepted);

        subscriber.subscribe_to_topic("late", noop());
        assert_eq!(*transport.subscribed.lock().unwrap(), vec!["t/late"]);

        subscriber.unsubscribe_from_topic("late");
        assert_eq!(*transport.unsubscribed.lock().unwrap(), vec!["t/late"]);
    }

    #[test]
    fn unsubscribing_unknown_key_is_a_noop() {
        let subscriber = TopicSubscriber::new(config("t"));
        let transport = with_transport(&subscriber);
        subscriber.on_connect(transport.as_ref(), ConnectCode::Accepted);
        subscriber.unsubscribe_from_topic("nonexistent");
        assert!(transport.unsubscribed.lock().unwrap().is_empty());
    }

    #[test]
    fn stop_disconnects_and_keeps_registry() {
        let subscriber = TopicSubscriber::new(config("t"));
        subscriber.subscribe_to_topic("r1", noop());
        let transport = with_transport(&subscriber);
        subscriber.on_connect(transport.as_ref(), ConnectCode::Accepted);

        subscriber.stop();
        assert_eq!(*transport.disconnects.lock().unwrap(), 1);
        assert!(!subscriber.is_connected());
        assert!(subscriber.registry().contains("t/r1"));
    }

    #[tokio::test]
    async fn stop_and_join_disconnects_then_joins_once() {
        let subscriber = TopicSubscriber::new(config("t"));
        let transport = with_transport(&subscriber);
        let dispatch = subscriber.start();
        subscriber.on_connect(transport.as_ref(), ConnectCode::Accepted);

        subscriber.stop_and_join().await;
        assert_eq!(*transport.disconnects.lock().unwrap(), 1);
        assert_eq!(*transport.joins.lock().unwrap(), 1);
        assert!(!subscriber.is_connected());
        dispatch.await.unwrap();

        // The transport is released; a second stop has nothing to join.
        subscriber.stop_and_join().await;
        assert_eq!(*transport.joins.lock().unwrap(), 1);
    }

    #[test]
    fn initialize_failure_is_returned() {
        let subscriber = TopicSubscriber::new(config("t"));
        let result = subscriber.initialize(|_| {
            Err(TransportError::MissingCertificate(PathBuf::from("/nope/ca.pem")))
        });
        assert!(matches!(result, Err(TransportError::MissingCertificate(_))));
    }

    #[test]
    fn message_before_start_is_dropped() {
        let subscriber = TopicSubscriber::new(config("t"));
        // No dispatch loop: the message is logged and dropped, not panicking.
        subscriber.on_message("t/r1", b"{}");
    }

    #[test]
    fn rate_limit_key_uses_class_and_last_segment() {
        let rule = RateLimitRule {
            class: "data".into(),
            topic_prefix: "scenescape/data/camera/".into(),
            window: Duration::from_secs(10),
        };
        assert_eq!(
            rule.key_for("scenescape/data/camera/camera1").as_deref(),
            Some("data_camera1")
        );
        assert_eq!(rule.key_for("scenescape/image/camera/camera1"), None);
    }

    #[tokio::test]
    async fn messages_flow_from_network_thread_to_callbacks() {
        let subscriber = TopicSubscriber::new(SubscriberConfig {
            topic_prefix: "t".into(),
            rate_limits: vec![RateLimitRule {
                class: "data".into(),
                topic_prefix: "t/cam".into(),
                window: Duration::from_secs(3600),
            }],
        });

        let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        for key in ["run1", "cam1"] {
            let seen = Arc::clone(&seen);
            subscriber.subscribe_to_topic(
                key,
                Arc::new(move |k, v| {
                    seen.lock().unwrap().push((k.to_string(), v.clone()));
                    Ok(())
                }),
            );
        }
        let task = subscriber.start();

        let handler = Arc::clone(&subscriber);
        std::thread::spawn(move || {
            handler.on_message("t/run1", br#"{"metadata": {"text": "x"}, "blob": ""}"#);
            handler.on_message("t/cam1", b"1");
            handler.on_message("t/cam1", b"2");
        })
        .join()
        .unwrap();

        for _ in 0..100 {
            if seen.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        subscriber.stop();
        task.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("run1".to_string(), json!({"text": "x"})));
        assert_eq!(seen[1], ("cam1".to_string(), json!(1)));
    }
}
