//! # Core Engine Module
//!
//! This module forms the heart of the telemetry engine. It holds two independent
//! pipelines that share nothing but the process:
//!
//! ## Relay pipeline (collector → clients)
//!
//! - **`collector`**: the admission-controlled slot for the single producer
//!   connection.
//! - **`normalizer`**: turns raw collector payloads into `{metrics: [...]}`
//!   envelopes.
//! - **`dispatcher`**: the client broadcast set. Each client owns an unbounded
//!   channel drained by its own socket task, so one slow client never delays
//!   another.
//! - **`relay`**: the facade owning the slot and the client set, exposing
//!   admit, ingest and status operations.
//!
//! ## Topic pipeline (upstream feed → callbacks)
//!
//! - **`registry`**: topic → ordered callbacks.
//! - **`rate_limiter`**: per-key check-and-set admission for high-frequency topics.
//! - **`inbound`**: the queue bridging the transport's network thread into a
//!   single dispatch task on the tokio runtime.
//! - **`subscriber`**: the transport handler that resubscribes every registered
//!   topic on (re)connect and feeds the inbound queue.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Single-writer admission control for the collector connection.
pub mod collector;
/// Concurrent fan-out of envelopes to every connected client.
pub mod dispatcher;
/// Queue and dispatch loop for transport messages.
pub mod inbound;
/// Raw payload → canonical envelope conversion.
pub mod normalizer;
/// Last-processed-time rate limiting keyed by message class.
pub mod rate_limiter;
/// Topic → callback registry.
pub mod registry;
/// Facade over the collector slot and the client set.
pub mod relay;
/// Transport handler with reconnection-safe resubscription.
pub mod subscriber;

// --- Public API Re-exports ---
pub use collector::{CollectorLease, CollectorSlot, RelayError, COLLECTOR_REJECTION};
pub use dispatcher::{ClientId, ClientSet, Frame, DEFAULT_CLIENT_QUEUE_CAPACITY};
pub use inbound::{epoch_seconds, InboundDispatcher, QueueItem};
pub use normalizer::{normalize, MessageEnvelope, NormalizationError, PayloadShape};
pub use rate_limiter::RateLimiter;
pub use registry::{TopicCallback, TopicRegistry};
pub use relay::{MetricsRelay, RelayStatus};
pub use subscriber::{
    ConnectCode, DisconnectReason, FeedHandler, RateLimitRule, SubscriberConfig, TopicSubscriber,
    Transport, TransportError,
};
