//! # lib_telemetry
//!
//! Shared engine for the metrics servers. It relays telemetry from a single
//! collector connection to any number of client connections, and dispatches
//! messages arriving from an upstream topic feed to per-topic callbacks.

// Declare the modules to re-export
pub mod core;
#[cfg(feature = "feeds")]
pub mod ingestors;

// Re-export the types most callers need
pub use crate::core::{
    CollectorLease, MessageEnvelope, MetricsRelay, NormalizationError, RateLimiter, RelayError,
    RelayStatus, SubscriberConfig, TopicRegistry, TopicSubscriber,
};
#[cfg(feature = "feeds")]
pub use ingestors::{FeedClient, FeedConfig};
