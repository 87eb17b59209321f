//! # Feed Ingestors Module
//!
//! Transports that bring upstream topic messages into the process. Each
//! transport implements [`Transport`](crate::core::Transport) and reports to a
//! [`FeedHandler`](crate::core::FeedHandler), so the subscriber never depends
//! on a concrete wire protocol.
//!
//! ## Contained Modules:
//! - **`ws_feed`**: A reconnecting WebSocket topic feed that runs on its own
//!   network thread, with optional CA pinning through rustls.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The WebSocket topic feed.
pub mod ws_feed;

// --- Public API Re-exports ---
pub use ws_feed::{FeedClient, FeedConfig, FeedState};
