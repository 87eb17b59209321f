//! # servers
//!
//! Process-level pieces of the metrics relay: configuration, logging, the axum
//! web layer and the optional topic feed. The `metrics_relay` binary wires them
//! together; the integration tests drive the same router in-process.

pub mod relay_logic;
