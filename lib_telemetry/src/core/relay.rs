//! # Metrics Relay
//!
//! One instance per process, shared by the collector and client endpoints. It
//! owns the collector slot and the client set and exposes the three
//! operations the web layer needs: admit a collector, ingest a collector
//! payload, and report status. Tests build a fresh instance instead of
//! resetting globals.

use std::sync::Arc;

use serde::Serialize;

use crate::core::collector::{CollectorLease, CollectorSlot, RelayError};
use crate::core::dispatcher::{ClientId, ClientSet, Frame};
use crate::core::normalizer::{normalize, NormalizationError};

/// Point-in-time view of the relay's connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    /// Whether a collector holds the slot.
    pub collector_connected: bool,
    /// Number of connected clients.
    pub clients_connected: usize,
}

/// The collector → clients relay.
#[derive(Debug, Default)]
pub struct MetricsRelay {
    collector: Arc<CollectorSlot>,
    clients: ClientSet,
}

impl MetricsRelay {
    /// Creates a relay with an empty slot and no clients.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a relay whose clients are evicted once they fall `capacity`
    /// frames behind.
    pub fn with_client_queue_capacity(capacity: usize) -> Self {
        Self {
            collector: Arc::default(),
            clients: ClientSet::with_queue_capacity(capacity),
        }
    }

    /// Claims the collector slot. See [`CollectorSlot::try_admit`].
    pub fn admit_collector(&self) -> Result<CollectorLease, RelayError> {
        self.collector.try_admit()
    }

    /// Registers a client connection.
    pub fn add_client(&self) -> (ClientId, tokio::sync::mpsc::Receiver<Frame>) {
        self.clients.add()
    }

    /// Deregisters a client connection.
    pub fn remove_client(&self, id: ClientId) {
        self.clients.remove(id);
    }

    /// # Ingest
    ///
    /// Normalizes one collector payload and broadcasts it. A payload that
    /// cannot be normalized is logged and dropped; nothing is reported back to
    /// the collector. Returns the number of clients the envelope was queued for.
    pub fn ingest(&self, raw: &[u8]) -> Result<usize, NormalizationError> {
        let envelope = match normalize(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping collector payload ({} bytes): {}", raw.len(), e);
                return Err(e);
            }
        };

        let text = envelope.to_json()?;
        let delivered = self.clients.broadcast(Frame::from(text));
        log::trace!(
            "Broadcast {} metric(s) to {} client(s)",
            envelope.metrics().len(),
            delivered
        );
        Ok(delivered)
    }

    /// Current connection status, computed on every call.
    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            collector_connected: self.collector.is_occupied(),
            clients_connected: self.clients.size(),
        }
    }
}
