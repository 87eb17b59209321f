use lib_telemetry::MetricsRelay;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    // The collector -> clients relay shared by every connection
    pub relay: Arc<MetricsRelay>,
    // Fired once when the process shuts down; every socket task listens on it
    pub shutdown: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(shutdown: broadcast::Sender<()>) -> Self {
        Self::with_relay(MetricsRelay::new(), shutdown)
    }

    pub fn with_relay(relay: MetricsRelay, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            relay: Arc::new(relay),
            shutdown,
        }
    }
}
