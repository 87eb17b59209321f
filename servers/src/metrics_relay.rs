use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::signal;

use lib_telemetry::MetricsRelay;
use servers::relay_logic::{config, feed, logger, routes, state};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config();
    logger::setup_logging(&logger::LogSettings::from_config(&config))?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let relay = MetricsRelay::with_client_queue_capacity(config.client_queue_capacity());
    let app_state = state::AppState::with_relay(relay, shutdown_tx.clone());

    let running_feed = feed::start_feed(&config)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let server_handle = tokio::spawn(routes::serve(
        listener,
        app_state.clone(),
        config.cors_origin_list(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    if let Some(running_feed) = running_feed {
        running_feed.shutdown().await;
    }

    // Wait for the server to drain
    server_handle.await.context("Server task panicked")??;

    log::info!("Shutdown complete.");
    Ok(())
}
