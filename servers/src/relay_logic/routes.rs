use crate::relay_logic::state::AppState;
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use lib_telemetry::RelayStatus;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub const SERVICE_NAME: &str = "Metrics Service";
pub const SERVICE_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    #[serde(flatten)]
    relay: RelayStatus,
}

pub fn build_router(app_state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/health", get(health_detailed_handler))
        .route("/ws/collector", get(collector_ws_handler))
        .route("/ws/clients", get(clients_ws_handler))
        .layer(cors_layer(cors_origins))
        .with_state(app_state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

pub async fn serve(listener: TcpListener, app_state: AppState, cors_origins: Vec<String>) -> Result<()> {
    let mut shutdown = app_state.shutdown.subscribe();
    let app = build_router(app_state, &cors_origins);

    log::info!("Metrics relay listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Metrics relay server shutting down.");
        })
        .await
        .context("HTTP server failed")
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "description": "Relays collector metrics to connected WebSocket clients",
        "endpoints": {
            "websocket_collector": "/ws/collector",
            "websocket_clients": "/ws/clients",
            "health": "/health",
            "health_detailed": "/api/health"
        }
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn health_detailed_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthReport {
        status: "healthy",
        relay: state.relay.status(),
    })
}

async fn collector_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_collector(socket, state))
}

async fn clients_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_client(socket, state))
}

async fn handle_collector(mut socket: WebSocket, state: AppState) {
    let mut shutdown = state.shutdown.subscribe();
    let lease = match state.relay.admit_collector() {
        Ok(lease) => lease,
        Err(e) => {
            log::warn!("Rejecting collector connection: {}", e);
            let payload = json!({ "error": e.to_string() }).to_string();
            if socket.send(Message::Text(payload.into())).await.is_ok() {
                let _ = socket.send(Message::Close(None)).await;
            }
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = state.relay.ingest(text.as_bytes());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = state.relay.ingest(&bytes);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::info!("Collector {} read error: {}", lease.id(), e);
                    break;
                }
            },
        }
    }

    log::info!("Collector {} disconnected", lease.id());
}

async fn handle_client(socket: WebSocket, state: AppState) {
    let mut shutdown = state.shutdown.subscribe();
    let (client_id, mut frames) = state.relay.add_client();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            // Envelopes queued by the relay's broadcast
            frame = frames.recv() => match frame {
                Some(frame) => {
                    // The shared frame is copied into this socket's own text message
                    if let Err(e) = sender.send(Message::Text(frame.to_string().into())).await {
                        log::info!("Client {} write failed: {}", client_id, e);
                        break;
                    }
                }
                None => break,
            },
            // Client frames carry nothing; only a close ends the session
            message = receiver.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.relay.remove_client(client_id);
    log::info!("Client {} disconnected", client_id);
}
