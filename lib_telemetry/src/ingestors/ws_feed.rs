//! # WebSocket Topic Feed
//!
//! A topic transport over a single WebSocket connection.
//! Location: lib_telemetry/src/ingestors/ws_feed.rs
//!
//! ## Wire format
//!
//! - Outbound control frames: `{"subscribe":["<topic>"]}` and
//!   `{"unsubscribe":["<topic>"]}`.
//! - Inbound data frames: `{"topic":"<topic>","payload":<any>}`. A string
//!   payload is handed to the handler as its text; any other JSON value is
//!   handed over re-serialized.
//!
//! ## Threading
//!
//! The connection runs on a dedicated OS thread with its own current-thread
//! tokio runtime. Handler callbacks are invoked from that thread. Commands from
//! other threads reach it through an unbounded channel, so [`Transport`] calls
//! never block.
//!
//! ## Reconnection
//!
//! Failed attempts and dropped connections are retried with exponential backoff
//! between `reconnect_base_delay` and `reconnect_max_delay`. The delay resets
//! after every successful connect. Commands issued while disconnected are
//! discarded at the next connect; the handler replays its topics from
//! `on_connect` instead.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::CertificateDer;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::subscriber::{
    ConnectCode, DisconnectReason, FeedHandler, TopicSubscriber, Transport, TransportError,
};

type FeedStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection settings for a [`FeedClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// `ws://` or `wss://` endpoint of the upstream feed.
    pub url: String,
    /// PEM bundle of CAs trusted for `wss://`. System roots are used when unset.
    pub ca_cert_path: Option<PathBuf>,
    /// First reconnect delay.
    pub reconnect_base_delay: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay: Duration,
}

impl FeedConfig {
    /// Settings for `url` with default reconnect delays of 1s up to 30s.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ca_cert_path: None,
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30000),
        }
    }
}

/// Where the feed's network thread currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// No connection; either waiting to retry or stopped.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and relaying frames.
    Connected,
}

#[derive(Debug)]
enum FeedCommand {
    Subscribe(String),
    Unsubscribe(String),
}

impl FeedCommand {
    fn to_frame(&self) -> String {
        match self {
            FeedCommand::Subscribe(topic) => json!({ "subscribe": [topic] }).to_string(),
            FeedCommand::Unsubscribe(topic) => json!({ "unsubscribe": [topic] }).to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DataFrame {
    topic: String,
    payload: Value,
}

impl DataFrame {
    fn payload_bytes(self) -> Vec<u8> {
        match self.payload {
            Value::String(text) => text.into_bytes(),
            other => other.to_string().into_bytes(),
        }
    }
}

/// State shared between the client handle and the network thread.
struct FeedLink {
    commands: mpsc::UnboundedSender<FeedCommand>,
    state: Mutex<FeedState>,
    shutdown: CancellationToken,
}

impl FeedLink {
    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: FeedState) {
        *self.state() = state;
    }

    fn send(&self, command: FeedCommand) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::NotConnected);
        }
        self.commands
            .send(command)
            .map_err(|_| TransportError::NotConnected)
    }
}

impl Transport for FeedLink {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.send(FeedCommand::Subscribe(topic.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.send(FeedCommand::Unsubscribe(topic.to_string()))
    }

    fn disconnect(&self) {
        self.shutdown.cancel();
    }
}

/// # Feed Client
///
/// Handle to a running WebSocket feed. Dropping the last handle stops the
/// network thread.
pub struct FeedClient {
    link: Arc<FeedLink>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FeedClient {
    /// # Spawn
    ///
    /// Validates `config`, loads the CA bundle if one is configured and starts
    /// the network thread. Connecting happens in the background; the outcome
    /// of every attempt is reported to `handler`.
    pub fn spawn(config: FeedConfig, handler: Arc<dyn FeedHandler>) -> Result<Arc<Self>, TransportError> {
        let url = parse_feed_url(&config.url)?;
        let connector = match &config.ca_cert_path {
            Some(path) => Some(Connector::Rustls(Arc::new(tls_config(path)?))),
            None => None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(FeedLink {
            commands: tx,
            state: Mutex::new(FeedState::Disconnected),
            shutdown: CancellationToken::new(),
        });

        let session = FeedSession {
            link: Arc::clone(&link),
            handler,
            url,
            connector,
            backoff: Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay),
        };

        let thread = std::thread::Builder::new()
            .name("feed-network".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(session.run(rx)),
                    Err(e) => log::error!("Failed to build feed runtime: {}", e),
                }
            })?;

        Ok(Arc::new(Self {
            link,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Current connection state.
    pub fn state(&self) -> FeedState {
        *self.link.state()
    }
}

impl Transport for FeedClient {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.link.subscribe(topic)
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.link.unsubscribe(topic)
    }

    fn disconnect(&self) {
        self.link.disconnect();
    }

    fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Feed network thread panicked");
            }
        }
    }
}

impl Drop for FeedClient {
    fn drop(&mut self) {
        self.link.shutdown.cancel();
    }
}

impl TopicSubscriber {
    /// # Initialize Feed
    ///
    /// Creates a [`FeedClient`] for `config` with this subscriber as its handler.
    pub fn initialize_feed(self: &Arc<Self>, config: FeedConfig) -> Result<(), TransportError> {
        log::info!("Initializing topic feed at {}", config.url);
        self.initialize(move |handler| {
            FeedClient::spawn(config, handler).map(|client| client as Arc<dyn Transport>)
        })
    }
}

fn parse_feed_url(raw: &str) -> Result<Url, TransportError> {
    let url = Url::parse(raw).map_err(|e| TransportError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(TransportError::InvalidUrl(format!(
            "{raw}: unsupported scheme '{other}'"
        ))),
    }
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TransportError> {
    if !path.exists() {
        return Err(TransportError::MissingCertificate(path.to_path_buf()));
    }

    let file = File::open(path)
        .map_err(|e| TransportError::InvalidCertificate(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| TransportError::InvalidCertificate(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TransportError::InvalidCertificate(format!(
            "{}: no certificates found",
            path.display()
        )));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| TransportError::InvalidCertificate(e.to_string()))?;
    }
    Ok(roots)
}

fn tls_config(ca_path: &Path) -> Result<ClientConfig, TransportError> {
    let roots = load_root_store(ca_path)?;
    log::info!("Trusting {} CA certificate(s) from {}", roots.len(), ca_path.display());

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self { base, max, next: base }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.base;
    }
}

/// Everything the network thread owns.
struct FeedSession {
    link: Arc<FeedLink>,
    handler: Arc<dyn FeedHandler>,
    url: Url,
    connector: Option<Connector>,
    backoff: Backoff,
}

impl FeedSession {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<FeedCommand>) {
        let shutdown = self.link.shutdown.clone();
        log::info!("Feed network thread started for {}", self.url);

        loop {
            self.link.set_state(FeedState::Connecting);
            log::info!("Connecting to feed: {}", self.url);

            let attempt = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                attempt = connect_async_tls_with_config(self.url.as_str(), None, false, self.connector.clone()) => attempt,
            };

            match attempt {
                Ok((stream, _response)) => {
                    self.backoff.reset();
                    while commands.try_recv().is_ok() {}
                    self.link.set_state(FeedState::Connected);
                    log::info!("Connected to feed {}", self.url);
                    self.handler.on_connect(self.link.as_ref(), ConnectCode::Accepted);

                    let reason = self.relay(stream, &mut commands, &shutdown).await;
                    self.link.set_state(FeedState::Disconnected);
                    let requested = reason == DisconnectReason::Requested;
                    self.handler.on_disconnect(reason);
                    if requested {
                        break;
                    }
                }
                Err(WsError::Http(response)) => {
                    self.link.set_state(FeedState::Disconnected);
                    let status = response.status().as_u16();
                    self.handler.on_connect(self.link.as_ref(), ConnectCode::Refused(status));
                }
                Err(e) => {
                    self.link.set_state(FeedState::Disconnected);
                    log::warn!("Feed connect to {} failed: {}", self.url, e);
                }
            }

            let delay = self.backoff.next_delay();
            log::info!("Retrying feed connection in {}ms", delay.as_millis());
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.link.set_state(FeedState::Disconnected);
        log::info!("Feed network thread stopped");
    }

    async fn relay(
        &self,
        stream: FeedStream,
        commands: &mut mpsc::UnboundedReceiver<FeedCommand>,
        shutdown: &CancellationToken,
    ) -> DisconnectReason {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    if let Err(e) = write.close().await {
                        log::debug!("Feed close handshake failed: {}", e);
                    }
                    return DisconnectReason::Requested;
                }
                Some(command) = commands.recv() => {
                    let frame = command.to_frame();
                    log::debug!("Sending to feed: {}", frame);
                    if let Err(e) = write.send(Message::Text(frame.into())).await {
                        log::error!("Failed to send {:?}: {}", command, e);
                        return DisconnectReason::Error(e.to_string());
                    }
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.deliver(text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => self.deliver(&bytes),
                    Some(Ok(Message::Close(_))) | None => {
                        log::warn!("Feed stream closed by remote host.");
                        return DisconnectReason::ClosedByPeer;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("Feed read error: {}", e);
                        return DisconnectReason::Error(e.to_string());
                    }
                },
            }
        }
    }

    fn deliver(&self, frame: &[u8]) {
        match serde_json::from_slice::<DataFrame>(frame) {
            Ok(frame) => {
                let topic = frame.topic.clone();
                self.handler.on_message(&topic, &frame.payload_bytes());
            }
            Err(e) => log::debug!("Ignoring feed frame that is not a topic message: {}", e),
        }
    }
}
