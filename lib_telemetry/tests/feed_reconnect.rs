//! Topic feed against a local WebSocket broker: delivery, resubscription after
//! the broker drops the connection, connection state, and shutdown.
#![cfg(feature = "feeds")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lib_telemetry::core::{ConnectCode, DisconnectReason, FeedHandler, Transport};
use lib_telemetry::ingestors::FeedState;
use lib_telemetry::{FeedClient, FeedConfig, SubscriberConfig, TopicSubscriber};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type Seen = Arc<Mutex<Vec<(String, Value)>>>;

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame from subscriber")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            return text.to_string();
        }
    }
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (tcp, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("subscriber connects")
        .unwrap();
    accept_async(tcp).await.unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feed_delivers_and_resubscribes_after_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let subscriber = TopicSubscriber::new(SubscriberConfig {
        topic_prefix: "pfx".into(),
        rate_limits: Vec::new(),
    });
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    subscriber.subscribe_to_topic(
        "run1",
        Arc::new(move |key, value| {
            sink.lock().unwrap().push((key.to_string(), value.clone()));
            Ok(())
        }),
    );
    let dispatch = subscriber.start();

    let mut config = FeedConfig::new(url);
    config.reconnect_base_delay = Duration::from_millis(50);
    config.reconnect_max_delay = Duration::from_millis(200);
    subscriber.initialize_feed(config).unwrap();

    // First connection: the registered topic is subscribed on connect.
    let mut ws = accept(&listener).await;
    assert_eq!(next_text(&mut ws).await, r#"{"subscribe":["pfx/run1"]}"#);
    wait_for(|| subscriber.is_connected()).await;

    let frame = json!({"topic": "pfx/run1", "payload": {"metadata": {"text": "a"}}});
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    wait_for(|| seen.lock().unwrap().len() == 1).await;
    assert_eq!(
        seen.lock().unwrap()[0],
        ("run1".to_string(), json!({"text": "a"}))
    );

    // Broker goes away. The subscriber reconnects and replays its topics.
    drop(ws);
    let mut ws = accept(&listener).await;
    assert_eq!(next_text(&mut ws).await, r#"{"subscribe":["pfx/run1"]}"#);
    wait_for(|| subscriber.is_connected()).await;

    ws.send(Message::Text(
        json!({"topic": "pfx/run1", "payload": "not-json"}).to_string().into(),
    ))
    .await
    .unwrap();
    wait_for(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(seen.lock().unwrap()[1].1, json!({"raw": "not-json"}));

    subscriber.stop();
    assert!(!subscriber.is_connected());
    tokio::time::timeout(Duration::from_secs(2), dispatch)
        .await
        .expect("dispatch loop stops")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn topic_added_while_connected_is_subscribed_immediately() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let subscriber = TopicSubscriber::new(SubscriberConfig {
        topic_prefix: "pfx".into(),
        rate_limits: Vec::new(),
    });
    let _dispatch = subscriber.start();
    subscriber.initialize_feed(FeedConfig::new(url)).unwrap();

    let mut ws = accept(&listener).await;
    wait_for(|| subscriber.is_connected()).await;
    // Let the (empty) connect replay finish first.
    tokio::time::sleep(Duration::from_millis(100)).await;

    subscriber.subscribe_to_topic("late", Arc::new(|_, _| Ok(())));
    assert_eq!(next_text(&mut ws).await, r#"{"subscribe":["pfx/late"]}"#);

    subscriber.unsubscribe_from_topic("late");
    assert_eq!(next_text(&mut ws).await, r#"{"unsubscribe":["pfx/late"]}"#);

    subscriber.stop();
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl FeedHandler for EventLog {
    fn on_connect(&self, _transport: &dyn Transport, code: ConnectCode) {
        self.events.lock().unwrap().push(format!("connect {:?}", code));
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        let kind = match reason {
            DisconnectReason::Requested => "requested",
            DisconnectReason::ClosedByPeer | DisconnectReason::Error(_) => "lost",
        };
        self.events.lock().unwrap().push(format!("disconnect {}", kind));
    }

    fn on_message(&self, _topic: &str, _payload: &[u8]) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feed_state_follows_connect_drop_and_stop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = FeedConfig::new(format!("ws://{}", listener.local_addr().unwrap()));
    // Long enough to observe the gap between a drop and the next attempt
    config.reconnect_base_delay = Duration::from_secs(2);
    config.reconnect_max_delay = Duration::from_secs(2);

    let handler = Arc::new(EventLog::default());
    let client = FeedClient::spawn(config, Arc::clone(&handler) as Arc<dyn FeedHandler>).unwrap();

    // The TCP connect lands in the backlog; the handshake waits for accept.
    wait_for(|| client.state() == FeedState::Connecting).await;
    assert!(handler.events().is_empty());

    let ws = accept(&listener).await;
    wait_for(|| client.state() == FeedState::Connected).await;
    assert_eq!(handler.events(), vec!["connect Accepted"]);

    drop(ws);
    wait_for(|| client.state() == FeedState::Disconnected).await;
    assert_eq!(handler.events(), vec!["connect Accepted", "disconnect lost"]);

    client.disconnect();
    let joiner = Arc::clone(&client);
    tokio::time::timeout(Duration::from_secs(5), tokio::task::spawn_blocking(move || joiner.join()))
        .await
        .expect("network thread exits")
        .unwrap();
    assert_eq!(client.state(), FeedState::Disconnected);
    assert_eq!(handler.events().len(), 2);
}

#[test]
fn missing_ca_bundle_fails_initialize() {
    let subscriber = TopicSubscriber::new(SubscriberConfig::default());
    let mut config = FeedConfig::new("wss://broker.invalid/feed");
    config.ca_cert_path = Some("/definitely/not/here/ca.pem".into());

    let err = subscriber.initialize_feed(config).unwrap_err();
    assert!(err.to_string().contains("certificate file not found"));
}
