//! Configuration layering: defaults, then the JSON file, then CLI flags.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use servers::relay_logic::config::load_config_from;

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn defaults_apply_without_file_or_flags() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.conf");
    let config = load_config_from(["metrics_relay", "--config-path", missing.to_str().unwrap()]);

    assert_eq!(config.port(), 9090);
    assert_eq!(config.log_level(), "info");
    assert_eq!(config.log_dir(), PathBuf::from("./logs"));
    assert_eq!(config.log_file_stem(), "metrics_relay");
    assert_eq!(config.log_keep_files(), 1);
    assert_eq!(config.client_queue_capacity(), 1024);
    assert_eq!(config.cors_origin_list(), vec!["*"]);
    assert_eq!(config.topic_prefix(), "live-video-captioning");
    assert!(config.feed_config().is_none());
    assert!(config.watch_key_list().is_empty());
}

#[test]
fn file_values_override_defaults() {
    let file = config_file(
        r#"{
            "port": 9191,
            "corsOrigins": "http://a.local, http://b.local",
            "feedUrl": "ws://broker.local/feed",
            "topicPrefix": "pfx",
            "reconnectBaseDelayMs": 250,
            "watchKeys": "run1,run2"
        }"#,
    );
    let config = load_config_from(["metrics_relay", "--config-path", file.path().to_str().unwrap()]);

    assert_eq!(config.port(), 9191);
    assert_eq!(config.cors_origin_list(), vec!["http://a.local", "http://b.local"]);
    assert_eq!(config.watch_key_list(), vec!["run1", "run2"]);
    assert_eq!(config.subscriber_config().topic_prefix, "pfx");

    let feed = config.feed_config().expect("feed configured");
    assert_eq!(feed.url, "ws://broker.local/feed");
    assert_eq!(feed.reconnect_base_delay, Duration::from_millis(250));
    assert_eq!(feed.reconnect_max_delay, Duration::from_millis(30000));
}

#[test]
fn cli_flags_override_the_file() {
    let file = config_file(r#"{"port": 9191, "logLevel": "debug"}"#);
    let config = load_config_from([
        "metrics_relay",
        "--config-path",
        file.path().to_str().unwrap(),
        "--port",
        "9292",
    ]);

    assert_eq!(config.port(), 9292);
    assert_eq!(config.log_level(), "debug");
}

#[test]
fn unparsable_file_is_skipped() {
    let file = config_file("{ not json");
    let config = load_config_from(["metrics_relay", "--config-path", file.path().to_str().unwrap()]);
    assert_eq!(config.port(), 9090);
}

#[test]
fn log_and_queue_options_layer_like_the_rest() {
    let file = config_file(r#"{"logFileStem": "edge_relay", "logKeepFiles": 4, "clientQueueCapacity": 64}"#);
    let config = load_config_from([
        "metrics_relay",
        "--config-path",
        file.path().to_str().unwrap(),
        "--log-keep-files",
        "2",
    ]);

    assert_eq!(config.log_file_stem(), "edge_relay");
    assert_eq!(config.log_keep_files(), 2);
    assert_eq!(config.client_queue_capacity(), 64);
}
