use crate::relay_logic::config::Config;
use anyhow::{Context, Result};
use lib_telemetry::TopicSubscriber;
use lib_telemetry::core::TopicCallback;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct RunningFeed {
    pub subscriber: Arc<TopicSubscriber>,
    pub dispatch: JoinHandle<()>,
}

impl RunningFeed {
    // Returns once the dispatch task and the feed network thread have exited
    pub async fn shutdown(self) {
        self.subscriber.stop_and_join().await;
        if let Err(e) = self.dispatch.await {
            log::error!("Topic dispatch task failed: {}", e);
        }
    }
}

// Logs every message seen on a watched key
fn log_message(key: &str, value: &Value) -> anyhow::Result<()> {
    log::info!("[{}] {}", key, value);
    Ok(())
}

/// Starts the topic subscriber when a feed URL is configured. Must be called
/// from inside the tokio runtime.
pub fn start_feed(config: &Config) -> Result<Option<RunningFeed>> {
    let Some(feed_config) = config.feed_config() else {
        log::info!("No feed URL configured. Topic subscriber disabled.");
        return Ok(None);
    };

    let subscriber = TopicSubscriber::new(config.subscriber_config());
    for key in config.watch_key_list() {
        let callback: TopicCallback = Arc::new(log_message);
        subscriber.subscribe_to_topic(&key, callback);
    }

    let dispatch = subscriber.start();
    if let Err(e) = subscriber.initialize_feed(feed_config) {
        subscriber.stop();
        dispatch.abort();
        return Err(e).context("Failed to initialize topic feed");
    }

    Ok(Some(RunningFeed { subscriber, dispatch }))
}
