use clap::Parser;
use lib_telemetry::core::RateLimitRule;
use lib_telemetry::core::DEFAULT_CLIENT_QUEUE_CAPACITY;
use lib_telemetry::{FeedConfig, SubscriberConfig};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9090;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_DIR: &str = "./logs";
pub const DEFAULT_LOG_FILE_STEM: &str = "metrics_relay";
pub const DEFAULT_LOG_KEEP_FILES: usize = 1;
pub const DEFAULT_TOPIC_PREFIX: &str = "live-video-captioning";
pub const DEFAULT_RATE_LIMIT_SECONDS: f64 = 10.0;
pub const DEFAULT_CONFIG_FILE: &str = "metrics_relay.conf";

// Class name used for the rate-limit key of periodic sensor topics
const RATE_LIMIT_CLASS: &str = "data";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Realtime metrics relay: one collector in, many WebSocket clients out", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "METRICS_PORT", help = "Port to listen on for collector and client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "METRICS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "METRICS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "METRICS_LOG_FILE_STEM", help = "File name prefix of run logs (<stem>_<timestamp>.log).")]
    pub log_file_stem: Option<String>,

    #[clap(long, env = "METRICS_LOG_KEEP_FILES", help = "Number of earlier run logs kept at startup.")]
    pub log_keep_files: Option<usize>,

    #[clap(long, env = "METRICS_CLIENT_QUEUE", help = "Frames a client may fall behind before it is disconnected.")]
    pub client_queue_capacity: Option<usize>,

    #[clap(long, env = "CORS_ORIGINS", help = "Comma separated list of allowed CORS origins, or *.")]
    pub cors_origins: Option<String>,

    #[clap(long, env = "FEED_URL", help = "WebSocket topic feed URL. The feed is disabled when unset.")]
    pub feed_url: Option<String>,

    #[clap(long, env = "FEED_TOPIC_PREFIX", help = "Prefix joined to logical keys to form feed topics.")]
    pub topic_prefix: Option<String>,

    #[clap(long, env = "FEED_CA_CERT_PATH", help = "PEM bundle of CAs trusted for a wss:// feed.")]
    pub ca_cert_path: Option<PathBuf>,

    #[clap(long, env = "FEED_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for feed reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "FEED_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for feed reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "FEED_RATE_LIMIT_SECONDS", help = "Minimum seconds between processed messages per rate-limited entity.")]
    pub rate_limit_seconds: Option<f64>,

    #[clap(long, env = "FEED_RATE_LIMITED_PREFIX", help = "Topic prefix of high-frequency sensor topics to rate limit.")]
    pub rate_limited_prefix: Option<String>,

    #[clap(long, env = "FEED_WATCH_KEYS", help = "Comma separated logical keys to subscribe to and log.")]
    pub watch_keys: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_file_stem: other.log_file_stem.or(self.log_file_stem),
            log_keep_files: other.log_keep_files.or(self.log_keep_files),
            client_queue_capacity: other.client_queue_capacity.or(self.client_queue_capacity),
            cors_origins: other.cors_origins.or(self.cors_origins),
            feed_url: other.feed_url.or(self.feed_url),
            topic_prefix: other.topic_prefix.or(self.topic_prefix),
            ca_cert_path: other.ca_cert_path.or(self.ca_cert_path),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            rate_limit_seconds: other.rate_limit_seconds.or(self.rate_limit_seconds),
            rate_limited_prefix: other.rate_limited_prefix.or(self.rate_limited_prefix),
            watch_keys: other.watch_keys.or(self.watch_keys),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(DEFAULT_PORT),
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            log_file_stem: Some(DEFAULT_LOG_FILE_STEM.to_string()),
            log_keep_files: Some(DEFAULT_LOG_KEEP_FILES),
            client_queue_capacity: Some(DEFAULT_CLIENT_QUEUE_CAPACITY),
            cors_origins: Some("*".to_string()),
            topic_prefix: Some(DEFAULT_TOPIC_PREFIX.to_string()),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(30000),
            rate_limit_seconds: Some(DEFAULT_RATE_LIMIT_SECONDS),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }

    pub fn log_file_stem(&self) -> String {
        self.log_file_stem
            .as_deref()
            .map(str::trim)
            .filter(|stem| !stem.is_empty())
            .unwrap_or(DEFAULT_LOG_FILE_STEM)
            .to_string()
    }

    pub fn log_keep_files(&self) -> usize {
        self.log_keep_files.unwrap_or(DEFAULT_LOG_KEEP_FILES)
    }

    pub fn client_queue_capacity(&self) -> usize {
        self.client_queue_capacity.unwrap_or(DEFAULT_CLIENT_QUEUE_CAPACITY)
    }

    /// Allowed CORS origins. `*` stands for any origin.
    pub fn cors_origin_list(&self) -> Vec<String> {
        split_list(self.cors_origins.as_deref().unwrap_or("*"))
    }

    pub fn watch_key_list(&self) -> Vec<String> {
        split_list(self.watch_keys.as_deref().unwrap_or(""))
    }

    pub fn topic_prefix(&self) -> String {
        self.topic_prefix.clone().unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string())
    }

    fn rate_limit_window(&self) -> Duration {
        let seconds = self.rate_limit_seconds.unwrap_or(DEFAULT_RATE_LIMIT_SECONDS);
        Duration::try_from_secs_f64(seconds).unwrap_or_else(|_| {
            log::warn!(
                "Invalid rate limit of {} seconds. Using {} seconds.",
                seconds,
                DEFAULT_RATE_LIMIT_SECONDS
            );
            Duration::from_secs_f64(DEFAULT_RATE_LIMIT_SECONDS)
        })
    }

    /// Subscriber settings derived from the feed options.
    pub fn subscriber_config(&self) -> SubscriberConfig {
        let rate_limits = self
            .rate_limited_prefix
            .iter()
            .map(|prefix| RateLimitRule {
                class: RATE_LIMIT_CLASS.to_string(),
                topic_prefix: prefix.clone(),
                window: self.rate_limit_window(),
            })
            .collect();

        SubscriberConfig {
            topic_prefix: self.topic_prefix(),
            rate_limits,
        }
    }

    /// Transport settings, or `None` when no feed URL is configured.
    pub fn feed_config(&self) -> Option<FeedConfig> {
        let url = self.feed_url.as_ref().filter(|url| !url.trim().is_empty())?;
        let mut feed = FeedConfig::new(url.trim());
        feed.ca_cert_path = self.ca_cert_path.clone();
        if let Some(ms) = self.reconnect_base_delay_ms {
            feed.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect_max_delay_ms {
            feed.reconnect_max_delay = Duration::from_millis(ms);
        }
        Some(feed)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }

    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file: {} ({}). Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file: {} ({}). Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Loads the configuration from the process arguments and environment.
pub fn load_config() -> Config {
    load_config_from(std::env::args_os())
}

/// Loads the configuration from `args` (first item is the program name).
///
/// Precedence, lowest first: built-in defaults, the JSON config file, then
/// environment variables and CLI flags.
pub fn load_config_from<I, T>(args: I) -> Config
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    // 1. Load defaults
    let mut current_config = Config::defaults();

    // 2. Parse CLI and env once; it may name the config file.
    let cli_args = Config::parse_from(args);
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    // 3. Merge the config file over the defaults
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    // 4. CLI arguments and env vars win over everything
    current_config.merge(cli_args)
}
