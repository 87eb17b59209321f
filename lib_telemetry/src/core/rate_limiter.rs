//! # Rate Limiter
//!
//! Remembers when each key was last let through and drops anything that
//! arrives again within the window. Only high-frequency producer topics (periodic
//! sensor data) are routed through it; one-shot commands never are.
//!
//! The check and the update happen under a single lock, so callers on the
//! transport's network thread and on the tokio runtime can share one instance.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Per-key last-processed timestamps, in epoch seconds.
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_processed: Mutex<HashMap<String, f64>>,
}

impl RateLimiter {
    /// Creates an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// # Should Process
    ///
    /// Returns `true` and records `now` for `key` when the key has never been
    /// seen or at least `window_secs` have elapsed since it was last recorded.
    /// Otherwise returns `false` and leaves the state untouched.
    pub fn should_process(&self, key: &str, now: f64, window_secs: f64) -> bool {
        let mut last = self
            .last_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match last.get(key) {
            Some(&previous) if now - previous < window_secs => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Number of keys seen so far.
    pub fn tracked_keys(&self) -> usize {
        self.last_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
