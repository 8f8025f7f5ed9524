//! Retry utilities: backoff builders for bridge reconnection.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::config::{RetryConfig, RetryMode};

/// Backoff for reopening a failed bridge call, or `None` when retries are off.
pub fn bridge_backoff(config: &RetryConfig) -> Option<ExponentialBuilder> {
    match config.mode {
        RetryMode::Never => None,
        RetryMode::Backoff => Some(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(config.min_delay_ms))
                .with_max_delay(Duration::from_millis(
                    config.max_delay_ms.max(config.min_delay_ms),
                ))
                .with_max_times(config.max_times)
                .with_jitter(),
        ),
    }
}

/// Delays to wait between attempts. Empty when retries are off.
pub fn retry_delays(config: &RetryConfig) -> Box<dyn Iterator<Item = Duration> + Send> {
    match bridge_backoff(config) {
        Some(builder) => Box::new(builder.build()),
        None => Box::new(std::iter::empty()),
    }
}
