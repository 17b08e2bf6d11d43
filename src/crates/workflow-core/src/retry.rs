//! Retry/fallback bookkeeping for the `OnError` policy.
//!
//! Unlike a generic exponential-backoff policy, `OnError.RetryDelay` is a
//! single expression re-evaluated before every attempt, and `MaxRetries` is a
//! hard attempt count rather than a curve — so this module only tracks state
//! across attempts, it does not compute delays itself.

use std::time::Duration;

/// Tracks attempts made while retrying a single resource execution.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, error: Option<String>) {
        self.attempts += 1;
        if error.is_some() {
            self.last_error = error;
        }
    }

    /// `max_retries` is the *total* number of attempts allowed (e.g. 3
    /// attempts for `maxRetries: 3`), so retry is allowed only while we are
    /// strictly below that count.
    pub fn should_retry(&self, max_retries: u32) -> bool {
        self.attempts < max_retries
    }
}

/// Parses a duration string like `"250ms"`, `"2s"`, `"1500"` (bare millis).
/// An unparseable string falls back to zero delay rather than propagating an
/// error — an unparseable delay should never abort a retry loop.
pub fn parse_delay(raw: &str) -> Duration {
    let raw = raw.trim();
    if raw.is_empty() {
        return Duration::ZERO;
    }
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse::<u64>().map(Duration::from_millis).unwrap_or(Duration::ZERO);
    }
    if let Some(secs) = raw.strip_suffix('s') {
        return secs
            .trim()
            .parse::<f64>()
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::ZERO);
    }
    if let Some(mins) = raw.strip_suffix('m') {
        return mins
            .trim()
            .parse::<f64>()
            .map(|m| Duration::from_secs_f64(m * 60.0))
            .unwrap_or(Duration::ZERO);
    }
    // bare number: treat as milliseconds
    raw.parse::<u64>().map(Duration::from_millis).unwrap_or(Duration::ZERO)
}
