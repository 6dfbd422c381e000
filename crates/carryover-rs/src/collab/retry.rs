//! Retry policy for collaborator calls.
//!
//! Summarization and enrichment already degrade gracefully, so the retry
//! budget is small: transient upstream failures (rate limits, gateway
//! errors, network resets) get a couple of backoff attempts before the
//! caller falls back; permanent failures (bad request, auth) fail at once.

use std::time::Duration;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = fail immediately).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling on the per-attempt delay.
    pub max_delay: Duration,
    /// Backoff multiplier between attempts.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config with a specific retry count and default backoff.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Delay for a 0-indexed attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

/// Whether an error string indicates a transient, retry-worthy failure.
pub fn is_transient_error(error: &str) -> bool {
    if ["429", "500", "502", "503", "504"]
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }
    let lower = error.to_lowercase();
    [
        "request failed:",
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let config = RetryConfig::with_retries(10);
        let d0 = config.delay_for_attempt(0);
        let d2 = config.delay_for_attempt(2);
        let d10 = config.delay_for_attempt(10);
        assert!(d2 > d0);
        assert!(d10 <= config.max_delay);
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient_error("summarizer API HTTP 429: rate limited"));
        assert!(is_transient_error("request failed: connection reset by peer"));
        assert!(is_transient_error("operation timed out"));
        assert!(!is_transient_error("summarizer API HTTP 400: bad request"));
        assert!(!is_transient_error("refinement shape mismatch"));
    }
}
