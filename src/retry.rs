//! Retry with exponential backoff, shared by the fetcher and the extractor.

use std::thread::sleep;
use std::time::Duration;

use rand::random;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.max)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            random::<u64>() % jitter_ms
        };
        self.delay(retry) + Duration::from_millis(extra)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    /// The last error is returned on failure.
    pub fn run<T, E, F, P>(&self, label: &str, mut op: F, is_transient: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts && is_transient(&err) => {
                    let wait = self.jittered(attempt);
                    log::info!(
                        "{label}: retrying (attempt {}/{}) after error: {err}, backoff {}ms",
                        attempt + 1,
                        self.attempts,
                        wait.as_millis()
                    );
                    if !wait.is_zero() {
                        sleep(wait);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
