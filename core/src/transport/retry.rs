//! Bounded exponential backoff for transport sends.
//!
//! Two instances exist in practice: the *short* retry wrapped around
//! individual sends (a few quick attempts, then give up and let the
//! caller decide), and the *infinite* outer loop of the peer sender,
//! which reuses the same backoff arithmetic with no attempt cap.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Backoff knobs. Defaults: 3 attempts, 50ms doubling up to 1s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts before giving up. `0` means unbounded.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Ceiling for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 50,
            factor: 2.0,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Delay to sleep after a failed `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_delay_ms as f64 * exp) as u64;
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds or attempts are exhausted, sleeping
    /// the configured backoff between failures.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if self.max_attempts != 0 && attempt >= self.max_attempts {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after error: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_and_cap() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_millis(50));
        assert_eq!(config.delay_for(2), Duration::from_millis(100));
        assert_eq!(config.delay_for(3), Duration::from_millis(200));
        assert_eq!(config.delay_for(10), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 1,
            factor: 1.0,
            max_delay_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = config
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("fail {}", n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let config = RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
            factor: 1.0,
            max_delay_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = config
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("always".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
