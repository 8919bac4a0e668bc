//! Bounded retry with exponential backoff.
//!
//! Shared by source fetches and enrichment calls; each side owns its own
//! `RetryPolicy` instance.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EnrichmentError, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn sanitized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            self.multiplier = 1.0;
        }
        self.max_delay_ms = self.max_delay_ms.max(self.base_delay_ms);
        self
    }

    /// Delay before attempt `failed_attempt + 1`. A server hint wins when larger.
    pub fn backoff(&self, failed_attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(30) as i32;
        let ms = (self.base_delay_ms as f64 * self.multiplier.powi(exp))
            .min(self.max_delay_ms as f64)
            .max(0.0) as u64;
        let computed = Duration::from_millis(ms);
        match hint {
            Some(h) if h > computed => h.min(Duration::from_millis(self.max_delay_ms)),
            _ => computed,
        }
    }
}

/// Error types that carry their own retry classification.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
    fn retry_after(&self) -> Option<Duration>;
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        SourceError::is_retryable(self)
    }
    fn retry_after(&self) -> Option<Duration> {
        SourceError::retry_after(self)
    }
}

impl Retryable for EnrichmentError {
    fn is_retryable(&self) -> bool {
        EnrichmentError::is_retryable(self)
    }
    fn retry_after(&self) -> Option<Duration> {
        EnrichmentError::retry_after(self)
    }
}

/// Run `op` until it succeeds, hits a fatal error, or runs out of attempts.
/// `on_attempt` is told the 1-based number of every attempt before it starts.
pub async fn retry_with<T, E, F, Fut, A>(
    policy: &RetryPolicy,
    mut on_attempt: A,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    A: FnMut(u32),
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        on_attempt(attempt);
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let wait = policy.backoff(attempt, e.retry_after());
                tracing::debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying after backoff");
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 350,
        };
        assert_eq!(p.backoff(1, None), Duration::from_millis(100));
        assert_eq!(p.backoff(2, None), Duration::from_millis(200));
        assert_eq!(p.backoff(3, None), Duration::from_millis(350));
    }

    #[test]
    fn larger_hint_wins() {
        let p = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(
            p.backoff(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            p.backoff(1, Some(Duration::from_millis(10))),
            Duration::from_millis(100)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::new(5, Duration::from_millis(10));
        let out: Result<(), SourceError> = retry_with(&p, |_| {}, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::AuthFailed("bad cookie".into())) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_error_stops_at_cap() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::new(3, Duration::from_millis(10));
        let out: Result<(), EnrichmentError> = retry_with(&p, |_| {}, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EnrichmentError::Timeout) }
        })
        .await;
        assert_eq!(out, Err(EnrichmentError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
