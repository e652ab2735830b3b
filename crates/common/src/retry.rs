//! Bounded retry for outbound HTTP
//!
//! Only transient failures (connect errors, timeouts, 5xx) are repeated, and
//! never more than `max_attempts` times.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::Settings;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// Upper bound of the random extra wait added to each delay
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_http_retries.max(1),
            delay: settings.http_retry_delay(),
            jitter: settings.http_retry_delay() * 2,
        }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.delay + Duration::from_millis(extra)
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget is spent.
pub async fn with_retries<F, Fut, T>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let wait = policy.delay_for_attempt();
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, policy.max_attempts, e, wait
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
            jitter: Duration::ZERO,
        }
    }

    fn unavailable() -> Error {
        Error::ControlPlane {
            endpoint: "status".into(),
            status: 503,
            message: "down".into(),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retries(&policy(5), "status", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(unavailable())
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retries(&policy(3), "status", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(unavailable())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retries(&policy(5), "status", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::RunFailed("nope".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
        };
        for _ in 0..20 {
            let d = policy.delay_for_attempt();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }
}
