//! Retry policy for control plane calls

use crate::config::RetryConfig;
use crate::error::ProvisionError;
use crate::observability::EngineMetrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
    pub call_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            jitter: config.jitter(),
            call_timeout: config.call_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after failed attempt `attempt` (1-based),
    /// without jitter: `initial * 2^(attempt-1)`, capped at `max_backoff`
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let backoff = self.initial_backoff.saturating_mul(1u32 << exponent);
        backoff.min(self.max_backoff)
    }

    /// Base backoff plus uniform jitter in `[0, jitter)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.base_backoff(attempt) + jitter
    }

    /// Run `call` until it succeeds, fails permanently or attempts run out.
    ///
    /// Every attempt is bounded by `call_timeout`; a timeout counts as a
    /// transient failure of that attempt. Returns the attempts made.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        metrics: &EngineMetrics,
        mut call: F,
    ) -> (Result<T, ProvisionError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProvisionError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProvisionError::transient(format!(
                    "{} timed out after {:?}",
                    operation, self.call_timeout
                ))),
            };

            match result {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation = %operation,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient control plane failure, retrying"
                    );
                    metrics.inc_provisioning_retries();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(1000),
            jitter: Duration::from_millis(50),
            call_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.base_backoff(1), Duration::from_millis(200));
        assert_eq!(p.base_backoff(2), Duration::from_millis(400));
        assert_eq!(p.base_backoff(3), Duration::from_millis(800));
        assert_eq!(p.base_backoff(4), Duration::from_millis(1000));
        assert_eq!(p.base_backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let p = policy();
        for _ in 0..50 {
            let b = p.backoff(1);
            assert!(b >= Duration::from_millis(200) && b < Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let (result, attempts) = policy()
            .run("provision", &EngineMetrics::new(), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProvisionError::transient("throttled"))
                } else {
                    Ok("i-1")
                }
            })
            .await;
        assert_eq!(result, Ok("i-1"));
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_not_retried() {
        let calls = &AtomicU32::new(0);
        let (result, attempts) = policy()
            .run("provision", &EngineMetrics::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProvisionError::permanent("quota exceeded"))
            })
            .await;
        assert!(!result.unwrap_err().is_transient());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_attempts() {
        let (result, attempts) = policy()
            .run("verify", &EngineMetrics::new(), || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().message.contains("timed out"));
        assert_eq!(attempts, 4);
    }
}
