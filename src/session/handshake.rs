use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

/// Bounded exponential backoff for enforcer calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles on every further retry
    pub retry_interval: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.retry_interval.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

/// Run `op` until it succeeds or the retry ceiling is reached
pub async fn with_retry<F, Fut>(policy: &RetryPolicy, action: &str, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut retries = 0;

    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                retries += 1;
                if retries > policy.max_retries {
                    return Err(e.context(format!(
                        "{} failed after {} retries",
                        action, policy.max_retries
                    )));
                }

                let backoff = policy.backoff(retries);
                warn!(
                    "{} failed (attempt {}/{}): {:#}",
                    action,
                    retries,
                    policy.max_retries + 1,
                    e
                );
                info!("Retrying in {:?}...", backoff);
                sleep(backoff).await;
            }
        }
    }
}

/// Retry `op` within a maximum dwell time.
///
/// Returns a description of the failure when retries run out or the dwell
/// time is exceeded.
pub async fn handshake<F, Fut>(
    policy: &RetryPolicy,
    dwell: Duration,
    action: &str,
    op: F,
) -> std::result::Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match timeout(dwell, with_retry(policy, action, op)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!("{} did not complete within {:?}", action, dwell)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            retry_interval: Duration::from_secs(2),
            max_retries,
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = policy(5);
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = with_retry(&policy(3), "grant", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("controller busy");
                }
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_ceiling() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let err = with_retry(&policy(2), "revoke", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("controller down")
            }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(format!("{:#}", err).contains("revoke failed after 2 retries"));
        assert!(format!("{:#}", err).contains("controller down"));
    }

    #[tokio::test(start_paused = true)]
    async fn dwell_time_bounds_handshake() {
        let err = handshake(&policy(10), Duration::from_secs(5), "grant", || async {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(err.contains("grant did not complete"));
    }
}
