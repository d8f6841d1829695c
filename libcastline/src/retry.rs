//! Retry and backoff policies
//!
//! Two separate mechanisms share this module:
//! - [`RetryPolicy`] retries transient publisher errors inside one sweep.
//! - [`RequeuePolicy`] moves failed casts back to `scheduled` on a later sweep.

use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::error::PublishError;
use crate::publisher::Publisher;
use crate::types::PublishRequest;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: true,
        }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) failed
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(2_u32.pow(exp))
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
            delay + Duration::from_millis(extra)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Publish with a per-call timeout, retrying transient errors.
///
/// Timeouts are not retried: the network may have accepted the cast, and a
/// second call could post it twice.
pub async fn publish_with_retry(
    publisher: &dyn Publisher,
    request: &PublishRequest,
    call_timeout: Duration,
    policy: &RetryPolicy,
) -> Result<String, PublishError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = match timeout(call_timeout, publisher.publish(request)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(call_timeout.as_secs())),
        };

        match result {
            Ok(hash) => {
                if attempt > 1 {
                    info!(cast_id = %request.cast_id, attempt, "Published after retry");
                }
                return Ok(hash);
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    cast_id = %request.cast_id,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Transient publish error, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    warn!(cast_id = %request.cast_id, attempts = attempt, error = %e, "Giving up on cast");
                }
                return Err(e);
            }
        }
    }
}

/// Backoff for automatic requeue of failed casts
#[derive(Debug, Clone)]
pub struct RequeuePolicy {
    pub enabled: bool,
    /// Casts that have failed this many times stay failed
    pub max_requeues: i64,
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
}

impl RequeuePolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            enabled: config.auto_requeue,
            max_requeues: config.max_requeues,
            base_delay_secs: i64::try_from(config.requeue_base_delay).unwrap_or(i64::MAX),
            max_delay_secs: i64::try_from(config.requeue_max_delay).unwrap_or(i64::MAX),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::from_config(&RetryConfig::default())
        }
    }

    /// `base * 2^(n-1)` capped at `max`, for a cast that has failed `n` times
    pub fn backoff_secs(&self, retry_count: i64) -> i64 {
        let exp = (retry_count.max(1) - 1).min(62) as u32;
        self.base_delay_secs
            .saturating_mul(2_i64.saturating_pow(exp))
            .min(self.max_delay_secs)
    }

    /// When a failed cast should next be attempted. Always strictly after `now`.
    pub fn next_attempt_at(&self, failed_at: i64, retry_count: i64, now: i64) -> i64 {
        failed_at
            .saturating_add(self.backoff_secs(retry_count))
            .max(now + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::mock::{MockOutcome, MockPublisher};
    use secrecy::SecretString;

    fn request() -> PublishRequest {
        PublishRequest {
            cast_id: "c1".into(),
            signer_token: SecretString::from("s".to_string()),
            content: "gm".into(),
            embeds: Vec::new(),
            channel_id: None,
            parent_hash: None,
            idempotency_key: "c1".into(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            jitter: false,
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(3));
        assert_eq!(policy.delay_after(10), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..50 {
            let delay = policy.delay_after(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let publisher = MockPublisher::scripted(vec![
            MockOutcome::Fail(PublishError::Network("reset".into())),
            MockOutcome::Succeed("0xok".into()),
        ]);

        let hash = publish_with_retry(&publisher, &request(), Duration::from_secs(1), &fast_policy(3))
            .await
            .unwrap();
        assert_eq!(hash, "0xok");
        assert_eq!(publisher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let publisher = MockPublisher::failing(PublishError::Rejected("too long".into()));

        let err = publish_with_retry(&publisher, &request(), Duration::from_secs(1), &fast_policy(3))
            .await
            .unwrap_err();
        assert_eq!(err, PublishError::Rejected("too long".into()));
        assert_eq!(publisher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let publisher = MockPublisher::failing(PublishError::RateLimited("slow down".into()));

        let err = publish_with_retry(&publisher, &request(), Duration::from_secs(1), &fast_policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::RateLimited(_)));
        assert_eq!(publisher.call_count(), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_failure_and_not_retried() {
        let publisher = MockPublisher::hanging();

        let err = publish_with_retry(
            &publisher,
            &request(),
            Duration::from_millis(20),
            &fast_policy(3),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PublishError::Timeout(_)));
        assert_eq!(publisher.call_count(), 1);
    }

    #[test]
    fn test_requeue_backoff() {
        let policy = RequeuePolicy {
            enabled: true,
            max_requeues: 3,
            base_delay_secs: 300,
            max_delay_secs: 1000,
        };
        assert_eq!(policy.backoff_secs(0), 300);
        assert_eq!(policy.backoff_secs(1), 300);
        assert_eq!(policy.backoff_secs(2), 600);
        assert_eq!(policy.backoff_secs(3), 1000);
        assert_eq!(policy.backoff_secs(i64::MAX), 1000);
    }

    #[test]
    fn test_next_attempt_is_strictly_future() {
        let policy = RequeuePolicy {
            enabled: true,
            max_requeues: 3,
            base_delay_secs: 300,
            max_delay_secs: 3600,
        };
        assert_eq!(policy.next_attempt_at(1000, 1, 1000), 1300);
        // Backoff already elapsed
        assert_eq!(policy.next_attempt_at(1000, 1, 5000), 5001);
    }

    #[test]
    fn test_policies_from_default_config() {
        let config = RetryConfig::default();
        let retry = RetryPolicy::from_config(&config);
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(1));

        let requeue = RequeuePolicy::from_config(&config);
        assert!(!requeue.enabled);
        assert!(!RequeuePolicy::disabled().enabled);
    }
}
