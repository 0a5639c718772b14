//! Bounded exponential backoff for the submission step.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RetryPolicy;

const JITTER_FACTOR: f64 = 0.3;

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * multiplier)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }

    pub fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let mut rng = rand::rng();
        let jitter_range = delay.as_secs_f64() * JITTER_FACTOR;
        let jitter = rng.random_range(-jitter_range / 2.0..=jitter_range / 2.0);
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }
}

/// Run `operation` until it succeeds or the policy's retries are used up.
///
/// `retryable` decides whether a given error is worth another attempt; the
/// last error is returned when it is not or when retries run out.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    context: &str,
    retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt > policy.max_retries || !retryable(&err) {
                    warn!("{} failed after {} attempt(s): {}", context, attempt, err);
                    return Err(err);
                }

                let delay = policy.apply_jitter(policy.calculate_delay(attempt));
                info!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    context,
                    attempt,
                    policy.max_retries + 1,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
