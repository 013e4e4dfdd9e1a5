//! Exponential backoff for transient transport failures.

use std::future::Future;
use std::time::Duration;

use log::warn;

use crate::error::TransportError;

/// Attempts per request, including the first.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Backoff schedule: the delay after failed attempt `k` is
/// `base_delay × multiplier^k`, capped at `max_delay`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs.min(cap))
        } else {
            self.max_delay
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent. The last error is returned.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{what} failed (attempt {}/{attempts}): {e}; retrying in {delay:?}",
                    attempt + 1
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn delays_are_capped() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(10), Duration::from_secs(30));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn delays_never_decrease() {
        let p = RetryPolicy {
            multiplier: 1.7,
            ..RetryPolicy::default()
        };
        let delays: Vec<_> = (0..40).map(|k| p.delay_for(k)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }
}
