//! Retry helpers shared by the runner.
//!
//! - [`ReconnectPolicy`] describes a bounded exponential backoff schedule
//!   (attempt count, base delay, multiplier) and is driven by whichever loop
//!   owns the connection.
//! - [`retry_until_deadline`] retries an operation at a fixed interval until
//!   it succeeds or a wall-clock budget is spent.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

/// Bounded exponential backoff used when a persistent connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before reconnect attempt number `attempt` (zero based),
    /// or `None` once the attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }

    #[cfg(test)]
    /// Sum of every delay the policy will ever wait.
    pub fn total_budget(&self) -> Duration {
        (0..self.max_attempts)
            .filter_map(|attempt| self.delay_for(attempt))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}

/// Retry an async operation until it succeeds or the deadline is reached.
///
/// Each attempt only gets the time left before the deadline, so a hung
/// attempt cannot outlive the budget. Errors for which `is_retryable`
/// returns false are returned immediately. The last error is folded into
/// the timeout error so callers can surface why delivery never succeeded.
pub async fn retry_until_deadline<T, F, Fut, R>(
    timeout: Duration,
    poll_interval: Duration,
    description: &str,
    mut attempt: F,
    mut is_retryable: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    R: FnMut(&anyhow::Error) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempts: u32 = 0;
    let mut last_err: Option<anyhow::Error> = None;

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            anyhow::bail!(
                "Timeout {} after {:?} ({} attempts): {}",
                description,
                timeout,
                attempts,
                last_err.as_ref().map(|e| e.to_string()).unwrap_or_default()
            );
        }

        attempts += 1;
        let result = match tokio::time::timeout(deadline - now, attempt()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("attempt {} did not finish in time", attempts)),
        };
        match result {
            Ok(val) => return Ok(val),
            Err(e) if !is_retryable(&e) => {
                warn!(error = %e, description = %description, "Attempt failed, not retrying");
                return Err(e);
            }
            Err(e) => {
                if attempts == 1 {
                    warn!(error = %e, description = %description, "Attempt failed, retrying until deadline");
                } else {
                    debug!(error = %e, attempts, description = %description, "Attempt failed, retrying...");
                }
                last_err = Some(e);
            }
        }

        tokio::time::sleep(poll_interval).await;
    }
}
