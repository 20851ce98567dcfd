//! Bounded retry with exponential backoff for idempotent collaborator calls.
//!
//! Only reads (identity validation, balance lookups, connection tests) and
//! calls that are idempotent by construction (event delivery keyed by `seq`)
//! go through here. Mutating calls such as storing a credential are issued once
//! and their failure is surfaced to the caller.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Errors that know whether a repeat attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Retry schedule: `base_delay * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(2),
        }
    }

    /// Delay to wait before attempt number `attempt` (0-based; attempt 0 has no delay).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up. Returns the last error in the latter cases.
pub async fn retry_idempotent<T, E, F, Fut>(policy: RetryPolicy, desc: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let delay = policy.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                warn!(
                    call = desc,
                    attempt = attempt + 1,
                    error = %e,
                    "Transient collaborator failure, will retry"
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
