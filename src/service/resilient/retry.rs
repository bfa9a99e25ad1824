//! Retry with exponential backoff and optional jitter.
//!
//! Delay before retry `k` (1-based) is `base_delay * 2^(k-1)`, plus up to
//! `jitter` (at most 20%) of that delay at random:
//! - Retry 1: 1s
//! - Retry 2: 2s
//! - Retry 3: 4s
//!
//! Cancellation and deadline expiry are returned as-is and never retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{AnalysisError, Result};
use crate::service::context::RunContext;

/// Upper bound for the jitter fraction.
pub const MAX_JITTER: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Fraction of each delay added at random, clamped to `[0, MAX_JITTER]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            jitter: 0.1,
        }
    }
}

/// What happened while retrying a successful call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryStats {
    pub attempts: u32,
    /// Actual wait before each retry
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Nominal delay before retry `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let fraction = self.jitter.clamp(0.0, MAX_JITTER);
        if fraction <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=fraction);
        delay.saturating_add(delay.mul_f64(extra))
    }

    /// Run `operation` until it succeeds, attempts run out, or the context ends.
    ///
    /// Exhaustion yields `UpstreamCallFailed` embedding the last cause.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &RunContext,
        operation_name: &str,
        mut operation: F,
    ) -> Result<(T, RetryStats)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut stats = RetryStats::default();

        loop {
            ctx.check()?;
            stats.attempts += 1;

            let error = match ctx.run(operation()).await? {
                Ok(value) => {
                    if stats.attempts > 1 {
                        tracing::debug!(
                            "[RETRY] {} succeeded after {} retries",
                            operation_name,
                            stats.attempts - 1
                        );
                    }
                    return Ok((value, stats));
                }
                Err(e) => e,
            };

            if error.is_cancellation() {
                return Err(error);
            }

            let retry = stats.attempts;
            if retry > self.max_retries || !error.is_retryable() {
                tracing::warn!(
                    "[RETRY] {} failed after {} attempt(s): {}",
                    operation_name,
                    stats.attempts,
                    error
                );
                return Err(AnalysisError::UpstreamCallFailed {
                    operation: operation_name.to_string(),
                    attempts: stats.attempts,
                    source: Box::new(error),
                });
            }

            let delay = self.jittered(self.delay_for(retry));
            tracing::warn!(
                "[RETRY] {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                operation_name,
                stats.attempts,
                self.max_retries + 1,
                error,
                delay
            );
            ctx.sleep(delay).await?;
            stats.delays.push(delay);
        }
    }
}
