//! Token-bucket rate limiting for outbound calls.
//!
//! The bucket starts full (`burst` tokens) and refills continuously at
//! `rate` tokens per second. `wait` blocks until a token is available or the
//! caller's context ends.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{AnalysisError, Result};
use crate::service::context::RunContext;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Block until a token is granted. Cancellation or deadline expiry while
    /// waiting yields `RateLimitExceeded` wrapping the cause.
    async fn wait(&self, ctx: &RunContext) -> Result<()>;
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Result<Self> {
        if !(rate_per_sec.is_finite() && rate_per_sec > 0.0) {
            return Err(AnalysisError::Config(format!(
                "rate limit must be positive, got {}",
                rate_per_sec
            )));
        }
        let burst = burst.max(1);
        tracing::debug!(
            "[LIMITER] Token bucket initialized: rate={}/s, burst={}",
            rate_per_sec,
            burst
        );
        Ok(Self {
            rate_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Time to earn one token.
    pub fn token_interval(&self) -> Duration {
        self.time_for(1.0)
    }

    /// Time to earn `tokens`, saturating for rates too slow to represent.
    fn time_for(&self, tokens: f64) -> Duration {
        Duration::try_from_secs_f64(tokens / self.rate_per_sec).unwrap_or(Duration::MAX)
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Take a token without waiting; on failure returns how long until one
    /// becomes available.
    pub async fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.rate_per_sec).min(self.burst as f64);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(self.time_for(missing))
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn wait(&self, ctx: &RunContext) -> Result<()> {
        loop {
            match self.try_acquire().await {
                Ok(()) => return Ok(()),
                Err(delay) => {
                    tracing::trace!("[LIMITER] No token available, waiting {:?}", delay);
                    ctx.sleep(delay)
                        .await
                        .map_err(|cause| AnalysisError::RateLimitExceeded(Box::new(cause)))?;
                }
            }
        }
    }
}
