//! Cancellation and deadline propagation for a run.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AnalysisError, Result};

/// Stand-in for "never" when a duration does not fit on the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + duration`, saturating at [`FAR_FUTURE`] instead of overflowing.
pub(crate) fn instant_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Cancellation token plus an optional deadline, threaded through a whole
/// run and every call it makes.
///
/// Cloning shares the token; [`RunContext::with_timeout`] derives a context
/// whose deadline is the earlier of the parent's and the new one.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    budget: Duration,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            budget: Duration::ZERO,
        }
    }

    /// Derive a context that also expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = instant_after(timeout);
        match self.deadline {
            Some(existing) if existing <= candidate => self.clone(),
            _ => Self {
                token: self.token.clone(),
                deadline: Some(candidate),
                budget: timeout,
            },
        }
    }

    /// Same token, cancelled together with the parent but also on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            budget: self.budget,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Err(Cancelled)` or `Err(Timeout)` once the context is done.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(self.timeout_error()),
            _ => Ok(()),
        }
    }

    /// Drive `future` until it finishes or the context is cancelled/expires.
    pub async fn run<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.check()?;
        let deadline = self.deadline;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AnalysisError::Cancelled),
            _ = sleep_until_opt(deadline) => Err(self.timeout_error()),
            out = future => Ok(out),
        }
    }

    /// Interruptible sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(tokio::time::sleep(duration)).await
    }

    fn timeout_error(&self) -> AnalysisError {
        AnalysisError::Timeout(self.budget)
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn run_times_out_at_deadline() {
        let ctx = RunContext::new().with_timeout(Duration::from_secs(2));
        let start = Instant::now();

        let err = ctx
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await
            .unwrap_err();

        assert!(matches!(err, AnalysisError::Timeout(d) if d == Duration::from_secs(2)));
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = RunContext::new();
        ctx.cancel();

        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(AnalysisError::Cancelled)));
        let err = ctx.run(async { 1 }).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_keeps_earlier_deadline() {
        let outer = RunContext::new().with_timeout(Duration::from_secs(1));
        let inner = outer.with_timeout(Duration::from_secs(30));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_timeout_saturates_instead_of_overflowing() {
        let ctx = RunContext::new().with_timeout(Duration::from_secs(u64::MAX));

        assert!(ctx.deadline().is_some());
        assert!(ctx.check().is_ok());
        assert_eq!(ctx.run(async { 3 }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn child_follows_parent_cancellation() {
        let parent = RunContext::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
