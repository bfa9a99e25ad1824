//! Resilient external-call client.
//!
//! Every network-bound collaborator goes through the same pipeline:
//! 1. Cache lookup (a hit skips everything else)
//! 2. Rate limiting (token bucket)
//! 3. The call itself, retried with exponential backoff
//! 4. Cache write of non-empty results
//!
//! `call_fanout` splits one logical request into sub-requests, runs them
//! concurrently with bounded parallelism and writes the merged result once.

mod cache;
mod limiter;
mod retry;

pub use cache::{CacheBackend, CacheKey, MemoryCache};
pub use limiter::{RateLimiter, TokenBucket};
pub use retry::{RetryPolicy, RetryStats, MAX_JITTER};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::{AnalysisError, Result};
use crate::service::context::RunContext;

/// Values the client can cache.
pub trait Cacheable: Serialize + DeserializeOwned + Send {
    /// Empty results are returned but never written to the cache.
    fn is_empty_result(&self) -> bool;
}

/// Results that can be assembled from independent partial results.
pub trait Mergeable: Sized {
    fn merge(&mut self, other: Self);
}

/// Value returned by a resilient call, with bookkeeping about how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome<T> {
    pub value: T,
    pub cached_result: bool,
    /// Underlying attempts made (0 on a cache hit)
    pub attempts: u32,
    /// Backoff waits before each retry
    pub backoff_delays: Vec<Duration>,
    /// Sub-requests that failed and were left out of a merged result
    pub failed_parts: Vec<String>,
}

impl<T> CallOutcome<T> {
    fn from_cache(value: T) -> Self {
        Self {
            value,
            cached_result: true,
            attempts: 0,
            backoff_delays: Vec::new(),
            failed_parts: Vec::new(),
        }
    }

    fn fresh(value: T, stats: RetryStats) -> Self {
        Self {
            value,
            cached_result: false,
            attempts: stats.attempts,
            backoff_delays: stats.delays,
            failed_parts: Vec::new(),
        }
    }

    /// Number of retries performed after the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Cache + rate-limit + retry wrapper around a single external call.
#[derive(Clone)]
pub struct ResilientClient {
    name: &'static str,
    cache: Option<Arc<dyn CacheBackend>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    retry: RetryPolicy,
    cache_ttl: Duration,
    default_timeout: Duration,
    max_parallel: usize,
}

impl ResilientClient {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cache: None,
            limiter: None,
            retry: RetryPolicy::default(),
            cache_ttl: Duration::from_secs(3600),
            default_timeout: Duration::from_secs(120),
            max_parallel: 4,
        }
    }

    /// Build a client from engine configuration. The cache is supplied by
    /// the caller so several clients can share one backend.
    pub fn from_config(
        name: &'static str,
        config: &EngineConfig,
        cache: Option<Arc<dyn CacheBackend>>,
    ) -> Result<Self> {
        let limiter = TokenBucket::new(
            config.rate_limit.requests_per_second,
            config.rate_limit.burst,
        )?;
        Ok(Self::new(name)
            .with_limiter(Arc::new(limiter))
            .with_retry(config.retry.policy())
            .with_cache_ttl(config.cache_ttl())
            .with_default_timeout(config.call_timeout())
            .with_max_parallel(config.max_parallel_requests)
            .with_optional_cache(cache))
    }

    pub fn with_cache(self, cache: Arc<dyn CacheBackend>) -> Self {
        self.with_optional_cache(Some(cache))
    }

    fn with_optional_cache(mut self, cache: Option<Arc<dyn CacheBackend>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Apply the default per-call timeout when the caller set no deadline.
    fn effective_context(&self, ctx: &RunContext) -> RunContext {
        match ctx.deadline() {
            Some(_) => ctx.clone(),
            None => ctx.with_timeout(self.default_timeout),
        }
    }

    async fn cache_lookup<T: Cacheable>(&self, key: &str) -> Option<T> {
        let cache = self.cache.as_ref()?;
        let raw = cache.get(key).await?;
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => {
                tracing::debug!("[RESILIENT] {} cache hit: {}", self.name, key);
                Some(value)
            }
            Err(e) => {
                tracing::warn!(
                    "[RESILIENT] {} ignoring unreadable cache entry {}: {}",
                    self.name,
                    key,
                    e
                );
                None
            }
        }
    }

    async fn cache_store<T: Cacheable>(&self, key: &str, value: &T) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if value.is_empty_result() {
            tracing::debug!("[RESILIENT] {} not caching empty result for {}", self.name, key);
            return;
        }
        match serde_json::to_string(value) {
            Ok(raw) => cache.set(key, raw, self.cache_ttl).await,
            Err(e) => tracing::warn!(
                "[RESILIENT] {} failed to serialize result for {}: {}",
                self.name,
                key,
                e
            ),
        }
    }

    /// Rate-limit then retry, with no cache involvement.
    async fn call_uncached<T, F, Fut>(
        &self,
        ctx: &RunContext,
        operation: &str,
        op: F,
    ) -> Result<(T, RetryStats)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(limiter) = &self.limiter {
            limiter.wait(ctx).await?;
        }
        self.retry.execute(ctx, operation, op).await
    }

    /// Run one external call through cache, rate limiter and retry policy.
    pub async fn call<T, F, Fut>(&self, ctx: &RunContext, key: &CacheKey, op: F) -> Result<CallOutcome<T>>
    where
        T: Cacheable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = self.effective_context(ctx);
        let key_str = key.to_string();

        if let Some(value) = self.cache_lookup::<T>(&key_str).await {
            return Ok(CallOutcome::from_cache(value));
        }

        let operation = format!("{}:{}", self.name, key.operation());
        let (value, stats) = self.call_uncached(&ctx, &operation, op).await?;
        self.cache_store(&key_str, &value).await;

        Ok(CallOutcome::fresh(value, stats))
    }

    /// Split a logical request into `parts`, call each concurrently (at most
    /// `max_parallel` in flight) and merge the results.
    ///
    /// Failed parts are left out and listed in `failed_parts`; the merged
    /// value is cached under `key` only when every part succeeded. If all
    /// parts fail the first error is returned. Cancellation aborts the whole
    /// fan-out.
    pub async fn call_fanout<T, P, F, Fut>(
        &self,
        ctx: &RunContext,
        key: &CacheKey,
        parts: Vec<P>,
        op: F,
    ) -> Result<CallOutcome<T>>
    where
        T: Cacheable + Mergeable,
        P: ToString + Clone,
        F: Fn(P) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = self.effective_context(ctx);
        let key_str = key.to_string();

        if let Some(value) = self.cache_lookup::<T>(&key_str).await {
            return Ok(CallOutcome::from_cache(value));
        }
        if parts.is_empty() {
            return Err(AnalysisError::Config(format!(
                "{}: fan-out request '{}' has no parts",
                self.name, key_str
            )));
        }

        let total = parts.len();
        tracing::debug!(
            "[RESILIENT] {} fanning out {} parts for {} (max {} in flight)",
            self.name,
            total,
            key_str,
            self.max_parallel
        );

        let op = &op;
        let ctx_ref = &ctx;
        let outcomes: Vec<(String, Result<(T, RetryStats)>)> = stream::iter(parts)
            .map(|part| async move {
                let label = part.to_string();
                let operation = format!("{}:{}:{}", self.name, key.operation(), label);
                let result = self
                    .call_uncached(ctx_ref, &operation, || op(part.clone()))
                    .await;
                (label, result)
            })
            .buffered(self.max_parallel)
            .collect()
            .await;

        let mut merged: Option<T> = None;
        let mut attempts = 0;
        let mut delays = Vec::new();
        let mut failed_parts = Vec::new();
        let mut first_error = None;

        // buffered() keeps submission order, so "first non-empty wins"
        // follows the order parts were given in
        for (label, result) in outcomes {
            match result {
                Ok((value, stats)) => {
                    attempts += stats.attempts;
                    delays.extend(stats.delays);
                    match merged.as_mut() {
                        Some(acc) => acc.merge(value),
                        None => merged = Some(value),
                    }
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!("[RESILIENT] {} part '{}' failed: {}", self.name, label, e);
                    failed_parts.push(label);
                    first_error.get_or_insert(e);
                }
            }
        }

        let Some(value) = merged else {
            return Err(first_error
                .unwrap_or_else(|| AnalysisError::other("fan-out produced no results")));
        };

        if failed_parts.is_empty() {
            self.cache_store(&key_str, &value).await;
        } else {
            tracing::warn!(
                "[RESILIENT] {} returning partial result for {} ({}/{} parts failed), not caching",
                self.name,
                key_str,
                failed_parts.len(),
                total
            );
        }

        Ok(CallOutcome {
            value,
            cached_result: false,
            attempts,
            backoff_delays: delays,
            failed_parts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        scores: BTreeMap<String, f64>,
        notes: Vec<String>,
        version: String,
    }

    impl Cacheable for Payload {
        fn is_empty_result(&self) -> bool {
            self.scores.is_empty() && self.notes.is_empty()
        }
    }

    impl Mergeable for Payload {
        fn merge(&mut self, other: Self) {
            self.scores.extend(other.scores);
            self.notes.extend(other.notes);
            if self.version.is_empty() {
                self.version = other.version;
            }
        }
    }

    fn payload(category: &str, score: f64, version: &str) -> Payload {
        Payload {
            scores: BTreeMap::from([(category.to_string(), score)]),
            notes: vec![format!("{} checked", category)],
            version: version.to_string(),
        }
    }

    fn client() -> (ResilientClient, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let client = ResilientClient::new("test")
            .with_cache(cache.clone())
            .with_retry(RetryPolicy::new(3, Duration::from_secs(1)));
        (client, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn second_identical_call_is_served_from_cache() {
        let (client, _cache) = client();
        let ctx = RunContext::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let key = CacheKey::new("audit", "https://example.com").with("category", "seo");

        let first = client
            .call(&ctx, &key, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(payload("seo", 91.0, "12.0"))
            })
            .await
            .unwrap();
        let same_key = CacheKey::new("audit", "https://example.com/").with("category", "seo");
        let second = client
            .call(&ctx, &same_key, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(payload("seo", 0.0, "other"))
            })
            .await
            .unwrap();

        assert!(!first.cached_result);
        assert!(second.cached_result);
        assert_eq!(first.value, second.value);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success_is_cached_with_one_retry() {
        let (client, cache) = client();
        let ctx = RunContext::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let key = CacheKey::new("audit", "https://example.com");

        let outcome = client
            .call(&ctx, &key, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AnalysisError::other("502 Bad Gateway"))
                } else {
                    Ok(payload("performance", 77.0, "12.0"))
                }
            })
            .await
            .unwrap();

        assert!(!outcome.cached_result);
        assert_eq!(outcome.retries(), 1);
        assert_eq!(outcome.backoff_delays, vec![Duration::from_secs(1)]);
        assert!(cache.get(&key.to_string()).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_cache_entry_is_a_miss() {
        let (client, cache) = client();
        let ctx = RunContext::new();
        let key = CacheKey::new("audit", "https://example.com");
        cache
            .set(&key.to_string(), "{not json".into(), Duration::from_secs(60))
            .await;

        let outcome = client
            .call(&ctx, &key, || async { Ok(payload("seo", 50.0, "1")) })
            .await
            .unwrap();

        assert!(!outcome.cached_result);
        assert_eq!(outcome.value.scores["seo"], 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_results_are_not_cached() {
        let (client, cache) = client();
        let ctx = RunContext::new();
        let key = CacheKey::new("audit", "https://example.com");

        client
            .call(&ctx, &key, || async {
                Ok(Payload {
                    scores: BTreeMap::new(),
                    notes: vec![],
                    version: "1".into(),
                })
            })
            .await
            .unwrap();

        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_wrap_last_cause() {
        let (client, _) = client();
        let ctx = RunContext::new();
        let key = CacheKey::new("audit", "https://example.com");

        let err = client
            .call::<Payload, _, _>(&ctx, &key, || async {
                Err(AnalysisError::other("still down"))
            })
            .await
            .unwrap_err();

        match err {
            AnalysisError::UpstreamCallFailed { attempts, source, .. } => {
                assert_eq!(attempts, 4);
                assert!(source.to_string().contains("still down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeout_applies_without_deadline() {
        let client = ResilientClient::new("slow")
            .with_retry(RetryPolicy::new(0, Duration::from_millis(10)))
            .with_default_timeout(Duration::from_secs(5));
        let ctx = RunContext::new();
        let key = CacheKey::new("audit", "https://example.com");

        let err = client
            .call::<Payload, _, _>(&ctx, &key, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(payload("seo", 1.0, "1"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AnalysisError::Timeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn fanout_merges_parts_and_writes_cache_once() {
        let (client, cache) = client();
        let client = client.with_max_parallel(2);
        let ctx = RunContext::new();
        let key = CacheKey::new("audit", "https://example.com").with("categories", "a,b,c");
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let outcome = client
            .call_fanout(&ctx, &key, vec!["a", "b", "c"], |part| {
                let in_flight = &in_flight;
                let peak = &peak;
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let version = if part == "a" { "" } else { part };
                    Ok(payload(part, 10.0, version))
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value.scores.len(), 3);
        assert_eq!(outcome.value.notes.len(), 3);
        assert_eq!(outcome.value.version, "b");
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key.to_string()).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn fanout_partial_failure_is_returned_but_not_cached() {
        let (client, cache) = client();
        let client = client.with_retry(RetryPolicy::new(0, Duration::from_millis(1)));
        let ctx = RunContext::new();
        let key = CacheKey::new("audit", "https://example.com");

        let outcome = client
            .call_fanout(&ctx, &key, vec!["ok", "broken"], |part| async move {
                if part == "broken" {
                    Err(AnalysisError::other("category unavailable"))
                } else {
                    Ok(payload(part, 88.0, "1"))
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.failed_parts, vec!["broken".to_string()]);
        assert_eq!(outcome.value.scores.len(), 1);
        assert!(cache.is_empty());
    }
}
