//! Integration tests for the resilient external-call client.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use seoinsikt_engine::config::EngineConfig;
use seoinsikt_engine::error::AnalysisError;
use seoinsikt_engine::service::resilient::{
    CacheBackend, CacheKey, Cacheable, MemoryCache, ResilientClient, RetryPolicy, TokenBucket,
};
use seoinsikt_engine::service::RunContext;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Audit {
    url: String,
    score: f64,
}

impl Cacheable for Audit {
    fn is_empty_result(&self) -> bool {
        self.url.is_empty()
    }
}

fn audit(url: &str, score: f64) -> Audit {
    Audit {
        url: url.to_string(),
        score,
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried_then_cached() {
    let cache = Arc::new(MemoryCache::new());
    let client = ResilientClient::new("pagespeed")
        .with_cache(cache.clone())
        .with_retry(RetryPolicy::new(3, Duration::from_secs(1)));
    let key = CacheKey::new("audit", "https://example.com/");
    let calls = AtomicU32::new(0);
    let calls = &calls;
    let ctx = RunContext::new();

    let start = Instant::now();
    let first = client
        .call(&ctx, &key, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AnalysisError::other("503 Service Unavailable"))
            } else {
                Ok(audit("https://example.com/", 0.92))
            }
        })
        .await
        .unwrap();

    assert_eq!(first.value, audit("https://example.com/", 0.92));
    assert_eq!(first.attempts, 2);
    assert_eq!(first.backoff_delays, vec![Duration::from_secs(1)]);
    assert!(!first.cached_result);
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(cache.len(), 1);

    let second = client
        .call(&ctx, &key, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(audit("https://example.com/", 0.10))
        })
        .await
        .unwrap();

    assert!(second.cached_result);
    assert_eq!(second.value.score, 0.92);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_equivalent_urls_share_a_cache_entry() {
    let cache = Arc::new(MemoryCache::new());
    let client = ResilientClient::new("pagespeed").with_cache(cache.clone());
    let ctx = RunContext::new();

    client
        .call(&ctx, &CacheKey::new("audit", "https://Example.com").with("strategy", "mobile"), || async {
            Ok(audit("https://example.com/", 0.5))
        })
        .await
        .unwrap();

    let again = client
        .call(&ctx, &CacheKey::new("audit", "https://example.com/").with("strategy", "mobile"), || async {
            Ok(audit("https://example.com/", 0.9))
        })
        .await
        .unwrap();

    assert!(again.cached_result);
    assert_eq!(again.value.score, 0.5);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spaces_calls_beyond_burst() {
    let client = ResilientClient::new("pagespeed").with_limiter(Arc::new(TokenBucket::new(2.0, 1).unwrap()));
    let ctx = RunContext::new();
    let start = Instant::now();

    for i in 0..3 {
        let key = CacheKey::new("audit", &format!("https://example.com/{}", i));
        client
            .call(&ctx, &key, || async { Ok(audit("https://example.com/", 1.0)) })
            .await
            .unwrap();
    }

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(990), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_rate_limit_wait_is_reported() {
    let client = ResilientClient::new("pagespeed").with_limiter(Arc::new(TokenBucket::new(0.1, 1).unwrap()));
    let ctx = RunContext::new();
    client
        .call(&ctx, &CacheKey::new("audit", "https://example.com/a"), || async {
            Ok(audit("https://example.com/a", 1.0))
        })
        .await
        .unwrap();

    let canceller = {
        let ctx = ctx.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ctx.cancel();
        }
    };
    let key_b = CacheKey::new("audit", "https://example.com/b");
    let call = client.call(&ctx, &key_b, || async {
        Ok(audit("https://example.com/b", 1.0))
    });
    let (outcome, ()) = tokio::join!(call, canceller);

    let err = outcome.unwrap_err();
    assert!(matches!(err, AnalysisError::RateLimitExceeded(_)), "got {:?}", err);
    assert!(err.is_cancellation());
}

#[tokio::test(start_paused = true)]
async fn test_client_from_config_applies_settings() {
    let config = EngineConfig::from_json_str(
        r#"{ "retry": { "max_retries": 1, "base_delay_ms": 200, "jitter": 0.5 }, "call_timeout_secs": 5 }"#,
    )
    .unwrap();
    let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
    let client = ResilientClient::from_config("pagespeed", &config, Some(cache)).unwrap();

    assert_eq!(client.retry_policy().max_retries, 1);
    assert_eq!(client.retry_policy().base_delay, Duration::from_millis(200));
    assert!(client.retry_policy().jitter <= 0.2);

    let err = client
        .call(&RunContext::new(), &CacheKey::new("audit", "https://slow.example.com/"), || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(audit("https://slow.example.com/", 1.0))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Timeout(d) if d == Duration::from_secs(5)));
}

#[tokio::test(start_paused = true)]
async fn test_extreme_config_values_do_not_overflow() {
    let config = EngineConfig::from_json_str(&format!(
        r#"{{ "call_timeout_secs": {max}, "cache_ttl_secs": {max}, "rate_limit": {{ "requests_per_second": 1e-300, "burst": 1 }} }}"#,
        max = u64::MAX
    ))
    .unwrap();
    let cache = Arc::new(MemoryCache::new());
    let client = ResilientClient::from_config("pagespeed", &config, Some(cache.clone())).unwrap();
    let ctx = RunContext::new();
    let key = CacheKey::new("audit", "https://example.com/");

    let first = client
        .call(&ctx, &key, || async { Ok(audit("https://example.com/", 0.7)) })
        .await
        .unwrap();
    assert!(!first.cached_result);
    assert_eq!(cache.len(), 1);

    let again = client
        .call(&ctx, &key, || async { Ok(audit("https://example.com/", 0.1)) })
        .await
        .unwrap();
    assert!(again.cached_result);
    assert_eq!(again.value.score, 0.7);
}
