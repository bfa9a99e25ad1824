//! Engine configuration.
//!
//! Values come from defaults, an optional JSON document and `SEOINSIKT_*`
//! environment variables, applied in that order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::service::lighthouse::{LighthouseCategory, Strategy};
use crate::service::resilient::{RetryPolicy, MAX_JITTER};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            burst: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Fraction of each backoff delay added at random
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
            .with_jitter(self.jitter.clamp(0.0, MAX_JITTER))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LighthouseConfig {
    /// Path to the `lighthouse-runner` executable; discovered when unset
    pub runner: Option<PathBuf>,
    pub strategy: Strategy,
    pub categories: Vec<LighthouseCategory>,
}

impl Default for LighthouseConfig {
    fn default() -> Self {
        Self {
            runner: None,
            strategy: Strategy::Mobile,
            categories: LighthouseCategory::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub cache_ttl_secs: u64,
    /// Default per-call timeout when the run has no earlier deadline
    pub call_timeout_secs: u64,
    /// Concurrent sub-requests of one fan-out call
    pub max_parallel_requests: usize,
    pub lighthouse: LighthouseConfig,
    pub content_cache_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            cache_ttl_secs: 3600,
            call_timeout_secs: 120,
            max_parallel_requests: num_cpus::get().max(1),
            lighthouse: LighthouseConfig::default(),
            content_cache_ttl_secs: 24 * 3600,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AnalysisError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `SEOINSIKT_*` overrides read through `lookup`. Values that do
    /// not parse are logged and skipped.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("[CONFIG] Ignoring invalid {}={:?}", key, raw);
                    None
                }
            }
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(rps) = parsed::<f64>(lookup, "SEOINSIKT_RATE_LIMIT_RPS") {
            if rps > 0.0 && rps.is_finite() {
                self.rate_limit.requests_per_second = rps;
            } else {
                tracing::warn!("[CONFIG] Ignoring non-positive SEOINSIKT_RATE_LIMIT_RPS={}", rps);
            }
        }
        if let Some(burst) = parsed::<u32>(lookup, "SEOINSIKT_RATE_LIMIT_BURST").filter(|b| *b > 0) {
            self.rate_limit.burst = burst;
        }
        if let Some(retries) = parsed(lookup, "SEOINSIKT_MAX_RETRIES") {
            self.retry.max_retries = retries;
        }
        if let Some(delay) = parsed(lookup, "SEOINSIKT_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = delay;
        }
        if let Some(ttl) = parsed(lookup, "SEOINSIKT_CACHE_TTL_SECS") {
            self.cache_ttl_secs = ttl;
        }
        if let Some(timeout) = parsed::<u64>(lookup, "SEOINSIKT_CALL_TIMEOUT_SECS").filter(|t| *t > 0) {
            self.call_timeout_secs = timeout;
        }
        if let Some(parallel) = parsed::<usize>(lookup, "SEOINSIKT_MAX_PARALLEL").filter(|p| *p > 0) {
            self.max_parallel_requests = parallel;
        }
        if let Some(runner) = lookup("SEOINSIKT_LIGHTHOUSE_RUNNER").filter(|r| !r.trim().is_empty()) {
            self.lighthouse.runner = Some(PathBuf::from(runner.trim()));
        }
    }

    pub fn validate(&self) -> Result<()> {
        let rps = self.rate_limit.requests_per_second;
        if !(rps > 0.0 && rps.is_finite()) {
            return Err(AnalysisError::Config(format!(
                "rate_limit.requests_per_second must be positive, got {}",
                rps
            )));
        }
        if self.rate_limit.burst == 0 {
            return Err(AnalysisError::Config("rate_limit.burst must be at least 1".into()));
        }
        if self.max_parallel_requests == 0 {
            return Err(AnalysisError::Config("max_parallel_requests must be at least 1".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(AnalysisError::Config("call_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn content_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.content_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "retry": { "max_retries": 1 }, "lighthouse": { "strategy": "desktop", "categories": ["seo", "best-practices"] } }"#,
        )
        .unwrap();

        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.lighthouse.strategy, Strategy::Desktop);
        assert_eq!(
            config.lighthouse.categories,
            vec![LighthouseCategory::Seo, LighthouseCategory::BestPractices]
        );
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "rate_limit": { "requests_per_second": 0 } }"#).unwrap_err();
        assert!(matches!(err, AnalysisError::Config(_)));

        let err = EngineConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, AnalysisError::Serialization(_)));
    }

    #[test]
    fn jitter_is_clamped() {
        let retry = RetryConfig {
            jitter: 0.9,
            ..Default::default()
        };
        assert_eq!(retry.policy().jitter, MAX_JITTER);
        assert_eq!(retry.policy().base_delay, Duration::from_secs(1));
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let mut config = EngineConfig::default();
        config.apply_overrides(env(&[
            ("SEOINSIKT_RATE_LIMIT_RPS", "5.5"),
            ("SEOINSIKT_MAX_RETRIES", "lots"),
            ("SEOINSIKT_MAX_PARALLEL", "0"),
            ("SEOINSIKT_CALL_TIMEOUT_SECS", "30"),
            ("SEOINSIKT_LIGHTHOUSE_RUNNER", "/opt/lighthouse-runner"),
        ]));

        assert_eq!(config.rate_limit.requests_per_second, 5.5);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.max_parallel_requests >= 1);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.lighthouse.runner, Some(PathBuf::from("/opt/lighthouse-runner")));
    }

    #[tokio::test]
    async fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "cache_ttl_secs": 60, "max_parallel_requests": 2 }}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).await.unwrap();
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.max_parallel_requests, 2);

        let missing = EngineConfig::from_file("/nonexistent/seoinsikt.json").await;
        assert!(matches!(missing, Err(AnalysisError::Config(_))));
    }
}
