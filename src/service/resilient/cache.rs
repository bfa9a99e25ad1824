//! Cache backends and deterministic cache-key derivation.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use url::Url;

use crate::service::context::instant_after;

/// Storage for serialized call results. Implementations must be thread-safe.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fresh value for `key`, or `None` on miss/expiry.
    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: String, ttl: Duration);
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// In-process TTL cache.
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_capacity(64),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let fresh = entry.expires_at > now;
            if !fresh {
                removed += 1;
            }
            fresh
        });
        removed
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone());

        if hit.is_none() {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        hit
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: instant_after(ttl),
            },
        );
    }
}

/// Logical identity of an external request.
///
/// Qualifiers are kept sorted so the rendered key does not depend on the
/// order they were added in. URLs are normalised through [`Url`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    operation: String,
    target: String,
    qualifiers: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(operation: &str, target: &str) -> Self {
        Self {
            operation: operation.trim().to_ascii_lowercase(),
            target: normalize_target(target),
            qualifiers: BTreeMap::new(),
        }
    }

    /// Add a qualifier; empty values are ignored.
    pub fn with(mut self, name: &str, value: impl AsRef<str>) -> Self {
        let value = value.as_ref().trim();
        if !value.is_empty() {
            self.qualifiers
                .insert(name.trim().to_ascii_lowercase(), value.to_string());
        }
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.operation, self.target)?;
        for (name, value) in &self.qualifiers {
            write!(f, "|{}={}", name, value)?;
        }
        Ok(())
    }
}

fn normalize_target(target: &str) -> String {
    let trimmed = target.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_independent_of_qualifier_order() {
        let a = CacheKey::new("content", "https://Example.com")
            .with("language", "en")
            .with("audience", "developers");
        let b = CacheKey::new("Content", "https://example.com/")
            .with("audience", "developers")
            .with("language", "en");

        assert_eq!(a, b);
        assert_eq!(
            a.to_string(),
            "content|https://example.com/|audience=developers|language=en"
        );
    }

    #[test]
    fn key_drops_fragment_and_empty_qualifiers() {
        let key = CacheKey::new("lighthouse", "https://example.com/page#top").with("category", "");
        assert_eq!(key.to_string(), "lighthouse|https://example.com/page");
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_ttl_never_expires() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Duration::from_secs(u64::MAX)).await;

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.purge_expired(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn purge_tolerates_concurrent_inserts() {
        let cache = std::sync::Arc::new(MemoryCache::new());
        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..2000 {
                    cache.set(&format!("k{}", i), "v".into(), Duration::from_secs(60)).await;
                }
            })
        };

        let mut purged = 0;
        while !writer.is_finished() {
            purged += cache.purge_expired();
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();

        assert_eq!(purged, 0);
        assert_eq!(cache.len(), 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired() {
        let cache = MemoryCache::new();
        cache.set("short", "1".into(), Duration::from_secs(1)).await;
        cache.set("long", "2".into(), Duration::from_secs(100)).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
