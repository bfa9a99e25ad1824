//! Content-improvement requests for a downstream LLM provider.
//!
//! The engine does not write prompts or talk to any provider API. It builds a
//! [`ContentRequest`] from the aggregated results and hands it to a
//! [`ContentProvider`] through the resilient client, so repeated requests
//! for the same page, language and audience are answered from cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::domain::{overall_score, AnalyzerType, Issue, KeywordDensity, ReadabilityMetrics, ResultsMap, Severity};
use crate::error::{AnalysisError, Result};
use crate::service::context::RunContext;
use crate::service::resilient::{CacheBackend, CacheKey, CallOutcome, Cacheable, ResilientClient};

const TOP_ISSUES: usize = 10;

/// Aggregated analysis output in the shape the content service consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRequest {
    pub url: String,
    pub operation: String,
    pub language: Option<String>,
    pub audience: Option<String>,
    pub overall_score: Option<f64>,
    pub category_scores: BTreeMap<AnalyzerType, f64>,
    pub issues: BTreeMap<AnalyzerType, Vec<Issue>>,
    pub readability: Option<ReadabilityMetrics>,
    pub top_keywords: Vec<KeywordDensity>,
    pub word_count: Option<usize>,
}

impl ContentRequest {
    /// Collect per-category issues and scores, readability figures from the
    /// content analyzer and the overall score.
    pub fn from_results(url: &str, operation: &str, results: &ResultsMap) -> Self {
        let mut category_scores = BTreeMap::new();
        let mut issues = BTreeMap::new();
        for (kind, result) in results {
            if let Some(score) = result.score {
                category_scores.insert(*kind, score);
            }
            if !result.issues.is_empty() {
                issues.insert(*kind, result.issues.clone());
            }
        }

        let content = results
            .get(&AnalyzerType::Content)
            .and_then(|r| r.metrics.as_content());

        Self {
            url: url.to_string(),
            operation: operation.to_string(),
            language: None,
            audience: None,
            overall_score: overall_score(results),
            category_scores,
            issues,
            readability: content.map(|c| c.readability.clone()),
            top_keywords: content.map(|c| c.top_keywords.clone()).unwrap_or_default(),
            word_count: content.map(|c| c.word_count),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Count of issues at `severity` across every category.
    pub fn issue_count(&self, severity: Severity) -> usize {
        self.issues
            .values()
            .flatten()
            .filter(|i| i.severity == severity)
            .count()
    }

    /// Most severe issues first, capped at ten.
    pub fn top_issues(&self) -> Vec<&Issue> {
        let mut all: Vec<&Issue> = self.issues.values().flatten().collect();
        all.sort_by_key(|i| i.severity);
        all.truncate(TOP_ISSUES);
        all
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.operation, &self.url)
            .with("language", self.language.as_deref().unwrap_or_default())
            .with("audience", self.audience.as_deref().unwrap_or_default())
    }
}

/// What the provider sends back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentSuggestion {
    pub summary: String,
    pub suggestions: Vec<String>,
    pub provider: String,
}

impl Cacheable for ContentSuggestion {
    fn is_empty_result(&self) -> bool {
        self.summary.trim().is_empty() && self.suggestions.is_empty()
    }
}

/// An LLM backend able to turn a request into suggestions.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &ContentRequest) -> anyhow::Result<ContentSuggestion>;
}

pub struct ContentImprovementService {
    provider: Arc<dyn ContentProvider>,
    resilient: ResilientClient,
}

impl ContentImprovementService {
    pub fn new(provider: Arc<dyn ContentProvider>, resilient: ResilientClient) -> Self {
        Self { provider, resilient }
    }

    /// Generated text is reused longer than audit data.
    pub fn from_config(
        provider: Arc<dyn ContentProvider>,
        config: &EngineConfig,
        cache: Option<Arc<dyn CacheBackend>>,
    ) -> Result<Self> {
        let resilient = ResilientClient::from_config("content", config, cache)?
            .with_cache_ttl(config.content_cache_ttl());
        Ok(Self::new(provider, resilient))
    }

    pub async fn improve(
        &self,
        ctx: &RunContext,
        request: &ContentRequest,
    ) -> Result<CallOutcome<ContentSuggestion>> {
        if request.url.trim().is_empty() {
            return Err(AnalysisError::Config("content request has no url".into()));
        }
        let key = request.cache_key();
        tracing::info!(
            "[CONTENT] {} request for {} via {}",
            request.operation,
            request.url,
            self.provider.name()
        );

        self.resilient
            .call(ctx, &key, || async move {
                self.provider
                    .generate(request)
                    .await
                    .map_err(AnalysisError::from)
            })
            .await
    }
}
