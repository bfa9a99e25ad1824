//! Lighthouse audits through the resilient client.
//!
//! One logical audit (a URL, a strategy and a set of categories) is split
//! into one backend call per category. The calls run concurrently and the
//! partial reports are merged into a single [`LighthouseReport`], cached
//! under the parent key.
//!
//! The production backend spawns the `lighthouse-runner` sidecar, a
//! standalone Node.js executable that prints one JSON document per run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::LighthouseConfig;
use crate::domain::{Issue, Severity, WebVitals};
use crate::error::{AnalysisError, Result};
use crate::service::context::RunContext;
use crate::service::resilient::{CacheKey, CallOutcome, Cacheable, Mergeable, ResilientClient};

/// Audits with a score at or above this are treated as passing.
const PASSING_AUDIT_SCORE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LighthouseCategory {
    Performance,
    Accessibility,
    BestPractices,
    Seo,
}

impl LighthouseCategory {
    pub const ALL: [LighthouseCategory; 4] = [
        LighthouseCategory::Performance,
        LighthouseCategory::Accessibility,
        LighthouseCategory::BestPractices,
        LighthouseCategory::Seo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LighthouseCategory::Performance => "performance",
            LighthouseCategory::Accessibility => "accessibility",
            LighthouseCategory::BestPractices => "best-practices",
            LighthouseCategory::Seo => "seo",
        }
    }
}

impl fmt::Display for LighthouseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LighthouseCategory {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        let needle = s.trim().to_ascii_lowercase().replace('_', "-");
        LighthouseCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == needle)
            .ok_or_else(|| AnalysisError::Config(format!("unknown Lighthouse category: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Mobile,
    Desktop,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Mobile => "mobile",
            Strategy::Desktop => "desktop",
        }
    }
}

/// Result of an individual audit check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditDetail {
    pub title: String,
    pub passed: bool,
    /// 0.0 to 1.0
    pub score: Option<f64>,
    pub display_value: Option<String>,
    pub description: Option<String>,
}

/// Merged Lighthouse output for one URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LighthouseReport {
    pub final_url: String,
    pub strategy: String,
    pub lighthouse_version: String,
    /// Category id to score on a 0-100 scale
    pub scores: BTreeMap<String, f64>,
    pub audits: BTreeMap<String, AuditDetail>,
    pub web_vitals: WebVitals,
    pub issues: Vec<Issue>,
    pub recommendations: Vec<String>,
}

impl LighthouseReport {
    pub fn score(&self, category: LighthouseCategory) -> Option<f64> {
        self.scores.get(category.as_str()).copied()
    }

    pub fn failed_audits(&self) -> impl Iterator<Item = (&String, &AuditDetail)> {
        self.audits.iter().filter(|(_, a)| !a.passed)
    }
}

impl Cacheable for LighthouseReport {
    fn is_empty_result(&self) -> bool {
        self.scores.is_empty() && self.audits.is_empty()
    }
}

impl Mergeable for LighthouseReport {
    fn merge(&mut self, other: Self) {
        fn first_non_empty(current: &mut String, candidate: String) {
            if current.is_empty() {
                *current = candidate;
            }
        }

        first_non_empty(&mut self.final_url, other.final_url);
        first_non_empty(&mut self.strategy, other.strategy);
        first_non_empty(&mut self.lighthouse_version, other.lighthouse_version);
        self.web_vitals.fill_from(&other.web_vitals);

        for (category, score) in other.scores {
            self.scores.entry(category).or_insert(score);
        }
        for (id, audit) in other.audits {
            self.audits.entry(id).or_insert(audit);
        }
        self.issues.extend(other.issues);
        self.recommendations.extend(other.recommendations);
    }
}

/// Anything that can run a single-category Lighthouse audit.
#[async_trait]
pub trait LighthouseBackend: Send + Sync {
    async fn audit(
        &self,
        url: &str,
        category: LighthouseCategory,
        strategy: Strategy,
    ) -> anyhow::Result<LighthouseReport>;
}

// ============================================================================
// Sidecar backend
// ============================================================================

/// Backend that spawns the `lighthouse-runner` sidecar once per category.
pub struct SidecarBackend {
    program: PathBuf,
    base_args: Vec<String>,
}

impl SidecarBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        tracing::info!("[LIGHTHOUSE] Sidecar path: {:?}", program);
        Self {
            program,
            base_args: Vec::new(),
        }
    }

    /// Locate the runner next to the current executable, falling back to `PATH`.
    pub fn discover() -> Self {
        Self::new(find_runner())
    }

    /// Arguments placed before the URL on every invocation.
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn convert(response: SidecarResponse, url: &str, strategy: Strategy) -> LighthouseReport {
        let scores = response
            .scores
            .into_iter()
            .filter_map(|(category, score)| {
                score.map(|s| (category.replace('_', "-"), (s * 100.0).clamp(0.0, 100.0)))
            })
            .collect();

        let mut issues = Vec::new();
        let mut recommendations = Vec::new();
        let audits = response
            .audits
            .into_iter()
            .map(|(id, audit)| {
                let passed = audit
                    .passed
                    .unwrap_or_else(|| audit.score.is_some_and(|s| s >= PASSING_AUDIT_SCORE));
                if !passed {
                    let severity = match audit.score {
                        Some(s) if s >= 0.5 => Severity::Medium,
                        Some(_) => Severity::High,
                        None => Severity::Low,
                    };
                    let title = audit.title.clone().unwrap_or_else(|| id.clone());
                    let mut issue = Issue::new(&format!("lighthouse_{}", id.replace('-', "_")), severity, title.clone());
                    if let Some(value) = &audit.value {
                        issue = issue.with_detail("display_value", value.as_str());
                    }
                    issues.push(issue);
                    recommendations.push(audit.description.clone().unwrap_or_else(|| format!("Fix: {}", title)));
                }
                let detail = AuditDetail {
                    title: audit.title.unwrap_or_else(|| id.clone()),
                    passed,
                    score: audit.score,
                    display_value: audit.value,
                    description: audit.description,
                };
                (id, detail)
            })
            .collect();

        let web_vitals = response
            .performance_metrics
            .map(|p| WebVitals {
                first_contentful_paint: p.first_contentful_paint,
                largest_contentful_paint: p.largest_contentful_paint,
                speed_index: p.speed_index,
                time_to_interactive: p.time_to_interactive,
                total_blocking_time: p.total_blocking_time,
                cumulative_layout_shift: p.cumulative_layout_shift,
            })
            .unwrap_or_default();

        LighthouseReport {
            final_url: response.url.unwrap_or_else(|| url.to_string()),
            strategy: strategy.as_str().to_string(),
            lighthouse_version: response.lighthouse_version.unwrap_or_default(),
            scores,
            audits,
            web_vitals,
            issues,
            recommendations,
        }
    }
}

#[async_trait]
impl LighthouseBackend for SidecarBackend {
    async fn audit(
        &self,
        url: &str,
        category: LighthouseCategory,
        strategy: Strategy,
    ) -> anyhow::Result<LighthouseReport> {
        tracing::debug!("[LIGHTHOUSE] Running {} audit ({}) for {}", category, strategy.as_str(), url);
        let start = std::time::Instant::now();

        // kill_on_drop: a cancelled run must not leave Chrome behind
        let output = Command::new(&self.program)
            .args(&self.base_args)
            .arg(url)
            .arg("--category")
            .arg(category.as_str())
            .arg("--strategy")
            .arg(strategy.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to spawn lighthouse-runner")?;

        tracing::debug!(
            "[LIGHTHOUSE] {} process completed in {:.2}ms",
            category,
            start.elapsed().as_secs_f64() * 1000.0
        );

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            tracing::debug!("[LIGHTHOUSE] stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            anyhow::bail!(
                "Lighthouse failed: {}",
                if !stderr.is_empty() { stderr.trim().to_string() } else { "Unknown error".into() }
            );
        }

        let response: SidecarResponse =
            serde_json::from_str(&stdout).context("Failed to parse lighthouse output")?;

        if !response.success {
            anyhow::bail!(
                "Lighthouse analysis failed: {}",
                response.error.unwrap_or_else(|| "Unknown error".into())
            );
        }

        Ok(Self::convert(response, url, strategy))
    }
}

fn find_runner() -> PathBuf {
    let exe_path = std::env::current_exe().unwrap_or_default();
    let exe_dir = exe_path.parent().unwrap_or(std::path::Path::new("."));

    let local = exe_dir.join("lighthouse-runner");
    if local.exists() {
        return local;
    }
    PathBuf::from("lighthouse-runner")
}

#[derive(Debug, Deserialize)]
struct SidecarResponse {
    success: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    lighthouse_version: Option<String>,
    /// Category scores on a 0.0 to 1.0 scale
    #[serde(default)]
    scores: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    audits: BTreeMap<String, SidecarAudit>,
    #[serde(default)]
    performance_metrics: Option<SidecarPerformanceMetrics>,
}

#[derive(Debug, Deserialize, Default)]
struct SidecarAudit {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    passed: Option<bool>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SidecarPerformanceMetrics {
    first_contentful_paint: Option<f64>,
    largest_contentful_paint: Option<f64>,
    speed_index: Option<f64>,
    time_to_interactive: Option<f64>,
    total_blocking_time: Option<f64>,
    cumulative_layout_shift: Option<f64>,
}

// ============================================================================
// Client
// ============================================================================

/// Category fan-out over a [`LighthouseBackend`].
#[derive(Clone)]
pub struct LighthouseClient {
    backend: Arc<dyn LighthouseBackend>,
    resilient: ResilientClient,
    strategy: Strategy,
    categories: Vec<LighthouseCategory>,
}

impl LighthouseClient {
    pub fn new(backend: Arc<dyn LighthouseBackend>, resilient: ResilientClient) -> Self {
        Self {
            backend,
            resilient,
            strategy: Strategy::default(),
            categories: LighthouseCategory::ALL.to_vec(),
        }
    }

    pub fn from_config(
        config: &LighthouseConfig,
        backend: Arc<dyn LighthouseBackend>,
        resilient: ResilientClient,
    ) -> Self {
        Self::new(backend, resilient)
            .with_strategy(config.strategy)
            .with_categories(config.categories.clone())
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Duplicates are dropped; an empty list falls back to every category.
    pub fn with_categories(mut self, mut categories: Vec<LighthouseCategory>) -> Self {
        categories.sort();
        categories.dedup();
        self.categories = if categories.is_empty() {
            LighthouseCategory::ALL.to_vec()
        } else {
            categories
        };
        self
    }

    pub fn categories(&self) -> &[LighthouseCategory] {
        &self.categories
    }

    fn cache_key(&self, url: &str) -> CacheKey {
        let categories = self
            .categories
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",");
        CacheKey::new("lighthouse", url)
            .with("strategy", self.strategy.as_str())
            .with("categories", categories)
    }

    /// Audit `url` across every configured category.
    pub async fn audit(&self, ctx: &RunContext, url: &str) -> Result<CallOutcome<LighthouseReport>> {
        let key = self.cache_key(url);
        let strategy = self.strategy;
        tracing::info!("[LIGHTHOUSE] Auditing {} ({} categories)", url, self.categories.len());

        let outcome = self
            .resilient
            .call_fanout(ctx, &key, self.categories.clone(), |category| {
                let backend = self.backend.clone();
                let url = url.to_string();
                async move {
                    backend
                        .audit(&url, category, strategy)
                        .await
                        .map_err(AnalysisError::from)
                }
            })
            .await?;

        tracing::info!(
            "[LIGHTHOUSE] Complete - {} scores, {} audits, cached: {}",
            outcome.value.scores.len(),
            outcome.value.audits.len(),
            outcome.cached_result
        );
        Ok(outcome)
    }
}
