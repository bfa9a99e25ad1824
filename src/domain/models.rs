//! Core domain entities shared by the scheduler, the executor and the analyzers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::metrics::AnalyzerMetrics;
use crate::error::AnalysisError;

// ====== Enums ======

/// The closed set of analysis categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerType {
    Seo,
    Performance,
    Structure,
    Accessibility,
    Security,
    Mobile,
    Content,
    Lighthouse,
}

impl AnalyzerType {
    pub const ALL: [AnalyzerType; 8] = [
        AnalyzerType::Seo,
        AnalyzerType::Performance,
        AnalyzerType::Structure,
        AnalyzerType::Accessibility,
        AnalyzerType::Security,
        AnalyzerType::Mobile,
        AnalyzerType::Content,
        AnalyzerType::Lighthouse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzerType::Seo => "seo",
            AnalyzerType::Performance => "performance",
            AnalyzerType::Structure => "structure",
            AnalyzerType::Accessibility => "accessibility",
            AnalyzerType::Security => "security",
            AnalyzerType::Mobile => "mobile",
            AnalyzerType::Content => "content",
            AnalyzerType::Lighthouse => "lighthouse",
        }
    }

    /// Priority assigned when an analyzer is created through the factory.
    /// Higher runs earlier within a layer and wins cycle breaks.
    pub fn default_priority(&self) -> i32 {
        match self {
            AnalyzerType::Lighthouse => 100,
            AnalyzerType::Performance => 90,
            AnalyzerType::Security => 80,
            AnalyzerType::Seo => 70,
            AnalyzerType::Accessibility => 60,
            AnalyzerType::Mobile => 50,
            AnalyzerType::Structure => 40,
            AnalyzerType::Content => 10,
        }
    }
}

impl fmt::Display for AnalyzerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalyzerType {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        AnalyzerType::ALL
            .into_iter()
            .find(|t| t.as_str() == needle)
            .ok_or_else(|| AnalysisError::UnknownAnalyzerType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    /// Points deducted from a local score for one issue of this severity.
    pub fn penalty(&self) -> f64 {
        match self {
            Severity::High => 15.0,
            Severity::Medium => 10.0,
            Severity::Low => 5.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

// ====== Issues ======

/// A single problem found by an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl Issue {
    pub fn new(issue_type: &str, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            issue_type: issue_type.to_string(),
            severity,
            description: description.into(),
            details: Map::new(),
        }
    }

    pub fn high(issue_type: &str, description: impl Into<String>) -> Self {
        Self::new(issue_type, Severity::High, description)
    }

    pub fn medium(issue_type: &str, description: impl Into<String>) -> Self {
        Self::new(issue_type, Severity::Medium, description)
    }

    pub fn low(issue_type: &str, description: impl Into<String>) -> Self {
        Self::new(issue_type, Severity::Low, description)
    }

    /// Attach a free-form detail value
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

// ====== Website snapshot ======

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heading {
    pub level: u8,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub rel: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub is_internal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub src: String,
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub loading: Option<String>,
    #[serde(default)]
    pub srcset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub is_defer: bool,
    #[serde(default)]
    pub in_head: bool,
}

impl Script {
    /// External, synchronous script placed in `<head>`.
    pub fn is_render_blocking(&self) -> bool {
        self.src.is_some() && self.in_head && !self.is_async && !self.is_defer
    }
}

/// Immutable snapshot of a fetched page, produced by the crawler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsiteData {
    pub url: String,
    pub title: Option<String>,
    pub lang: Option<String>,
    pub headings: Vec<Heading>,
    /// Lower-cased `name`/`property` to `content`
    pub meta_tags: BTreeMap<String, String>,
    pub links: Vec<Link>,
    pub images: Vec<Image>,
    pub scripts: Vec<Script>,
    pub stylesheets: Vec<String>,
    pub html: String,
    pub text: String,
    pub load_time_ms: f64,
    pub status_code: u16,
    /// Lower-cased response header names
    pub headers: BTreeMap<String, String>,
}

impl WebsiteData {
    pub fn meta(&self, name: &str) -> Option<&str> {
        self.meta_tags
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    pub fn headings_at(&self, level: u8) -> impl Iterator<Item = &Heading> {
        self.headings.iter().filter(move |h| h.level == level)
    }

    pub fn is_https(&self) -> bool {
        self.url.trim_start().to_ascii_lowercase().starts_with("https://")
    }
}

// ====== Results ======

/// What an analyzer reported after a successful `analyze` call.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerResult {
    pub analyzer_type: AnalyzerType,
    pub metrics: AnalyzerMetrics,
    pub issues: Vec<Issue>,
    pub recommendations: Vec<String>,
    pub score: Option<f64>,
    pub duration_ms: u64,
}

/// Completed results keyed by analyzer. Values are shared so a layer
/// snapshot is a shallow copy.
pub type ResultsMap = BTreeMap<AnalyzerType, Arc<AnalyzerResult>>;

/// Arithmetic mean of every reported score; analyzers without one are skipped.
pub fn overall_score(results: &ResultsMap) -> Option<f64> {
    let scores: Vec<f64> = results.values().filter_map(|r| r.score).collect();
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

// ====== Progress ======

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    LayerStarted,
    AnalyzerStarted,
    AnalyzerCompleted,
    AnalyzerFailed,
    ScheduleWarning,
    RunCompleted,
}

/// Aggregate statistics carried by the final progress event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub analyzer_count: usize,
    pub completed_count: usize,
    pub elapsed_ms: u64,
    pub overall_score: Option<f64>,
    pub layer_count: usize,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProgressDetails {
    Result(Arc<AnalyzerResult>),
    Summary(RunSummary),
}

/// Ephemeral progress event delivered to the registered sink.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub run_id: Uuid,
    pub kind: ProgressKind,
    pub analyzer_type: Option<AnalyzerType>,
    pub layer: Option<usize>,
    pub progress_percent: f64,
    pub message: String,
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_results: Option<ProgressDetails>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::metrics::{AnalyzerMetrics, MetricsShape};

    fn result_with(kind: AnalyzerType, score: Option<f64>) -> Arc<AnalyzerResult> {
        Arc::new(AnalyzerResult {
            analyzer_type: kind,
            metrics: AnalyzerMetrics::new(MetricsShape::Empty, score),
            issues: vec![],
            recommendations: vec![],
            score,
            duration_ms: 0,
        })
    }

    #[test]
    fn analyzer_type_parses_case_insensitively() {
        assert_eq!("SEO".parse::<AnalyzerType>().unwrap(), AnalyzerType::Seo);
        assert_eq!(
            " lighthouse ".parse::<AnalyzerType>().unwrap(),
            AnalyzerType::Lighthouse
        );
        let err = "crawler".parse::<AnalyzerType>().unwrap_err();
        assert!(matches!(err, AnalysisError::UnknownAnalyzerType(ref s) if s == "crawler"));
    }

    #[test]
    fn overall_score_skips_analyzers_without_score() {
        let mut results = ResultsMap::new();
        results.insert(AnalyzerType::Seo, result_with(AnalyzerType::Seo, Some(80.0)));
        results.insert(AnalyzerType::Content, result_with(AnalyzerType::Content, Some(60.0)));
        results.insert(AnalyzerType::Structure, result_with(AnalyzerType::Structure, None));

        assert_eq!(overall_score(&results), Some(70.0));
        assert_eq!(overall_score(&ResultsMap::new()), None);
    }

    #[test]
    fn issue_serializes_with_type_key() {
        let issue = Issue::high("missing_title", "Page has no title tag").with_detail("selector", "title");
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["type"], "missing_title");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["details"]["selector"], "title");
    }

    #[test]
    fn render_blocking_requires_sync_external_head_script() {
        let blocking = Script { src: Some("/app.js".into()), is_async: false, is_defer: false, in_head: true };
        let deferred = Script { is_defer: true, ..blocking.clone() };
        let inline = Script { src: None, ..blocking.clone() };
        assert!(blocking.is_render_blocking());
        assert!(!deferred.is_render_blocking());
        assert!(!inline.is_render_blocking());
    }
}
