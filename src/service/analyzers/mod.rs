//! Pluggable analyzers, one per analysis category.
//!
//! Each analyzer owns its private state (metrics, issues, recommendations)
//! and is only ever driven by one task at a time. `analyze` receives the
//! immutable page snapshot plus the results of every earlier layer.

mod accessibility;
mod content;
mod lighthouse;
mod mobile;
mod performance;
pub mod scoring;
mod security;
mod seo;
mod structure;

pub use accessibility::AccessibilityAnalyzer;
pub use content::ContentAnalyzer;
pub use lighthouse::LighthouseAnalyzer;
pub use mobile::MobileAnalyzer;
pub use performance::PerformanceAnalyzer;
pub use security::SecurityAnalyzer;
pub use seo::SeoAnalyzer;
pub use structure::StructureAnalyzer;

use async_trait::async_trait;

use crate::domain::{
    AnalyzerMetrics, AnalyzerType, Issue, LighthouseMetrics, MetricsShape, ResultsMap, WebsiteData,
};
use crate::error::{AnalysisError, Result};
use crate::service::context::RunContext;
use crate::service::lighthouse::LighthouseClient;

/// State every analyzer carries between runs.
#[derive(Debug, Clone)]
pub struct AnalyzerState {
    kind: AnalyzerType,
    priority: i32,
    metrics: Option<AnalyzerMetrics>,
    issues: Vec<Issue>,
    recommendations: Vec<String>,
}

impl AnalyzerState {
    pub fn new(kind: AnalyzerType) -> Self {
        Self {
            kind,
            priority: kind.default_priority(),
            metrics: None,
            issues: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(&self) -> AnalyzerType {
        self.kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn metrics(&self) -> Option<&AnalyzerMetrics> {
        self.metrics.as_ref()
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn recommendations(&self) -> &[String] {
        &self.recommendations
    }

    /// Clear output from a previous run.
    pub fn reset(&mut self) {
        self.metrics = None;
        self.issues.clear();
        self.recommendations.clear();
    }

    pub fn add_issue(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    /// Record an issue together with the recommendation that fixes it.
    pub fn flag(&mut self, issue: Issue, recommendation: &str) {
        self.add_issue(issue);
        self.add_recommendation(recommendation);
    }

    /// Duplicates are ignored.
    pub fn add_recommendation(&mut self, recommendation: impl Into<String>) {
        let recommendation = recommendation.into();
        if !self.recommendations.contains(&recommendation) {
            self.recommendations.push(recommendation);
        }
    }

    /// 100 minus the severity penalties of the recorded issues.
    pub fn local_score(&self) -> f64 {
        scoring::deduction_score(&self.issues)
    }

    /// Store the final metrics (score clamped) and hand back a copy.
    pub fn finish(&mut self, shape: MetricsShape, score: Option<f64>) -> AnalyzerMetrics {
        let metrics = AnalyzerMetrics::new(shape, score.map(scoring::clamp_score));
        self.metrics = Some(metrics.clone());
        metrics
    }

    pub(crate) fn finish_with(&mut self, metrics: AnalyzerMetrics) -> AnalyzerMetrics {
        let mut metrics = metrics;
        metrics.score = metrics.score.map(scoring::clamp_score);
        self.metrics = Some(metrics.clone());
        metrics
    }
}

/// One analysis category.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn state(&self) -> &AnalyzerState;

    /// Analyze `data`, reading earlier layers from `prior`. Replaces any
    /// output of a previous call.
    async fn analyze(
        &mut self,
        ctx: &RunContext,
        data: &WebsiteData,
        prior: &ResultsMap,
    ) -> Result<AnalyzerMetrics>;

    fn analyzer_type(&self) -> AnalyzerType {
        self.state().kind()
    }

    fn priority(&self) -> i32 {
        self.state().priority()
    }

    fn metrics(&self) -> Option<&AnalyzerMetrics> {
        self.state().metrics()
    }

    fn issues(&self) -> &[Issue] {
        self.state().issues()
    }

    fn recommendations(&self) -> &[String] {
        self.state().recommendations()
    }

    fn score(&self) -> Option<f64> {
        self.metrics().and_then(|m| m.score)
    }
}

/// Lighthouse output from an earlier layer, if it ran.
pub(crate) fn prior_lighthouse(prior: &ResultsMap) -> Option<&LighthouseMetrics> {
    prior
        .get(&AnalyzerType::Lighthouse)
        .and_then(|r| r.metrics.as_lighthouse())
}

/// A Lighthouse category score (0-100) from an earlier layer.
pub(crate) fn prior_category_score(prior: &ResultsMap, category: &str) -> Option<f64> {
    prior_lighthouse(prior).and_then(|m| m.categories.get(category).copied())
}

/// Collaborators analyzers may need.
#[derive(Clone, Default)]
pub struct AnalyzerDeps {
    pub lighthouse: Option<LighthouseClient>,
}

/// Build an analyzer with its default priority.
pub fn create_analyzer(kind: AnalyzerType, deps: &AnalyzerDeps) -> Result<Box<dyn Analyzer>> {
    let analyzer: Box<dyn Analyzer> = match kind {
        AnalyzerType::Seo => Box::new(SeoAnalyzer::new()),
        AnalyzerType::Performance => Box::new(PerformanceAnalyzer::new()),
        AnalyzerType::Structure => Box::new(StructureAnalyzer::new()),
        AnalyzerType::Accessibility => Box::new(AccessibilityAnalyzer::new()),
        AnalyzerType::Security => Box::new(SecurityAnalyzer::new()),
        AnalyzerType::Mobile => Box::new(MobileAnalyzer::new()),
        AnalyzerType::Content => Box::new(ContentAnalyzer::new()),
        AnalyzerType::Lighthouse => {
            let client = deps
                .lighthouse
                .clone()
                .ok_or(AnalysisError::MissingCollaborator {
                    analyzer: kind,
                    collaborator: "a Lighthouse client",
                })?;
            Box::new(LighthouseAnalyzer::new(client))
        }
    };
    Ok(analyzer)
}

/// Parse `name` and build the analyzer it names.
pub fn create_analyzer_named(name: &str, deps: &AnalyzerDeps) -> Result<Box<dyn Analyzer>> {
    create_analyzer(name.parse()?, deps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommendations_are_deduplicated() {
        let mut state = AnalyzerState::new(AnalyzerType::Seo);
        state.add_recommendation("Add a title");
        state.add_recommendation("Add a title".to_string());
        state.flag(Issue::low("x", "y"), "Add a title");
        assert_eq!(state.recommendations(), ["Add a title".to_string()]);
        assert_eq!(state.issues().len(), 1);
    }

    #[test]
    fn finish_clamps_score() {
        let mut state = AnalyzerState::new(AnalyzerType::Mobile);
        let metrics = state.finish(MetricsShape::Empty, Some(140.0));
        assert_eq!(metrics.score, Some(100.0));
        assert_eq!(state.metrics().and_then(|m| m.score), Some(100.0));
    }

    #[test]
    fn factory_requires_lighthouse_client() {
        let deps = AnalyzerDeps::default();
        let err = create_analyzer(AnalyzerType::Lighthouse, &deps).err().unwrap();
        assert!(matches!(err, AnalysisError::MissingCollaborator { analyzer: AnalyzerType::Lighthouse, .. }));

        let seo = create_analyzer(AnalyzerType::Seo, &deps).unwrap();
        assert_eq!(seo.analyzer_type(), AnalyzerType::Seo);
        assert_eq!(seo.priority(), 70);
    }

    #[test]
    fn factory_rejects_unknown_names() {
        let err = create_analyzer_named("keywords", &AnalyzerDeps::default()).err().unwrap();
        assert!(matches!(err, AnalysisError::UnknownAnalyzerType(_)));
        assert!(create_analyzer_named("Content", &AnalyzerDeps::default()).is_ok());
    }
}
