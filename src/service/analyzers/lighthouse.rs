//! External Lighthouse audit. Runs first so every other analyzer can blend
//! its category score.

use async_trait::async_trait;

use super::{Analyzer, AnalyzerState};
use crate::domain::{AnalyzerMetrics, AnalyzerType, LighthouseMetrics, MetricsShape, ResultsMap, WebsiteData};
use crate::error::Result;
use crate::service::context::RunContext;
use crate::service::lighthouse::LighthouseClient;

pub struct LighthouseAnalyzer {
    state: AnalyzerState,
    client: LighthouseClient,
}

impl LighthouseAnalyzer {
    pub fn new(client: LighthouseClient) -> Self {
        Self {
            state: AnalyzerState::new(AnalyzerType::Lighthouse),
            client,
        }
    }
}

#[async_trait]
impl Analyzer for LighthouseAnalyzer {
    fn state(&self) -> &AnalyzerState {
        &self.state
    }

    async fn analyze(
        &mut self,
        ctx: &RunContext,
        data: &WebsiteData,
        _prior: &ResultsMap,
    ) -> Result<AnalyzerMetrics> {
        self.state.reset();

        let outcome = self.client.audit(ctx, &data.url).await?;
        let report = outcome.value;

        for issue in report.issues.iter().cloned() {
            self.state.add_issue(issue);
        }
        for recommendation in &report.recommendations {
            self.state.add_recommendation(recommendation.as_str());
        }

        // Mean of the category scores Lighthouse returned
        let score = if report.scores.is_empty() {
            None
        } else {
            Some(report.scores.values().sum::<f64>() / report.scores.len() as f64)
        };

        let shape = MetricsShape::Lighthouse(LighthouseMetrics {
            final_url: report.final_url,
            strategy: report.strategy,
            categories: report.scores,
            web_vitals: report.web_vitals,
            audits_total: report.audits.len(),
            audits_failed: report.audits.values().filter(|a| !a.passed).count(),
            cached: outcome.cached_result,
            lighthouse_version: report.lighthouse_version,
        });

        let mut metrics = AnalyzerMetrics::new(shape, score).with_extra("attempts", outcome.attempts);
        if !outcome.failed_parts.is_empty() {
            metrics = metrics.with_extra("failed_categories", outcome.failed_parts);
        }
        Ok(self.state.finish_with(metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::lighthouse::{LighthouseBackend, LighthouseCategory, LighthouseReport, Strategy};
    use crate::service::resilient::{MemoryCache, ResilientClient};
    use crate::test_utils::fixtures;
    use crate::domain::Issue;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct StaticBackend;

    #[async_trait]
    impl LighthouseBackend for StaticBackend {
        async fn audit(
            &self,
            url: &str,
            category: LighthouseCategory,
            strategy: Strategy,
        ) -> anyhow::Result<LighthouseReport> {
            let score = match category {
                LighthouseCategory::Performance => 60.0,
                _ => 90.0,
            };
            Ok(LighthouseReport {
                final_url: url.to_string(),
                strategy: strategy.as_str().into(),
                scores: BTreeMap::from([(category.as_str().to_string(), score)]),
                issues: vec![Issue::medium("lighthouse_render_blocking", "Render-blocking resources")],
                recommendations: vec!["Eliminate render-blocking resources".into()],
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn report_becomes_metrics() {
        let client = LighthouseClient::new(
            Arc::new(StaticBackend),
            ResilientClient::new("lighthouse").with_cache(Arc::new(MemoryCache::new())),
        );
        let mut analyzer = LighthouseAnalyzer::new(client);
        let data = fixtures::well_formed_page();

        let metrics = analyzer
            .analyze(&RunContext::new(), &data, &ResultsMap::new())
            .await
            .unwrap();

        let lighthouse = metrics.as_lighthouse().unwrap();
        assert_eq!(lighthouse.categories.len(), 4);
        assert_eq!(metrics.score, Some(82.5));
        // four identical recommendations collapse into one
        assert_eq!(analyzer.recommendations().len(), 1);
        assert_eq!(analyzer.issues().len(), 4);
        assert_eq!(analyzer.priority(), 100);
    }
}
