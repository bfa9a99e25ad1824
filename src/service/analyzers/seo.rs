//! On-page SEO checks: title, meta description, headings, canonical,
//! indexability, social tags and link profile.

use std::sync::OnceLock;

use async_trait::async_trait;
use scraper::{Html, Selector};

use super::{prior_category_score, scoring, Analyzer, AnalyzerState};
use crate::domain::snapshot::cached_selector;
use crate::domain::{AnalyzerMetrics, AnalyzerType, Issue, MetricsShape, ResultsMap, SeoMetrics, WebsiteData};
use crate::error::Result;
use crate::service::context::RunContext;

const TITLE_MIN: usize = 30;
const TITLE_MAX: usize = 60;
const DESCRIPTION_MIN: usize = 70;
const DESCRIPTION_MAX: usize = 160;

pub struct SeoAnalyzer {
    state: AnalyzerState,
}

impl SeoAnalyzer {
    pub fn new() -> Self {
        Self {
            state: AnalyzerState::new(AnalyzerType::Seo),
        }
    }

    fn check_title(&mut self, data: &WebsiteData) -> usize {
        let title = data.title.as_deref().map(str::trim).unwrap_or_default();
        let len = title.chars().count();

        if len == 0 {
            self.state.flag(
                Issue::high("missing_title", "Missing document title"),
                "Add a descriptive <title> of 30-60 characters",
            );
        } else if len < TITLE_MIN {
            self.state.flag(
                Issue::medium("title_too_short", format!("Title too short ({} chars, recommend 30-60)", len))
                    .with_detail("length", len),
                "Expand the title to 30-60 characters with the primary keyword",
            );
        } else if len > TITLE_MAX {
            self.state.flag(
                Issue::low("title_too_long", format!("Title too long ({} chars, recommend 30-60)", len))
                    .with_detail("length", len),
                "Shorten the title to at most 60 characters so it is not truncated",
            );
        }
        len
    }

    fn check_description(&mut self, data: &WebsiteData) -> usize {
        let description = data.meta("description").map(str::trim).unwrap_or_default();
        let len = description.chars().count();

        if len == 0 {
            self.state.flag(
                Issue::high("missing_meta_description", "Missing meta description"),
                "Add a meta description of 70-160 characters",
            );
        } else if len < DESCRIPTION_MIN {
            self.state.flag(
                Issue::medium(
                    "meta_description_too_short",
                    format!("Description too short ({} chars, recommend 70-160)", len),
                )
                .with_detail("length", len),
                "Expand the meta description to 70-160 characters",
            );
        } else if len > DESCRIPTION_MAX {
            self.state.flag(
                Issue::low(
                    "meta_description_too_long",
                    format!("Description too long ({} chars, recommend 70-160)", len),
                )
                .with_detail("length", len),
                "Trim the meta description to at most 160 characters",
            );
        }
        len
    }

    fn check_h1(&mut self, data: &WebsiteData) -> usize {
        let count = data.headings_at(1).count();
        match count {
            0 => self.state.flag(
                Issue::high("missing_h1", "Page has no H1 heading"),
                "Add exactly one H1 that describes the page",
            ),
            1 => {}
            n => self.state.flag(
                Issue::low("multiple_h1", format!("Page has {} H1 headings", n)).with_detail("count", n),
                "Use a single H1 and demote the others to H2",
            ),
        }
        count
    }

    fn check_indexability(&mut self, data: &WebsiteData) -> bool {
        let robots = data.meta("robots").unwrap_or_default().to_ascii_lowercase();
        let header = data.header("x-robots-tag").unwrap_or_default().to_ascii_lowercase();
        let blocked = robots.contains("noindex") || header.contains("noindex");
        if blocked {
            self.state.flag(
                Issue::high("noindex", "Page is excluded from indexing (noindex)"),
                "Remove the noindex directive if the page should appear in search results",
            );
        }
        !blocked
    }
}

impl Default for SeoAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn has_canonical(html: &str) -> bool {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let selector = cached_selector(&SELECTOR, "link[rel='canonical']");
    Html::parse_document(html)
        .select(selector)
        .any(|el| el.value().attr("href").is_some_and(|h| !h.trim().is_empty()))
}

#[async_trait]
impl Analyzer for SeoAnalyzer {
    fn state(&self) -> &AnalyzerState {
        &self.state
    }

    async fn analyze(
        &mut self,
        _ctx: &RunContext,
        data: &WebsiteData,
        prior: &ResultsMap,
    ) -> Result<AnalyzerMetrics> {
        self.state.reset();

        let title_length = self.check_title(data);
        let meta_description_length = self.check_description(data);
        let h1_count = self.check_h1(data);
        let is_indexable = self.check_indexability(data);

        let has_canonical = has_canonical(&data.html);
        if !has_canonical {
            self.state.flag(
                Issue::low("missing_canonical", "No canonical URL declared"),
                "Add <link rel=\"canonical\"> to avoid duplicate-content dilution",
            );
        }

        let has_open_graph = data.meta("og:title").is_some() && data.meta("og:description").is_some();
        if !has_open_graph {
            self.state.flag(
                Issue::low("missing_open_graph", "Open Graph title/description tags are missing"),
                "Add og:title and og:description for richer social previews",
            );
        }

        let images_missing_alt = data
            .images
            .iter()
            .filter(|i| i.alt.as_deref().map_or(true, |a| a.trim().is_empty()))
            .count();
        if images_missing_alt > 0 {
            self.state.flag(
                Issue::medium("images_missing_alt", format!("{} images lack alt text", images_missing_alt))
                    .with_detail("count", images_missing_alt),
                "Describe every meaningful image with alt text",
            );
        }

        let internal_links = data.links.iter().filter(|l| l.is_internal).count();
        let external_links = data.links.len() - internal_links;

        let local_score = self.state.local_score();
        let lighthouse_score = prior_category_score(prior, "seo");
        let score = scoring::blend(lighthouse_score, local_score);

        tracing::debug!(
            "[SEO] {} - local {:.1}, lighthouse {:?}, final {:.1}",
            data.url,
            local_score,
            lighthouse_score,
            score
        );

        let shape = MetricsShape::Seo(SeoMetrics {
            title_length,
            meta_description_length,
            h1_count,
            has_canonical,
            is_indexable,
            has_open_graph,
            images_missing_alt,
            internal_links,
            external_links,
            local_score,
            lighthouse_score,
        });
        Ok(self.state.finish(shape, Some(score)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures;

    #[tokio::test]
    async fn well_formed_page_scores_high() {
        let data = fixtures::well_formed_page();
        let mut analyzer = SeoAnalyzer::new();

        let metrics = analyzer
            .analyze(&RunContext::new(), &data, &ResultsMap::new())
            .await
            .unwrap();

        assert_eq!(metrics.score, Some(100.0), "issues: {:?}", analyzer.issues());
        assert!(analyzer.recommendations().is_empty());
    }

    #[tokio::test]
    async fn bare_page_reports_missing_basics() {
        let data = fixtures::bare_page();
        let mut analyzer = SeoAnalyzer::new();

        analyzer
            .analyze(&RunContext::new(), &data, &ResultsMap::new())
            .await
            .unwrap();

        let kinds: Vec<&str> = analyzer.issues().iter().map(|i| i.issue_type.as_str()).collect();
        assert!(kinds.contains(&"missing_title"));
        assert!(kinds.contains(&"missing_meta_description"));
        assert!(kinds.contains(&"missing_h1"));
    }

    #[tokio::test]
    async fn lighthouse_score_is_blended() {
        let data = fixtures::well_formed_page();
        let prior = fixtures::lighthouse_prior(&[("seo", 60.0)]);
        let mut analyzer = SeoAnalyzer::new();

        let metrics = analyzer.analyze(&RunContext::new(), &data, &prior).await.unwrap();

        // 0.75 * 60 + 0.25 * 100
        assert_eq!(metrics.score, Some(70.0));
    }

    #[tokio::test]
    async fn rerun_replaces_previous_output() {
        let mut analyzer = SeoAnalyzer::new();
        let ctx = RunContext::new();
        analyzer.analyze(&ctx, &fixtures::bare_page(), &ResultsMap::new()).await.unwrap();
        analyzer.analyze(&ctx, &fixtures::well_formed_page(), &ResultsMap::new()).await.unwrap();
        assert!(analyzer.issues().is_empty());
    }
}
