//! Document outline: heading hierarchy, semantic landmarks and link text.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use scraper::{Html, Selector};

use super::{Analyzer, AnalyzerState};
use crate::domain::snapshot::cached_selector;
use crate::domain::{
    AnalyzerMetrics, AnalyzerType, Heading, Issue, MetricsShape, ResultsMap, StructureMetrics,
    WebsiteData,
};
use crate::error::Result;
use crate::service::context::RunContext;

const SEMANTIC_ELEMENTS: [&str; 7] = ["header", "nav", "main", "article", "section", "aside", "footer"];

pub struct StructureAnalyzer {
    state: AnalyzerState,
}

impl StructureAnalyzer {
    pub fn new() -> Self {
        Self {
            state: AnalyzerState::new(AnalyzerType::Structure),
        }
    }
}

impl Default for StructureAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of times the outline jumps down more than one level (h2 -> h4).
pub(crate) fn skipped_levels(headings: &[Heading]) -> usize {
    let mut previous: Option<u8> = None;
    let mut skips = 0;
    for heading in headings {
        if let Some(prev) = previous {
            if heading.level > prev.saturating_add(1) {
                skips += 1;
            }
        }
        previous = Some(heading.level);
    }
    skips
}

fn semantic_elements(html: &str) -> Vec<String> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let selector = cached_selector(&SELECTOR, "header, nav, main, article, section, aside, footer");

    let document = Html::parse_document(html);
    let mut found: Vec<String> = document
        .select(selector)
        .map(|el| el.value().name().to_string())
        .collect();
    found.sort_by_key(|name| SEMANTIC_ELEMENTS.iter().position(|s| *s == name.as_str()));
    found.dedup();
    found
}

#[async_trait]
impl Analyzer for StructureAnalyzer {
    fn state(&self) -> &AnalyzerState {
        &self.state
    }

    async fn analyze(
        &mut self,
        _ctx: &RunContext,
        data: &WebsiteData,
        _prior: &ResultsMap,
    ) -> Result<AnalyzerMetrics> {
        self.state.reset();

        let mut heading_counts = BTreeMap::new();
        for heading in &data.headings {
            *heading_counts.entry(format!("h{}", heading.level)).or_insert(0) += 1;
        }

        if data.headings.is_empty() {
            self.state.flag(
                Issue::medium("no_headings", "Page has no headings"),
                "Organise content under a clear heading hierarchy",
            );
        } else if data.headings.first().is_some_and(|h| h.level != 1) {
            self.state.flag(
                Issue::low("outline_not_starting_at_h1", "The first heading is not an H1"),
                "Start the document outline with an H1",
            );
        }

        let skipped_heading_levels = skipped_levels(&data.headings);
        if skipped_heading_levels > 0 {
            self.state.flag(
                Issue::medium(
                    "heading_levels_skipped",
                    format!("Heading hierarchy skips a level {} time(s)", skipped_heading_levels),
                )
                .with_detail("count", skipped_heading_levels),
                "Do not skip heading levels (e.g. H2 followed by H4)",
            );
        }

        let semantic_elements = semantic_elements(&data.html);
        if semantic_elements.is_empty() {
            self.state.flag(
                Issue::medium("no_semantic_elements", "No HTML5 sectioning elements found"),
                "Use <header>, <nav>, <main> and <footer> instead of generic <div>s",
            );
        } else if !semantic_elements.iter().any(|e| e == "main") {
            self.state.flag(
                Issue::low("missing_main", "No <main> element"),
                "Wrap the primary content in a <main> element",
            );
        }

        let internal_links = data.links.iter().filter(|l| l.is_internal).count();
        let external_links = data.links.len() - internal_links;
        if internal_links == 0 {
            self.state.flag(
                Issue::low("no_internal_links", "Page does not link to other pages on the site"),
                "Link to related pages to help crawlers and visitors",
            );
        }

        let empty_link_text = data
            .links
            .iter()
            .filter(|l| l.text.as_deref().map_or(true, |t| t.trim().is_empty()))
            .count();
        if empty_link_text > 0 {
            self.state.flag(
                Issue::low("empty_link_text", format!("{} links have no text", empty_link_text))
                    .with_detail("count", empty_link_text),
                "Give every link descriptive text",
            );
        }

        let shape = MetricsShape::Structure(StructureMetrics {
            heading_counts,
            skipped_heading_levels,
            semantic_elements,
            internal_links,
            external_links,
            empty_link_text,
        });
        let score = self.state.local_score();
        Ok(self.state.finish(shape, Some(score)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures;

    fn h(level: u8) -> Heading {
        Heading {
            level,
            text: format!("Heading {}", level),
        }
    }

    #[test]
    fn counts_skipped_levels() {
        assert_eq!(skipped_levels(&[h(1), h(2), h(3), h(2), h(3)]), 0);
        assert_eq!(skipped_levels(&[h(1), h(3), h(4), h(6)]), 2);
        assert_eq!(skipped_levels(&[]), 0);
    }

    #[tokio::test]
    async fn well_formed_outline_has_no_issues() {
        let data = fixtures::well_formed_page();
        let mut analyzer = StructureAnalyzer::new();

        let metrics = analyzer
            .analyze(&RunContext::new(), &data, &ResultsMap::new())
            .await
            .unwrap();

        assert!(analyzer.issues().is_empty(), "{:?}", analyzer.issues());
        let structure = metrics.as_structure().unwrap();
        assert!(structure.semantic_elements.contains(&"main".to_string()));
        assert_eq!(structure.heading_counts.get("h1"), Some(&1));
    }

    #[tokio::test]
    async fn div_soup_is_flagged() {
        let data = fixtures::bare_page();
        let mut analyzer = StructureAnalyzer::new();

        analyzer
            .analyze(&RunContext::new(), &data, &ResultsMap::new())
            .await
            .unwrap();

        assert!(analyzer.issues().iter().any(|i| i.issue_type == "no_semantic_elements"));
    }
}
