//! Accessibility checks: alt text, document language, form labels, button
//! names and landmarks.

use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};

use super::{prior_category_score, scoring, Analyzer, AnalyzerState};
use crate::domain::snapshot::cached_selector;
use crate::domain::{
    AccessibilityMetrics, AnalyzerMetrics, AnalyzerType, Issue, MetricsShape, ResultsMap,
    WebsiteData,
};
use crate::error::Result;
use crate::service::context::RunContext;

pub struct AccessibilityAnalyzer {
    state: AnalyzerState,
}

impl AccessibilityAnalyzer {
    pub fn new() -> Self {
        Self {
            state: AnalyzerState::new(AnalyzerType::Accessibility),
        }
    }
}

impl Default for AccessibilityAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, PartialEq)]
struct MarkupFindings {
    form_controls: usize,
    unlabeled_controls: usize,
    buttons_without_text: usize,
    landmark_count: usize,
}

fn has_accessible_name(el: &ElementRef<'_>) -> bool {
    let attr = |name: &str| el.value().attr(name).is_some_and(|v| !v.trim().is_empty());
    attr("aria-label") || attr("aria-labelledby") || attr("title")
}

fn inside_label(el: &ElementRef<'_>) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| a.value().name() == "label")
}

fn inspect_markup(html: &str) -> MarkupFindings {
    static CONTROLS: OnceLock<Selector> = OnceLock::new();
    static LABELS: OnceLock<Selector> = OnceLock::new();
    static BUTTONS: OnceLock<Selector> = OnceLock::new();
    static LANDMARKS: OnceLock<Selector> = OnceLock::new();

    let document = Html::parse_document(html);
    let labelled_ids: HashSet<&str> = document
        .select(cached_selector(&LABELS, "label[for]"))
        .filter_map(|l| l.value().attr("for"))
        .collect();

    let mut findings = MarkupFindings::default();

    for control in document.select(cached_selector(&CONTROLS, "input, select, textarea")) {
        let input_type = control.value().attr("type").unwrap_or("text").to_ascii_lowercase();
        if matches!(input_type.as_str(), "hidden" | "submit" | "button" | "reset" | "image") {
            continue;
        }
        findings.form_controls += 1;

        let labelled_by_for = control
            .value()
            .id()
            .is_some_and(|id| labelled_ids.contains(id));
        if !(labelled_by_for || inside_label(&control) || has_accessible_name(&control)) {
            findings.unlabeled_controls += 1;
        }
    }

    for button in document.select(cached_selector(&BUTTONS, "button, [role='button']")) {
        let text = button.text().collect::<String>();
        if text.trim().is_empty() && !has_accessible_name(&button) {
            findings.buttons_without_text += 1;
        }
    }

    findings.landmark_count = document
        .select(cached_selector(
            &LANDMARKS,
            "main, nav, header, footer, aside, [role='main'], [role='navigation'], [role='banner'], [role='contentinfo']",
        ))
        .count();

    findings
}

#[async_trait]
impl Analyzer for AccessibilityAnalyzer {
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

        let images_total = data.images.len();
        // alt="" is valid for decorative images, only a missing attribute counts
        let images_missing_alt = data.images.iter().filter(|i| i.alt.is_none()).count();
        if images_missing_alt > 0 {
            self.state.flag(
                Issue::high(
                    "images_missing_alt",
                    format!("{} of {} images have no alt attribute", images_missing_alt, images_total),
                )
                .with_detail("count", images_missing_alt),
                "Add alt text to informative images and alt=\"\" to decorative ones",
            );
        }

        let has_lang = data.lang.as_deref().is_some_and(|l| !l.trim().is_empty());
        if !has_lang {
            self.state.flag(
                Issue::medium("missing_lang", "The <html> element has no lang attribute"),
                "Declare the page language with <html lang=\"...\">",
            );
        }

        let findings = inspect_markup(&data.html);
        if findings.unlabeled_controls > 0 {
            self.state.flag(
                Issue::high(
                    "unlabeled_form_controls",
                    format!("{} form controls have no label", findings.unlabeled_controls),
                )
                .with_detail("count", findings.unlabeled_controls),
                "Associate every form control with a <label> or aria-label",
            );
        }
        if findings.buttons_without_text > 0 {
            self.state.flag(
                Issue::medium(
                    "buttons_without_text",
                    format!("{} buttons have no accessible name", findings.buttons_without_text),
                ),
                "Give icon-only buttons an aria-label",
            );
        }
        if findings.landmark_count == 0 {
            self.state.flag(
                Issue::low("no_landmarks", "No landmark regions found"),
                "Use landmark elements so screen-reader users can navigate by region",
            );
        }

        let skipped = prior
            .get(&AnalyzerType::Structure)
            .and_then(|r| r.metrics.as_structure())
            .map(|s| s.skipped_heading_levels)
            .unwrap_or(0);
        if skipped > 0 {
            self.state.flag(
                Issue::low("heading_order", "Heading levels are skipped, confusing assistive technology"),
                "Keep headings in sequential order",
            );
        }

        let local_score = self.state.local_score();
        let lighthouse_score = prior_category_score(prior, "accessibility");
        let score = scoring::blend(lighthouse_score, local_score);

        let shape = MetricsShape::Accessibility(AccessibilityMetrics {
            images_total,
            images_missing_alt,
            form_controls: findings.form_controls,
            unlabeled_controls: findings.unlabeled_controls,
            buttons_without_text: findings.buttons_without_text,
            has_lang,
            landmark_count: findings.landmark_count,
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

    #[test]
    fn finds_unlabeled_controls() {
        let html = r#"<html><body><main>
            <label for="email">Email</label><input id="email" type="email">
            <label>Name <input name="name"></label>
            <input name="search" aria-label="Search">
            <input name="phone">
            <input type="hidden" name="csrf">
            <textarea name="msg"></textarea>
            <button></button>
            <button aria-label="Close"></button>
            <button>Send</button>
        </main></body></html>"#;

        let findings = inspect_markup(html);
        assert_eq!(
            findings,
            MarkupFindings {
                form_controls: 5,
                unlabeled_controls: 2,
                buttons_without_text: 1,
                landmark_count: 1,
            }
        );
    }

    #[tokio::test]
    async fn structure_prior_adds_heading_order_issue() {
        let data = fixtures::well_formed_page();
        let prior = fixtures::structure_prior(2);
        let mut analyzer = AccessibilityAnalyzer::new();

        let metrics = analyzer.analyze(&RunContext::new(), &data, &prior).await.unwrap();

        let kinds: Vec<&str> = analyzer.issues().iter().map(|i| i.issue_type.as_str()).collect();
        assert_eq!(kinds, vec!["heading_order"]);
        assert_eq!(metrics.score, Some(95.0));
    }
}
