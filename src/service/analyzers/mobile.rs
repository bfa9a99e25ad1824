//! Mobile friendliness: viewport, zoom, responsive images, touch icon and
//! load time on mobile.

use std::sync::OnceLock;

use async_trait::async_trait;
use scraper::{Html, Selector};

use super::{prior_lighthouse, Analyzer, AnalyzerState};
use crate::domain::snapshot::cached_selector;
use crate::domain::{AnalyzerMetrics, AnalyzerType, Issue, MetricsShape, MobileMetrics, ResultsMap, WebsiteData};
use crate::error::Result;
use crate::service::context::RunContext;

const SLOW_MOBILE_MS: f64 = 4000.0;
const RESPONSIVE_IMAGE_THRESHOLD: usize = 3;

pub struct MobileAnalyzer {
    state: AnalyzerState,
}

impl MobileAnalyzer {
    pub fn new() -> Self {
        Self {
            state: AnalyzerState::new(AnalyzerType::Mobile),
        }
    }

    fn check_viewport(&mut self, viewport: Option<&str>) -> bool {
        let Some(viewport) = viewport else {
            self.state.flag(
                Issue::high("missing_viewport", "Missing viewport meta tag"),
                "Add <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">",
            );
            return false;
        };

        let normalized = viewport.to_ascii_lowercase().replace(' ', "");
        if !normalized.contains("width=device-width") {
            self.state.flag(
                Issue::medium("viewport_not_device_width", "Viewport missing width=device-width")
                    .with_detail("viewport", viewport),
                "Set width=device-width in the viewport meta tag",
            );
        }

        let zoom_disabled = normalized.contains("user-scalable=no")
            || normalized.contains("user-scalable=0")
            || normalized.contains("maximum-scale=1,")
            || normalized.ends_with("maximum-scale=1")
            || normalized.contains("maximum-scale=1.0");
        if zoom_disabled {
            self.state.flag(
                Issue::medium("zoom_disabled", "Viewport prevents users from zooming"),
                "Allow pinch-zoom by removing user-scalable=no and maximum-scale=1",
            );
        }
        zoom_disabled
    }
}

impl Default for MobileAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn has_touch_icon(html: &str) -> bool {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let selector = cached_selector(&SELECTOR, "link[rel~='apple-touch-icon']");
    Html::parse_document(html).select(selector).next().is_some()
}

#[async_trait]
impl Analyzer for MobileAnalyzer {
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

        let viewport = data.meta("viewport").map(str::to_string);
        let has_viewport = viewport.is_some();
        let zoom_disabled = self.check_viewport(viewport.as_deref());

        let image_count = data.images.len();
        let responsive_images = data
            .images
            .iter()
            .filter(|i| i.srcset.as_deref().is_some_and(|s| !s.trim().is_empty()))
            .count();
        if image_count > RESPONSIVE_IMAGE_THRESHOLD && responsive_images == 0 {
            self.state.flag(
                Issue::low("no_responsive_images", format!("None of {} images use srcset", image_count)),
                "Serve appropriately sized images with srcset/sizes",
            );
        }

        let has_touch_icon = has_touch_icon(&data.html);
        if !has_touch_icon {
            self.state.flag(
                Issue::low("missing_touch_icon", "No apple-touch-icon declared"),
                "Add an apple-touch-icon for home-screen shortcuts",
            );
        }

        // Prefer the measured mobile LCP, then the performance analyzer's view
        let load_time_ms = prior_lighthouse(prior)
            .and_then(|m| m.web_vitals.largest_contentful_paint)
            .or_else(|| {
                prior
                    .get(&AnalyzerType::Performance)
                    .and_then(|r| r.metrics.as_performance())
                    .map(|p| p.load_time_ms)
            })
            .unwrap_or(data.load_time_ms);
        if load_time_ms > SLOW_MOBILE_MS {
            self.state.flag(
                Issue::medium("slow_mobile_load", format!("Main content takes {:.0}ms on mobile", load_time_ms)),
                "Reduce page weight for mobile connections",
            );
        }

        let shape = MetricsShape::Mobile(MobileMetrics {
            has_viewport,
            viewport,
            zoom_disabled,
            responsive_images,
            image_count,
            has_touch_icon,
            load_time_ms,
        });
        let score = self.state.local_score();
        Ok(self.state.finish(shape, Some(score)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WebVitals;
    use crate::test_utils::fixtures;

    #[tokio::test]
    async fn zoom_lock_is_flagged() {
        let mut data = fixtures::well_formed_page();
        data.meta_tags.insert(
            "viewport".into(),
            "width=device-width, initial-scale=1, user-scalable=no".into(),
        );
        let mut analyzer = MobileAnalyzer::new();

        let metrics = analyzer
            .analyze(&RunContext::new(), &data, &ResultsMap::new())
            .await
            .unwrap();

        assert_eq!(metrics.score, Some(90.0));
        assert_eq!(analyzer.issues()[0].issue_type, "zoom_disabled");
    }

    #[tokio::test]
    async fn lighthouse_lcp_drives_mobile_load_time() {
        let data = fixtures::well_formed_page();
        let prior = fixtures::lighthouse_prior_with_vitals(
            &[("performance", 40.0)],
            WebVitals {
                largest_contentful_paint: Some(6100.0),
                ..Default::default()
            },
        );
        let mut analyzer = MobileAnalyzer::new();

        analyzer.analyze(&RunContext::new(), &data, &prior).await.unwrap();

        assert!(analyzer.issues().iter().any(|i| i.issue_type == "slow_mobile_load"));
    }
}
