//! Page weight, render-blocking resources and Core Web Vitals.

use async_trait::async_trait;

use super::{prior_lighthouse, scoring, Analyzer, AnalyzerState};
use crate::domain::{
    AnalyzerMetrics, AnalyzerType, Issue, MetricsShape, PerformanceMetrics, ResultsMap, WebVitals,
    WebsiteData,
};
use crate::error::Result;
use crate::service::context::RunContext;

const SLOW_LOAD_MS: f64 = 3000.0;
const SLUGGISH_LOAD_MS: f64 = 1500.0;
const HEAVY_HTML_BYTES: usize = 500 * 1024;
const MANY_SCRIPTS: usize = 15;
const MANY_STYLESHEETS: usize = 5;
const LAZY_LOAD_THRESHOLD: usize = 5;

pub struct PerformanceAnalyzer {
    state: AnalyzerState,
}

impl PerformanceAnalyzer {
    pub fn new() -> Self {
        Self {
            state: AnalyzerState::new(AnalyzerType::Performance),
        }
    }

    fn check_load_time(&mut self, load_time_ms: f64) {
        if load_time_ms > SLOW_LOAD_MS {
            self.state.flag(
                Issue::high("slow_load", format!("Page took {:.0}ms to load", load_time_ms))
                    .with_detail("load_time_ms", load_time_ms),
                "Reduce server response time and defer non-critical resources",
            );
        } else if load_time_ms > SLUGGISH_LOAD_MS {
            self.state.flag(
                Issue::medium("sluggish_load", format!("Page took {:.0}ms to load", load_time_ms))
                    .with_detail("load_time_ms", load_time_ms),
                "Aim for a load time under 1.5 seconds",
            );
        }
    }

    // Thresholds follow the published "good / needs improvement" boundaries.
    fn check_vitals(&mut self, vitals: &WebVitals) {
        if let Some(lcp) = vitals.largest_contentful_paint {
            if lcp > 4000.0 {
                self.state.flag(
                    Issue::high("poor_lcp", format!("Largest Contentful Paint is {:.0}ms", lcp)),
                    "Optimise the largest above-the-fold element (image size, preload, server time)",
                );
            } else if lcp > 2500.0 {
                self.state.flag(
                    Issue::medium("lcp_needs_improvement", format!("Largest Contentful Paint is {:.0}ms", lcp)),
                    "Optimise the largest above-the-fold element (image size, preload, server time)",
                );
            }
        }
        if let Some(cls) = vitals.cumulative_layout_shift {
            if cls > 0.25 {
                self.state.flag(
                    Issue::high("poor_cls", format!("Cumulative Layout Shift is {:.2}", cls)),
                    "Reserve space for images, ads and embeds to stop layout shifts",
                );
            } else if cls > 0.1 {
                self.state.flag(
                    Issue::medium("cls_needs_improvement", format!("Cumulative Layout Shift is {:.2}", cls)),
                    "Reserve space for images, ads and embeds to stop layout shifts",
                );
            }
        }
        if let Some(tbt) = vitals.total_blocking_time {
            if tbt > 600.0 {
                self.state.flag(
                    Issue::high("high_blocking_time", format!("Total Blocking Time is {:.0}ms", tbt)),
                    "Split long JavaScript tasks and remove unused code",
                );
            } else if tbt > 200.0 {
                self.state.flag(
                    Issue::medium("blocking_time", format!("Total Blocking Time is {:.0}ms", tbt)),
                    "Split long JavaScript tasks and remove unused code",
                );
            }
        }
    }
}

impl Default for PerformanceAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Analyzer for PerformanceAnalyzer {
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

        self.check_load_time(data.load_time_ms);

        let html_size_bytes = data.html.len();
        if html_size_bytes > HEAVY_HTML_BYTES {
            self.state.flag(
                Issue::medium("large_html", format!("HTML document is {} KB", html_size_bytes / 1024))
                    .with_detail("bytes", html_size_bytes),
                "Reduce inline markup, scripts and styles in the HTML document",
            );
        }

        let render_blocking_scripts = data.scripts.iter().filter(|s| s.is_render_blocking()).count();
        if render_blocking_scripts > 0 {
            self.state.flag(
                Issue::medium(
                    "render_blocking_scripts",
                    format!("{} render-blocking scripts in <head>", render_blocking_scripts),
                )
                .with_detail("count", render_blocking_scripts),
                "Add async or defer to scripts in <head>",
            );
        }

        let script_count = data.scripts.iter().filter(|s| s.src.is_some()).count();
        if script_count > MANY_SCRIPTS {
            self.state.flag(
                Issue::low("too_many_scripts", format!("{} external scripts", script_count)),
                "Bundle scripts to reduce the number of requests",
            );
        }

        let stylesheet_count = data.stylesheets.len();
        if stylesheet_count > MANY_STYLESHEETS {
            self.state.flag(
                Issue::low("too_many_stylesheets", format!("{} stylesheets", stylesheet_count)),
                "Combine stylesheets and inline critical CSS",
            );
        }

        let image_count = data.images.len();
        let images_without_dimensions = data
            .images
            .iter()
            .filter(|i| i.width.is_none() || i.height.is_none())
            .count();
        if images_without_dimensions > 0 {
            self.state.flag(
                Issue::low(
                    "images_without_dimensions",
                    format!("{} images have no explicit width/height", images_without_dimensions),
                ),
                "Set width and height on images to prevent layout shifts",
            );
        }

        let images_lazy_loaded = data
            .images
            .iter()
            .filter(|i| i.loading.as_deref() == Some("lazy"))
            .count();
        if image_count > LAZY_LOAD_THRESHOLD && images_lazy_loaded == 0 {
            self.state.flag(
                Issue::low("no_lazy_loading", format!("None of {} images are lazy-loaded", image_count)),
                "Use loading=\"lazy\" for below-the-fold images",
            );
        }

        let lighthouse = prior_lighthouse(prior);
        let web_vitals = lighthouse.map(|m| m.web_vitals.clone()).filter(|v| !v.is_empty());
        if let Some(vitals) = &web_vitals {
            self.check_vitals(vitals);
        }

        let local_score = self.state.local_score();
        let lighthouse_score = lighthouse.and_then(|m| m.categories.get("performance").copied());
        let score = scoring::blend(lighthouse_score, local_score);

        let shape = MetricsShape::Performance(PerformanceMetrics {
            load_time_ms: data.load_time_ms,
            html_size_bytes,
            script_count,
            render_blocking_scripts,
            stylesheet_count,
            image_count,
            images_without_dimensions,
            images_lazy_loaded,
            web_vitals,
            local_score,
            lighthouse_score,
        });
        Ok(self.state.finish(shape, Some(score)))
    }
}
