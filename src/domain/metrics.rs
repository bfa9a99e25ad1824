//! Typed metric shapes reported by each analyzer.
//!
//! Every shape serializes flat next to `score` and the free-form `extra`
//! side-map, so the JSON a consumer sees is a single object per analyzer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Core Web Vitals and timing metrics, in milliseconds except CLS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebVitals {
    pub first_contentful_paint: Option<f64>,
    pub largest_contentful_paint: Option<f64>,
    pub speed_index: Option<f64>,
    pub time_to_interactive: Option<f64>,
    pub total_blocking_time: Option<f64>,
    pub cumulative_layout_shift: Option<f64>,
}

impl WebVitals {
    /// Fill every missing field from `other`; present fields are kept.
    pub fn fill_from(&mut self, other: &WebVitals) {
        fn first(a: &mut Option<f64>, b: Option<f64>) {
            if a.is_none() {
                *a = b;
            }
        }
        first(&mut self.first_contentful_paint, other.first_contentful_paint);
        first(&mut self.largest_contentful_paint, other.largest_contentful_paint);
        first(&mut self.speed_index, other.speed_index);
        first(&mut self.time_to_interactive, other.time_to_interactive);
        first(&mut self.total_blocking_time, other.total_blocking_time);
        first(&mut self.cumulative_layout_shift, other.cumulative_layout_shift);
    }

    pub fn is_empty(&self) -> bool {
        *self == WebVitals::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeoMetrics {
    pub title_length: usize,
    pub meta_description_length: usize,
    pub h1_count: usize,
    pub has_canonical: bool,
    pub is_indexable: bool,
    pub has_open_graph: bool,
    pub images_missing_alt: usize,
    pub internal_links: usize,
    pub external_links: usize,
    pub local_score: f64,
    pub lighthouse_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub load_time_ms: f64,
    pub html_size_bytes: usize,
    pub script_count: usize,
    pub render_blocking_scripts: usize,
    pub stylesheet_count: usize,
    pub image_count: usize,
    pub images_without_dimensions: usize,
    pub images_lazy_loaded: usize,
    pub web_vitals: Option<WebVitals>,
    pub local_score: f64,
    pub lighthouse_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructureMetrics {
    pub heading_counts: BTreeMap<String, usize>,
    pub skipped_heading_levels: usize,
    pub semantic_elements: Vec<String>,
    pub internal_links: usize,
    pub external_links: usize,
    pub empty_link_text: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccessibilityMetrics {
    pub images_total: usize,
    pub images_missing_alt: usize,
    pub form_controls: usize,
    pub unlabeled_controls: usize,
    pub buttons_without_text: usize,
    pub has_lang: bool,
    pub landmark_count: usize,
    pub local_score: f64,
    pub lighthouse_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SecurityMetrics {
    pub https: bool,
    pub mixed_content: Vec<String>,
    pub missing_headers: Vec<String>,
    pub unsafe_blank_targets: usize,
    pub local_score: f64,
    pub lighthouse_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MobileMetrics {
    pub has_viewport: bool,
    pub viewport: Option<String>,
    pub zoom_disabled: bool,
    pub responsive_images: usize,
    pub image_count: usize,
    pub has_touch_icon: bool,
    pub load_time_ms: f64,
}

/// Readability figures handed to the content-improvement service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadabilityMetrics {
    pub sentence_count: usize,
    pub avg_sentence_length: f64,
    pub avg_syllables_per_word: f64,
    pub flesch_reading_ease: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordDensity {
    pub keyword: String,
    pub count: usize,
    pub density: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContentMetrics {
    pub word_count: usize,
    pub paragraph_count: usize,
    pub readability: ReadabilityMetrics,
    pub top_keywords: Vec<KeywordDensity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LighthouseMetrics {
    pub final_url: String,
    pub strategy: String,
    /// Category id to score on a 0-100 scale
    pub categories: BTreeMap<String, f64>,
    pub web_vitals: WebVitals,
    pub audits_total: usize,
    pub audits_failed: usize,
    pub cached: bool,
    pub lighthouse_version: String,
}

/// One variant per analyzer category.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricsShape {
    Seo(SeoMetrics),
    Performance(PerformanceMetrics),
    Structure(StructureMetrics),
    Accessibility(AccessibilityMetrics),
    Security(SecurityMetrics),
    Mobile(MobileMetrics),
    Content(ContentMetrics),
    Lighthouse(LighthouseMetrics),
    /// Used by analyzers that only report a score and extras
    Empty,
}

/// Typed metrics plus a forward-compatible side-map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzerMetrics {
    pub score: Option<f64>,
    #[serde(flatten)]
    pub shape: MetricsShape,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnalyzerMetrics {
    pub fn new(shape: MetricsShape, score: Option<f64>) -> Self {
        Self {
            score,
            shape,
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn as_lighthouse(&self) -> Option<&LighthouseMetrics> {
        match &self.shape {
            MetricsShape::Lighthouse(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_content(&self) -> Option<&ContentMetrics> {
        match &self.shape {
            MetricsShape::Content(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_performance(&self) -> Option<&PerformanceMetrics> {
        match &self.shape {
            MetricsShape::Performance(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&StructureMetrics> {
        match &self.shape {
            MetricsShape::Structure(m) => Some(m),
            _ => None,
        }
    }
}
