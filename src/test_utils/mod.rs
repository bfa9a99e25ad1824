//! Shared test utilities and fixtures
//!
//! Used by the unit tests, the integration tests under `tests/` and the
//! benches, so this module is compiled into the library.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::domain::{AnalyzerMetrics, AnalyzerType, Issue, MetricsShape, ResultsMap, WebsiteData};
use crate::error::{AnalysisError, Result};
use crate::service::analyzers::{Analyzer, AnalyzerState};
use crate::service::context::RunContext;

pub mod fixtures {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::domain::*;

    const PARAGRAPH: &str = "Our small team builds fast web pages for local shops. \
        We test each page on real phones. Good pages load quickly and read well. \
        Clear titles help people find what they need. We write short text and use plain words. \
        Every image gets a clear label.";

    const WELL_FORMED_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <title>Example Shop | Fast, Friendly Web Pages</title>
  <meta name="description" content="We build fast, accessible web pages for local shops and test every page on real phones before launch.">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <meta property="og:title" content="Example Shop">
  <meta property="og:description" content="Fast, friendly web pages for local shops.">
  <link rel="canonical" href="https://example.com/">
  <link rel="apple-touch-icon" href="/apple-touch-icon.png">
  <link rel="stylesheet" href="https://example.com/style.css">
  <script src="/app.js" defer></script>
</head>
<body>
  <header><nav><a href="/services">Our services</a> <a href="/contact">Contact us</a></nav></header>
  <main>
    <h1>Fast web pages for local shops</h1>
    <h2>What we do</h2>
    <p>Our small team builds fast web pages for local shops.</p>
    <h3>Testing</h3>
    <p>We test each page on real phones.</p>
    <img src="https://example.com/img/team.jpg" alt="Our team at work" width="640" height="480">
    <img src="https://example.com/img/shop.jpg" alt="A local shop front" width="640" height="480">
    <h2>Get in touch</h2>
    <form><label for="q">Search</label><input id="q" type="search"><button>Go</button></form>
    <a href="https://partner.example.org/" target="_blank" rel="noopener noreferrer">Our partner</a>
  </main>
  <footer><p>Example Shop</p></footer>
</body>
</html>"#;

    fn heading(level: u8, text: &str) -> Heading {
        Heading {
            level,
            text: text.to_string(),
        }
    }

    fn link(href: &str, text: &str, is_internal: bool) -> Link {
        Link {
            href: href.to_string(),
            text: Some(text.to_string()),
            rel: None,
            target: None,
            is_internal,
        }
    }

    fn image(src: &str, alt: &str) -> Image {
        Image {
            src: src.to_string(),
            alt: Some(alt.to_string()),
            width: Some(640),
            height: Some(480),
            loading: None,
            srcset: None,
        }
    }

    /// A page every local analyzer accepts without issues.
    pub fn well_formed_page() -> WebsiteData {
        let meta_tags = BTreeMap::from([
            (
                "description".to_string(),
                "We build fast, accessible web pages for local shops and test every page on real phones before launch."
                    .to_string(),
            ),
            ("viewport".to_string(), "width=device-width, initial-scale=1".to_string()),
            ("og:title".to_string(), "Example Shop".to_string()),
            (
                "og:description".to_string(),
                "Fast, friendly web pages for local shops.".to_string(),
            ),
        ]);

        let mut partner = link("https://partner.example.org/", "Our partner", false);
        partner.target = Some("_blank".into());
        partner.rel = Some("noopener noreferrer".into());

        WebsiteData {
            url: "https://example.com/".into(),
            title: Some("Example Shop | Fast, Friendly Web Pages".into()),
            lang: Some("en".into()),
            headings: vec![
                heading(1, "Fast web pages for local shops"),
                heading(2, "What we do"),
                heading(3, "Testing"),
                heading(2, "Get in touch"),
            ],
            meta_tags,
            links: vec![
                link("https://example.com/services", "Our services", true),
                link("https://example.com/contact", "Contact us", true),
                partner,
            ],
            images: vec![
                image("https://example.com/img/team.jpg", "Our team at work"),
                image("https://example.com/img/shop.jpg", "A local shop front"),
            ],
            scripts: vec![Script {
                src: Some("/app.js".into()),
                is_async: false,
                is_defer: true,
                in_head: true,
            }],
            stylesheets: vec!["https://example.com/style.css".into()],
            html: WELL_FORMED_HTML.to_string(),
            text: vec![PARAGRAPH; 7].join(" "),
            load_time_ms: 900.0,
            status_code: 200,
            headers: BTreeMap::new(),
        }
    }

    /// Untitled div soup with no metadata at all.
    pub fn bare_page() -> WebsiteData {
        WebsiteData {
            url: "https://example.com/bare".into(),
            html: "<html><body><div>Hello</div></body></html>".into(),
            text: "Hello".into(),
            load_time_ms: 400.0,
            status_code: 200,
            ..Default::default()
        }
    }

    fn prior_entry(kind: AnalyzerType, shape: MetricsShape, score: Option<f64>) -> ResultsMap {
        let result = AnalyzerResult {
            analyzer_type: kind,
            metrics: AnalyzerMetrics::new(shape, score),
            issues: vec![],
            recommendations: vec![],
            score,
            duration_ms: 0,
        };
        ResultsMap::from([(kind, Arc::new(result))])
    }

    /// Results map holding only a Lighthouse result with the given category scores.
    pub fn lighthouse_prior(categories: &[(&str, f64)]) -> ResultsMap {
        lighthouse_prior_with_vitals(categories, WebVitals::default())
    }

    pub fn lighthouse_prior_with_vitals(categories: &[(&str, f64)], web_vitals: WebVitals) -> ResultsMap {
        let categories: BTreeMap<String, f64> = categories
            .iter()
            .map(|(name, score)| (name.to_string(), *score))
            .collect();
        let score = if categories.is_empty() {
            None
        } else {
            Some(categories.values().sum::<f64>() / categories.len() as f64)
        };
        let shape = MetricsShape::Lighthouse(LighthouseMetrics {
            final_url: "https://example.com/".into(),
            strategy: "mobile".into(),
            categories,
            web_vitals,
            ..Default::default()
        });
        prior_entry(AnalyzerType::Lighthouse, shape, score)
    }

    /// Results map holding only a structure result.
    pub fn structure_prior(skipped_heading_levels: usize) -> ResultsMap {
        let shape = MetricsShape::Structure(StructureMetrics {
            skipped_heading_levels,
            ..Default::default()
        });
        prior_entry(AnalyzerType::Structure, shape, Some(100.0))
    }
}

#[derive(Debug, Clone)]
enum Behaviour {
    Succeed(Option<f64>),
    Fail(String),
    Panic,
}

/// Analyzer whose outcome, timing and priority are set by the test.
///
/// Records the prior-result keys it was handed on every call so tests can
/// check snapshot isolation between layers.
pub struct ScriptedAnalyzer {
    state: AnalyzerState,
    behaviour: Behaviour,
    issues: Vec<Issue>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    calls: Arc<AtomicU32>,
    seen: Arc<Mutex<Vec<Vec<AnalyzerType>>>>,
}

impl ScriptedAnalyzer {
    fn with_behaviour(kind: AnalyzerType, behaviour: Behaviour) -> Self {
        Self {
            state: AnalyzerState::new(kind),
            behaviour,
            issues: Vec::new(),
            delay: None,
            gate: None,
            calls: Arc::new(AtomicU32::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding(kind: AnalyzerType, score: f64) -> Self {
        Self::with_behaviour(kind, Behaviour::Succeed(Some(score)))
    }

    pub fn unscored(kind: AnalyzerType) -> Self {
        Self::with_behaviour(kind, Behaviour::Succeed(None))
    }

    pub fn failing(kind: AnalyzerType, message: &str) -> Self {
        Self::with_behaviour(kind, Behaviour::Fail(message.to_string()))
    }

    pub fn panicking(kind: AnalyzerType) -> Self {
        Self::with_behaviour(kind, Behaviour::Panic)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.state = self.state.with_priority(priority);
        self
    }

    pub fn with_issue(mut self, issue: Issue) -> Self {
        self.issues.push(issue);
        self
    }

    /// Sleep through the run context before producing the outcome.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block until the test adds a permit to `gate`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Number of `analyze` calls, readable after the analyzer was boxed.
    pub fn call_counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }

    /// Prior-result keys seen by each call, in call order.
    pub fn seen_priors(&self) -> Arc<Mutex<Vec<Vec<AnalyzerType>>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    fn state(&self) -> &AnalyzerState {
        &self.state
    }

    async fn analyze(
        &mut self,
        ctx: &RunContext,
        _data: &WebsiteData,
        prior: &ResultsMap,
    ) -> Result<AnalyzerMetrics> {
        self.state.reset();
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(prior.keys().copied().collect());
        }

        if let Some(gate) = &self.gate {
            let permit = ctx
                .run(gate.acquire())
                .await?
                .map_err(|e| AnalysisError::other(format!("gate closed: {}", e)))?;
            drop(permit);
        }
        if let Some(delay) = self.delay {
            ctx.sleep(delay).await?;
        }

        match &self.behaviour {
            Behaviour::Succeed(score) => {
                for issue in self.issues.clone() {
                    self.state.add_issue(issue);
                }
                let score = *score;
                Ok(self.state.finish(MetricsShape::Empty, score))
            }
            Behaviour::Fail(message) => Err(AnalysisError::other(message.clone())),
            Behaviour::Panic => panic!("scripted panic in {}", self.state.kind()),
        }
    }
}
