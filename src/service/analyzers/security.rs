//! Transport and header hygiene: HTTPS, mixed content, security headers and
//! unsafe `target="_blank"` links.

use async_trait::async_trait;

use super::{prior_category_score, scoring, Analyzer, AnalyzerState};
use crate::domain::{
    AnalyzerMetrics, AnalyzerType, Issue, MetricsShape, ResultsMap, SecurityMetrics, Severity,
    WebsiteData,
};
use crate::error::Result;
use crate::service::context::RunContext;

/// Header, severity when missing, and whether it only applies over HTTPS.
const SECURITY_HEADERS: [(&str, Severity, bool); 5] = [
    ("strict-transport-security", Severity::Medium, true),
    ("content-security-policy", Severity::Medium, false),
    ("x-content-type-options", Severity::Low, false),
    ("x-frame-options", Severity::Low, false),
    ("referrer-policy", Severity::Low, false),
];

pub struct SecurityAnalyzer {
    state: AnalyzerState,
}

impl SecurityAnalyzer {
    pub fn new() -> Self {
        Self {
            state: AnalyzerState::new(AnalyzerType::Security),
        }
    }

    fn check_headers(&mut self, data: &WebsiteData, https: bool) -> Vec<String> {
        let csp = data.header("content-security-policy").unwrap_or_default();
        let mut missing = Vec::new();

        for (name, severity, https_only) in SECURITY_HEADERS {
            if https_only && !https {
                continue;
            }
            // frame-ancestors in CSP supersedes X-Frame-Options
            if name == "x-frame-options" && csp.contains("frame-ancestors") {
                continue;
            }
            if data.header(name).is_none() {
                missing.push(name.to_string());
                self.state.flag(
                    Issue::new("missing_security_header", severity, format!("Missing {} header", name))
                        .with_detail("header", name),
                    &format!("Send the {} response header", name),
                );
            }
        }
        missing
    }
}

impl Default for SecurityAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_insecure(resource: &str) -> bool {
    resource.trim_start().to_ascii_lowercase().starts_with("http://")
}

#[async_trait]
impl Analyzer for SecurityAnalyzer {
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

        let https = data.is_https();
        let mut mixed_content = Vec::new();
        if !https {
            self.state.flag(
                Issue::high("no_https", "Page is not served over HTTPS"),
                "Serve the site over HTTPS and redirect HTTP traffic",
            );
        } else {
            mixed_content.extend(data.images.iter().map(|i| i.src.as_str()).filter(|s| is_insecure(s)).map(String::from));
            mixed_content.extend(data.scripts.iter().filter_map(|s| s.src.as_deref()).filter(|s| is_insecure(s)).map(String::from));
            mixed_content.extend(data.stylesheets.iter().map(String::as_str).filter(|s| is_insecure(s)).map(String::from));
            if !mixed_content.is_empty() {
                self.state.flag(
                    Issue::high(
                        "mixed_content",
                        format!("{} resources are loaded over plain HTTP", mixed_content.len()),
                    )
                    .with_detail("resources", mixed_content.clone()),
                    "Load every subresource over HTTPS",
                );
            }
        }

        // Snapshots built from bare HTML carry no response headers
        let headers_checked = !data.headers.is_empty();
        let missing_headers = if headers_checked {
            self.check_headers(data, https)
        } else {
            Vec::new()
        };

        let unsafe_blank_targets = data
            .links
            .iter()
            .filter(|l| l.target.as_deref() == Some("_blank") && !l.is_internal)
            .filter(|l| {
                let rel = l.rel.as_deref().unwrap_or_default().to_ascii_lowercase();
                !(rel.contains("noopener") || rel.contains("noreferrer"))
            })
            .count();
        if unsafe_blank_targets > 0 {
            self.state.flag(
                Issue::low(
                    "unsafe_target_blank",
                    format!("{} external links open a new tab without rel=\"noopener\"", unsafe_blank_targets),
                ),
                "Add rel=\"noopener noreferrer\" to links with target=\"_blank\"",
            );
        }

        let local_score = self.state.local_score();
        let lighthouse_score = prior_category_score(prior, "best-practices");
        let score = scoring::blend(lighthouse_score, local_score);

        let shape = MetricsShape::Security(SecurityMetrics {
            https,
            mixed_content,
            missing_headers,
            unsafe_blank_targets,
            local_score,
            lighthouse_score,
        });
        let metrics = AnalyzerMetrics::new(shape, Some(score)).with_extra("headers_checked", headers_checked);
        Ok(self.state.finish_with(metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures;

    #[tokio::test]
    async fn http_page_is_penalised() {
        let mut data = fixtures::well_formed_page();
        data.url = "http://example.com/".into();
        let mut analyzer = SecurityAnalyzer::new();

        let metrics = analyzer
            .analyze(&RunContext::new(), &data, &ResultsMap::new())
            .await
            .unwrap();

        assert_eq!(analyzer.issues()[0].issue_type, "no_https");
        assert!(metrics.score.unwrap() <= 85.0);
    }

    #[tokio::test]
    async fn mixed_content_and_headers() {
        let mut data = fixtures::well_formed_page();
        data.images[0].src = "http://cdn.example.com/a.png".into();
        data.headers.insert("x-content-type-options".into(), "nosniff".into());
        data.headers.insert("content-security-policy".into(), "frame-ancestors 'none'".into());
        let mut analyzer = SecurityAnalyzer::new();

        let metrics = analyzer
            .analyze(&RunContext::new(), &data, &ResultsMap::new())
            .await
            .unwrap();

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["mixed_content"][0], "http://cdn.example.com/a.png");
        assert_eq!(
            json["missing_headers"],
            serde_json::json!(["strict-transport-security", "referrer-policy"])
        );
        assert_eq!(json["headers_checked"], true);
        // high 15 + medium 10 + low 5
        assert_eq!(metrics.score, Some(70.0));
    }
}
