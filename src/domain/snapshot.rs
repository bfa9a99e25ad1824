//! Builds a [`WebsiteData`] snapshot from already-fetched HTML.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

use super::models::{Heading, Image, Link, Script, WebsiteData};

/// Parse a constant selector once and keep it for the process lifetime.
pub(crate) fn cached_selector(cell: &'static OnceLock<Selector>, css: &str) -> &'static Selector {
    cell.get_or_init(|| Selector::parse(css).unwrap())
}

impl WebsiteData {
    /// Extract the snapshot fields from raw HTML.
    ///
    /// The HTML is assumed to come from a successful fetch, so `status_code`
    /// is 200 and `headers` is empty; callers with the real response
    /// metadata overwrite both afterwards.
    pub fn from_html(url: &str, html: &str, load_time_ms: f64) -> Self {
        let document = Html::parse_document(html);

        Self {
            url: url.to_string(),
            title: extract_title(&document),
            lang: extract_lang(&document),
            headings: extract_headings(&document),
            meta_tags: extract_meta_tags(&document),
            links: extract_links(&document, url),
            images: extract_images(&document, url),
            scripts: extract_scripts(&document),
            stylesheets: extract_stylesheets(&document, url),
            html: html.to_string(),
            text: extract_text(&document),
            load_time_ms,
            status_code: 200,
            headers: BTreeMap::new(),
        }
    }
}

fn element_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve(base: Option<&Url>, href: &str) -> String {
    base.and_then(|b| b.join(href).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| href.to_string())
}

fn extract_title(document: &Html) -> Option<String> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    document
        .select(cached_selector(&SELECTOR, "title"))
        .next()
        .map(|el| element_text(&el))
        .filter(|t| !t.is_empty())
}

fn extract_lang(document: &Html) -> Option<String> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    document
        .select(cached_selector(&SELECTOR, "html"))
        .next()
        .and_then(|el| el.value().attr("lang"))
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

fn extract_headings(document: &Html) -> Vec<Heading> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    document
        .select(cached_selector(&SELECTOR, "h1, h2, h3, h4, h5, h6"))
        .filter_map(|el| {
            let level = el.value().name().trim_start_matches('h').parse::<u8>().ok()?;
            Some(Heading {
                level,
                text: element_text(&el),
            })
        })
        .collect()
}

fn extract_meta_tags(document: &Html) -> BTreeMap<String, String> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let mut tags = BTreeMap::new();
    for el in document.select(cached_selector(&SELECTOR, "meta[content]")) {
        let attrs = el.value();
        let Some(key) = attrs.attr("name").or_else(|| attrs.attr("property")) else {
            continue;
        };
        let content = attrs.attr("content").unwrap_or_default().trim().to_string();
        tags.entry(key.trim().to_ascii_lowercase()).or_insert(content);
    }
    tags
}

fn extract_links(document: &Html, base_url: &str) -> Vec<Link> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    static IMG_SELECTOR: OnceLock<Selector> = OnceLock::new();

    let base = Url::parse(base_url).ok();
    let base_host = base.as_ref().and_then(|u| u.host_str()).map(str::to_string);
    let base_port = base.as_ref().and_then(|u| u.port());

    let mut links = Vec::new();
    for element in document.select(cached_selector(&SELECTOR, "a[href]")) {
        let Some(href) = element.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }

        // visible text, then aria-label/title, then alt of a nested image
        let mut text = element_text(&element);
        if text.is_empty() {
            if let Some(attr) = element
                .value()
                .attr("aria-label")
                .or_else(|| element.value().attr("title"))
            {
                text = attr.trim().to_string();
            }
        }
        if text.is_empty() {
            if let Some(alt) = element
                .select(cached_selector(&IMG_SELECTOR, "img[alt]"))
                .filter_map(|img| img.value().attr("alt"))
                .map(str::trim)
                .find(|alt| !alt.is_empty())
            {
                text = alt.to_string();
            }
        }

        let resolved = resolve(base.as_ref(), href);
        let is_internal = Url::parse(&resolved)
            .map(|u| u.host_str().map(str::to_string) == base_host && u.port() == base_port)
            .unwrap_or(false);

        links.push(Link {
            href: resolved,
            text: if text.is_empty() { None } else { Some(text) },
            rel: element.value().attr("rel").map(str::to_string),
            target: element.value().attr("target").map(str::to_string),
            is_internal,
        });
    }
    links
}

fn extract_images(document: &Html, base_url: &str) -> Vec<Image> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let base = Url::parse(base_url).ok();

    document
        .select(cached_selector(&SELECTOR, "img"))
        .map(|el| {
            let attrs = el.value();
            let dimension = |name: &str| {
                attrs
                    .attr(name)
                    .and_then(|v| v.trim().trim_end_matches("px").parse::<i64>().ok())
            };
            Image {
                src: resolve(base.as_ref(), attrs.attr("src").unwrap_or_default().trim()),
                alt: attrs.attr("alt").map(str::to_string),
                width: dimension("width"),
                height: dimension("height"),
                loading: attrs.attr("loading").map(str::to_string),
                srcset: attrs.attr("srcset").map(str::to_string),
            }
        })
        .collect()
}

fn extract_scripts(document: &Html) -> Vec<Script> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    static HEAD_SELECTOR: OnceLock<Selector> = OnceLock::new();

    let head_ids: HashSet<_> = document
        .select(cached_selector(&HEAD_SELECTOR, "head script"))
        .map(|el| el.id())
        .collect();

    document
        .select(cached_selector(&SELECTOR, "script"))
        .map(|el| {
            let attrs = el.value();
            Script {
                src: attrs.attr("src").map(str::to_string),
                is_async: attrs.attr("async").is_some(),
                is_defer: attrs.attr("defer").is_some(),
                in_head: head_ids.contains(&el.id()),
            }
        })
        .collect()
}

fn extract_stylesheets(document: &Html, base_url: &str) -> Vec<String> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let base = Url::parse(base_url).ok();
    document
        .select(cached_selector(&SELECTOR, "link[rel~='stylesheet'][href]"))
        .filter_map(|el| el.value().attr("href"))
        .map(|href| resolve(base.as_ref(), href.trim()))
        .collect()
}

/// Visible body text with script/style content dropped.
fn extract_text(document: &Html) -> String {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let Some(body) = document.select(cached_selector(&SELECTOR, "body")).next() else {
        return String::new();
    };

    let mut words: Vec<&str> = Vec::new();
    for node in body.descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}
