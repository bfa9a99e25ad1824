//! Text content: length, readability (Flesch reading ease) and keyword
//! density. These figures feed the content-improvement service.

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};

use super::{Analyzer, AnalyzerState};
use crate::domain::snapshot::cached_selector;
use crate::domain::{
    AnalyzerMetrics, AnalyzerType, ContentMetrics, Issue, KeywordDensity, MetricsShape,
    ReadabilityMetrics, ResultsMap, WebsiteData,
};
use crate::error::Result;
use crate::service::context::RunContext;

const THIN_CONTENT_WORDS: usize = 300;
const LONG_SENTENCE_WORDS: f64 = 25.0;
const STUFFING_DENSITY: f64 = 5.0;
const TOP_KEYWORDS: usize = 5;
const MIN_KEYWORD_LEN: usize = 4;

const STOP_WORDS: &[&str] = &[
    "about", "after", "also", "been", "before", "being", "could", "does", "each", "from", "have",
    "here", "into", "just", "like", "many", "more", "most", "much", "only", "other", "over",
    "some", "such", "than", "that", "their", "them", "then", "there", "these", "they", "this",
    "those", "through", "very", "want", "were", "what", "when", "where", "which", "while", "will",
    "with", "would", "your",
];

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\p{L}][\p{L}'’-]*").unwrap())
}

fn sentence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]+(\s|$)").unwrap())
}

fn vowel_group_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)[aeiouyåäöéèü]+").unwrap())
}

/// Vowel-group estimate with a silent trailing "e"; never below one.
pub(crate) fn count_syllables(word: &str) -> usize {
    let lower = word.to_lowercase();
    let mut count = vowel_group_regex().find_iter(&lower).count();
    if count > 1 && lower.ends_with('e') && !lower.ends_with("le") {
        count -= 1;
    }
    count.max(1)
}

pub(crate) fn readability(text: &str) -> ReadabilityMetrics {
    let words: Vec<&str> = word_regex().find_iter(text).map(|m| m.as_str()).collect();
    if words.is_empty() {
        return ReadabilityMetrics::default();
    }

    let sentence_count = sentence_regex()
        .split(text)
        .filter(|s| word_regex().is_match(s))
        .count()
        .max(1);
    let syllables: usize = words.iter().map(|w| count_syllables(w)).sum();

    let avg_sentence_length = words.len() as f64 / sentence_count as f64;
    let avg_syllables_per_word = syllables as f64 / words.len() as f64;
    let flesch_reading_ease =
        206.835 - 1.015 * avg_sentence_length - 84.6 * avg_syllables_per_word;

    ReadabilityMetrics {
        sentence_count,
        avg_sentence_length,
        avg_syllables_per_word,
        flesch_reading_ease,
    }
}

fn top_keywords(words: &[String]) -> Vec<KeywordDensity> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for word in words {
        if word.chars().count() >= MIN_KEYWORD_LEN && !STOP_WORDS.contains(&word.as_str()) {
            *counts.entry(word.as_str()).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(TOP_KEYWORDS)
        .map(|(keyword, count)| KeywordDensity {
            keyword: keyword.to_string(),
            count,
            density: count as f64 / words.len() as f64 * 100.0,
        })
        .collect()
}

fn paragraph_count(html: &str) -> usize {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let selector = cached_selector(&SELECTOR, "p");
    Html::parse_document(html)
        .select(selector)
        .filter(|p| !p.text().collect::<String>().trim().is_empty())
        .count()
}

pub struct ContentAnalyzer {
    state: AnalyzerState,
}

impl ContentAnalyzer {
    pub fn new() -> Self {
        Self {
            state: AnalyzerState::new(AnalyzerType::Content),
        }
    }

    fn check_readability(&mut self, readability: &ReadabilityMetrics) {
        let ease = readability.flesch_reading_ease;
        if ease < 30.0 {
            self.state.flag(
                Issue::medium("hard_to_read", format!("Flesch reading ease is {:.0} (very difficult)", ease))
                    .with_detail("flesch_reading_ease", ease),
                "Use shorter sentences and simpler words",
            );
        } else if ease < 50.0 {
            self.state.flag(
                Issue::low("difficult_to_read", format!("Flesch reading ease is {:.0} (difficult)", ease))
                    .with_detail("flesch_reading_ease", ease),
                "Use shorter sentences and simpler words",
            );
        }

        if readability.avg_sentence_length > LONG_SENTENCE_WORDS {
            self.state.flag(
                Issue::low(
                    "long_sentences",
                    format!("Sentences average {:.1} words", readability.avg_sentence_length),
                ),
                "Keep sentences under 25 words on average",
            );
        }
    }
}

impl Default for ContentAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Analyzer for ContentAnalyzer {
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

        let words: Vec<String> = word_regex()
            .find_iter(&data.text)
            .map(|m| m.as_str().to_lowercase())
            .collect();
        let word_count = words.len();

        let readability = readability(&data.text);
        let top_keywords = top_keywords(&words);

        if word_count == 0 {
            self.state.flag(
                Issue::high("no_content", "Page has no readable text"),
                "Add meaningful text content that answers the visitor's question",
            );
        } else {
            if word_count < THIN_CONTENT_WORDS {
                self.state.flag(
                    Issue::medium("thin_content", format!("Only {} words of content", word_count))
                        .with_detail("word_count", word_count),
                    "Expand the page to at least 300 words of useful content",
                );
            }
            self.check_readability(&readability);

            if let Some(top) = top_keywords.first().filter(|k| k.density > STUFFING_DENSITY && k.count > 3) {
                self.state.flag(
                    Issue::low(
                        "keyword_stuffing",
                        format!("'{}' makes up {:.1}% of the text", top.keyword, top.density),
                    )
                    .with_detail("keyword", top.keyword.as_str()),
                    "Write naturally and use synonyms instead of repeating the keyword",
                );
            }
        }

        let shape = MetricsShape::Content(ContentMetrics {
            word_count,
            paragraph_count: paragraph_count(&data.html),
            readability,
            top_keywords,
        });
        let score = self.state.local_score();
        Ok(self.state.finish(shape, Some(score)))
    }
}
