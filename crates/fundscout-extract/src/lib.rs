//! Extraction strategies and content scoring for candidate funding pages.

use fundscout_core::{CandidateFields, CrawlTarget, PageContent, Provenance};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub mod dom;
pub mod evaluator;
pub mod links;
pub mod pattern;

pub use dom::DomExtractor;
pub use evaluator::{ContentEvaluator, EvaluationError, ScoringWeights};
pub use links::discover_links;
pub use pattern::RegexExtractor;

pub const CRATE_NAME: &str = "fundscout-extract";

/// Generic funding vocabulary used when a target declares no sectors or keywords.
pub const FUNDING_VOCABULARY: &[&str] = &[
    "grant",
    "funding",
    "opportunity",
    "application",
    "proposal",
    "award",
    "fellowship",
    "scholarship",
    "call",
    "tender",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("{extractor} failed: {reason}")]
    Strategy {
        extractor: &'static str,
        reason: String,
    },
}

/// One interchangeable field-extraction strategy.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(
        &self,
        page: &PageContent,
        target: &CrawlTarget,
    ) -> Result<CandidateFields, ExtractError>;
}

/// Runs strategies in order and merges their output; earlier strategies win
/// per field.
pub struct CompositeExtractor {
    strategies: Vec<Box<dyn Extractor>>,
}

impl CompositeExtractor {
    pub fn new(strategies: Vec<Box<dyn Extractor>>) -> Self {
        Self { strategies }
    }
}

impl Default for CompositeExtractor {
    fn default() -> Self {
        Self::new(vec![Box::new(DomExtractor), Box::new(RegexExtractor::new())])
    }
}

impl Extractor for CompositeExtractor {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn extract(
        &self,
        page: &PageContent,
        target: &CrawlTarget,
    ) -> Result<CandidateFields, ExtractError> {
        let mut merged = CandidateFields::default();
        for strategy in &self.strategies {
            let fields = strategy
                .extract(page, target)
                .map_err(|err| ExtractError::Strategy {
                    extractor: strategy.name(),
                    reason: err.to_string(),
                })?;
            merged = merged.merge(fields);
        }
        Ok(merged)
    }
}

pub(crate) fn provenance(extractor: &str, pointer: &str, snippet: &str) -> Provenance {
    Provenance {
        extractor: extractor.to_string(),
        pointer: pointer.to_string(),
        snippet: truncate_chars(snippet, 160),
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let collapsed = collapse_whitespace(value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<String>())
}

pub(crate) fn select_first_text(
    document: &Html,
    selector: &str,
) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(document.select(&sel).find_map(element_text))
}

pub(crate) fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .find_map(|n| n.value().attr(attr).and_then(text_or_none)))
}

pub(crate) fn select_all_texts(document: &Html, selector: &str) -> Result<Vec<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(document.select(&sel).filter_map(element_text).collect())
}

/// Text nodes outside `script`, `style` and `noscript`, whitespace-collapsed.
pub fn visible_text(document: &Html) -> String {
    let mut out = String::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript" | "template"));
        if hidden {
            continue;
        }
        out.push_str(text);
        out.push(' ');
    }
    collapse_whitespace(&out)
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

/// Lower-cased scoring vocabulary for a target: its sectors and keywords, or
/// the generic funding vocabulary when it declares none.
pub fn target_terms(target: &CrawlTarget) -> Vec<String> {
    let mut terms = target
        .sectors
        .iter()
        .chain(target.keywords.iter())
        .map(|t| collapse_whitespace(&t.to_lowercase()))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>();
    if terms.is_empty() {
        terms = FUNDING_VOCABULARY.iter().map(|t| t.to_string()).collect();
    }
    terms.sort();
    terms.dedup();
    terms
}
