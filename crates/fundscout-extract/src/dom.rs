use fundscout_core::{CandidateFields, CrawlTarget, Field, PageContent};
use scraper::Html;
use url::Url;

use crate::pattern::{parse_amount, parse_date};
use crate::{
    parse_selector, provenance, select_all_texts, select_first_attr, select_first_text,
    ExtractError, Extractor,
};

const NAME: &str = "dom";

/// Words that mark a dedicated opportunity page when found in headings or
/// element classes.
const PAGE_MARKERS: &[&str] = &[
    "grant",
    "funding",
    "opportunit",
    "call for proposals",
    "request for proposals",
    "tender",
    "fellowship",
    "scholarship",
];

const MIN_PARAGRAPH_CHARS: usize = 40;

/// Reads fields from the parsed document tree. Target selector overrides take
/// precedence over the built-in heuristics.
#[derive(Debug, Default, Clone, Copy)]
pub struct DomExtractor;

impl Extractor for DomExtractor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn extract(
        &self,
        page: &PageContent,
        target: &CrawlTarget,
    ) -> Result<CandidateFields, ExtractError> {
        if !page.is_html() {
            return Ok(CandidateFields::default());
        }
        let document = Html::parse_document(&page.body);
        let overrides = &target.selectors;

        let mut fields = CandidateFields {
            title: title_field(&document, overrides.title.as_deref())?,
            description: description_field(&document, overrides.description.as_deref())?,
            ..CandidateFields::default()
        };

        if let Some(selector) = overrides.amount.as_deref() {
            if let Some(text) = select_first_text(&document, selector)? {
                if let Some(range) = parse_amount(&text) {
                    fields.amount =
                        Field::with_value_and_provenance(range, provenance(NAME, selector, &text));
                }
            }
        }

        fields.deadline = deadline_field(&document, overrides.deadline.as_deref())?;
        fields.canonical_url = select_first_attr(&document, "link[rel=\"canonical\"]", "href")?
            .and_then(|href| resolve(&page.url, &href));
        fields.markers = structural_markers(&document)?;
        Ok(fields)
    }
}

/// Title precedence: target override, `og:title`, first `h1`, `<title>`.
fn title_field(document: &Html, override_selector: Option<&str>) -> Result<Field<String>, ExtractError> {
    if let Some(selector) = override_selector {
        if let Some(text) = select_first_text(document, selector)? {
            return Ok(Field::with_value_and_provenance(
                text.clone(),
                provenance(NAME, selector, &text),
            ));
        }
    }
    let og_title = "meta[property=\"og:title\"]";
    if let Some(text) = select_first_attr(document, og_title, "content")? {
        return Ok(Field::with_value_and_provenance(
            text.clone(),
            provenance(NAME, og_title, &text),
        ));
    }
    for selector in ["h1", "title"] {
        if let Some(text) = select_first_text(document, selector)? {
            return Ok(Field::with_value_and_provenance(
                text.clone(),
                provenance(NAME, selector, &text),
            ));
        }
    }
    Ok(Field::empty())
}

fn description_field(
    document: &Html,
    override_selector: Option<&str>,
) -> Result<Field<String>, ExtractError> {
    if let Some(selector) = override_selector {
        if let Some(text) = select_first_text(document, selector)? {
            return Ok(Field::with_value_and_provenance(
                text.clone(),
                provenance(NAME, selector, &text),
            ));
        }
    }
    for selector in [
        "meta[name=\"description\"]",
        "meta[property=\"og:description\"]",
    ] {
        if let Some(text) = select_first_attr(document, selector, "content")? {
            return Ok(Field::with_value_and_provenance(
                text.clone(),
                provenance(NAME, selector, &text),
            ));
        }
    }
    for selector in [".description", "main p, article p", "p"] {
        let found = select_all_texts(document, selector)?
            .into_iter()
            .find(|t| t.chars().count() >= MIN_PARAGRAPH_CHARS);
        if let Some(text) = found {
            return Ok(Field::with_value_and_provenance(
                text.clone(),
                provenance(NAME, selector, &text),
            ));
        }
    }
    Ok(Field::empty())
}

fn deadline_field(
    document: &Html,
    override_selector: Option<&str>,
) -> Result<Field<chrono::NaiveDate>, ExtractError> {
    if let Some(selector) = override_selector {
        if let Some(text) = select_first_text(document, selector)? {
            if let Some(date) = parse_date(&text) {
                return Ok(Field::with_value_and_provenance(
                    date,
                    provenance(NAME, selector, &text),
                ));
            }
        }
    }
    let selector = "time[datetime]";
    if let Some(raw) = select_first_attr(document, selector, "datetime")? {
        if let Some(date) = parse_date(&raw) {
            return Ok(Field::with_value_and_provenance(
                date,
                provenance(NAME, selector, &raw),
            ));
        }
    }
    Ok(Field::empty())
}

fn structural_markers(document: &Html) -> Result<std::collections::BTreeSet<String>, ExtractError> {
    let mut markers = std::collections::BTreeSet::new();
    for (kind, selector) in [("heading", "h1, h2, h3"), ("title", "title")] {
        for text in select_all_texts(document, selector)? {
            let lower = text.to_lowercase();
            for marker in PAGE_MARKERS {
                if lower.contains(marker) {
                    markers.insert(format!("{kind}:{marker}"));
                }
            }
        }
    }
    let classed = parse_selector("[class], [id]")?;
    for element in document.select(&classed) {
        let value = element.value();
        let names = value
            .attr("class")
            .unwrap_or_default()
            .split_whitespace()
            .chain(value.attr("id"));
        for name in names {
            let lower = name.to_lowercase();
            for marker in ["grant", "opportunit", "funding", "tender"] {
                if lower.contains(marker) {
                    markers.insert(format!("class:{marker}"));
                }
            }
        }
    }
    Ok(markers)
}

pub(crate) fn resolve(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    let mut joined = base.join(href).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    joined.set_fragment(None);
    Some(joined.to_string())
}
