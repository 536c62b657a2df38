use std::collections::HashSet;

use fundscout_core::PageContent;
use scraper::Html;
use url::Url;

use crate::dom::resolve;
use crate::{parse_selector, ExtractError};

/// Path fragments that suggest a link leads to an opportunity listing.
const RELEVANT_PATH_PARTS: &[&str] = &[
    "grant",
    "funding",
    "opportunit",
    "call",
    "tender",
    "fellowship",
];

const SKIPPED_EXTENSIONS: &[&str] = &[".pdf", ".jpg", ".jpeg", ".png", ".zip", ".xml", ".css", ".js"];

/// Same-host links whose path looks opportunity-related, in document order,
/// deduplicated, without fragments and capped at `limit`.
pub fn discover_links(page: &PageContent, limit: usize) -> Result<Vec<String>, ExtractError> {
    if limit == 0 || !page.is_html() {
        return Ok(Vec::new());
    }
    let Ok(base) = Url::parse(&page.url) else {
        return Ok(Vec::new());
    };
    let Some(host) = base.host_str().map(str::to_lowercase) else {
        return Ok(Vec::new());
    };
    let own = resolve(&page.url, "").unwrap_or_else(|| page.url.clone());

    let document = Html::parse_document(&page.body);
    let anchors = parse_selector("a[href]")?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(absolute) = resolve(&page.url, href.trim()) else {
            continue;
        };
        if absolute == own || !is_relevant(&absolute, &host) {
            continue;
        }
        if seen.insert(absolute.clone()) {
            out.push(absolute);
            if out.len() >= limit {
                break;
            }
        }
    }
    Ok(out)
}

fn is_relevant(candidate: &str, host: &str) -> bool {
    let Ok(url) = Url::parse(candidate) else {
        return false;
    };
    if url.host_str().map(str::to_lowercase).as_deref() != Some(host) {
        return false;
    }
    let path = url.path().to_lowercase();
    if SKIPPED_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return false;
    }
    RELEVANT_PATH_PARTS.iter().any(|part| path.contains(part))
}
