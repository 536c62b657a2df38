//! Regex strategy: currency amounts, deadlines near deadline wording, funding
//! vocabulary and URL/text markers. Works on plain text as well as HTML.

use std::collections::{BTreeSet, HashSet};
use std::ops::Range;
use std::sync::LazyLock;

use chrono::NaiveDate;
use fundscout_core::{AmountRange, CandidateFields, CrawlTarget, Field, PageContent};
use regex::{Captures, Regex};
use scraper::Html;
use url::Url;

use crate::{
    collapse_whitespace, provenance, target_terms, text_or_none, visible_text, ExtractError,
    Extractor, FUNDING_VOCABULARY,
};

const NAME: &str = "regex";

/// How far past a deadline phrase a date may appear, in characters.
const DEADLINE_WINDOW_CHARS: usize = 120;

const MIN_PARAGRAPH_CHARS: usize = 40;

const NUMBER: &str = r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?";
const UNIT: &str = r"(?:k|m|bn|thousand|million|billion)\b";
const CODES: &str = r"\b(?:USD|EUR|GBP|SSP|KES|UGX|CHF)\b";

static PREFIX_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?P<cur>US\$|\$|€|£|{CODES})\s?(?P<a>{NUMBER})(?:\s?(?P<ua>{UNIT}))?(?:\s*(?:-|–|to)\s*(?:US\$|\$|€|£|{CODES})?\s?(?P<b>{NUMBER})(?:\s?(?P<ub>{UNIT}))?)?"
    ))
    .unwrap()
});

static SUFFIX_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?P<a>{NUMBER})(?:\s?(?P<ua>{UNIT}))?(?:\s*(?:-|–|to)\s*(?P<b>{NUMBER})(?:\s?(?P<ub>{UNIT}))?)?\s?(?P<cur>{CODES}|\beuros?\b|\bdollars?\b)"
    ))
    .unwrap()
});

const MONTH: &str = r"jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?";

static DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // 2026-06-30, also the date part of an ISO timestamp
        Regex::new(r"\b(?P<y>20\d{2})-(?P<m>\d{1,2})-(?P<d>\d{1,2})(?:T|\b)").unwrap(),
        // 30 June 2026, 1st of March, 2026
        Regex::new(&format!(
            r"(?i)\b(?P<d>\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?(?P<mon>{MONTH})\.?,?\s+(?P<y>20\d{{2}})\b"
        ))
        .unwrap(),
        // June 30, 2026
        Regex::new(&format!(
            r"(?i)\b(?P<mon>{MONTH})\.?\s+(?P<d>\d{{1,2}})(?:st|nd|rd|th)?,?\s+(?P<y>20\d{{2}})\b"
        ))
        .unwrap(),
        // 30/06/2026, day first
        Regex::new(r"\b(?P<d>\d{1,2})[/.](?P<m>\d{1,2})[/.](?P<y>20\d{2})\b").unwrap(),
    ]
});

static DEADLINE_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:deadline|closing date|closes on|apply by|applications? (?:close|closes|due)|due date|submission date|submit by|last date)\b",
    )
    .unwrap()
});

static HTML_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

const URL_MARKERS: &[&str] = &[
    "grant",
    "funding",
    "opportunit",
    "call",
    "tender",
    "fellowship",
    "scholarship",
];

const TEXT_MARKERS: &[&str] = &[
    "call for proposals",
    "request for proposals",
    "request for applications",
    "expression of interest",
    "how to apply",
    "eligibility",
];

#[derive(Debug, Clone)]
pub struct RegexExtractor {
    window_chars: usize,
}

impl RegexExtractor {
    pub fn new() -> Self {
        Self {
            window_chars: DEADLINE_WINDOW_CHARS,
        }
    }
}

impl Default for RegexExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for RegexExtractor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn extract(
        &self,
        page: &PageContent,
        target: &CrawlTarget,
    ) -> Result<CandidateFields, ExtractError> {
        let html = page.is_html();
        let text = if html {
            visible_text(&Html::parse_document(&page.body))
        } else {
            collapse_whitespace(&page.body)
        };

        let mut fields = CandidateFields::default();

        fields.title = if html {
            HTML_TITLE
                .captures(&page.body)
                .and_then(|c| c.get(1))
                .and_then(|m| text_or_none(m.as_str()))
                .map(|t| {
                    Field::with_value_and_provenance(t.clone(), provenance(NAME, "<title>", &t))
                })
                .unwrap_or_default()
        } else {
            page.body
                .lines()
                .find_map(text_or_none)
                .filter(|line| line.chars().count() <= 200)
                .map(|t| Field::with_value_and_provenance(t.clone(), provenance(NAME, "line:1", &t)))
                .unwrap_or_default()
        };

        if !html {
            if let Some(paragraph) = page
                .body
                .split("\n\n")
                .filter_map(text_or_none)
                .find(|p| p.chars().count() >= MIN_PARAGRAPH_CHARS)
            {
                fields.description = Field::with_value_and_provenance(
                    paragraph.clone(),
                    provenance(NAME, "paragraph", &paragraph),
                );
            }
        }

        if let Some((range, span)) = find_amount(&text) {
            fields.amount = Field::with_value_and_provenance(
                range,
                provenance(NAME, "amount", &text[span]),
            );
        }

        if let Some((date, snippet)) = self.find_deadline(&text) {
            fields.deadline =
                Field::with_value_and_provenance(date, provenance(NAME, "deadline", &snippet));
        }

        fields.keywords = matched_terms(&text, target);
        fields.markers = markers(&page.url, &text);
        Ok(fields)
    }
}

impl RegexExtractor {
    /// First parseable date following a deadline phrase.
    fn find_deadline(&self, text: &str) -> Option<(NaiveDate, String)> {
        for phrase in DEADLINE_PHRASE.find_iter(text) {
            let end = text[phrase.end()..]
                .char_indices()
                .nth(self.window_chars)
                .map(|(i, _)| phrase.end() + i)
                .unwrap_or(text.len());
            let window = &text[phrase.end()..end];
            if let Some((date, span)) = find_date(window) {
                let snippet = &text[phrase.start()..phrase.end() + span.end];
                return Some((date, snippet.to_string()));
            }
        }
        None
    }
}

/// Parses the first amount or amount range in `text`.
pub fn parse_amount(text: &str) -> Option<AmountRange> {
    find_amount(text).map(|(range, _)| range)
}

/// Parses the first recognizable date in `text`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    find_date(text).map(|(date, _)| date)
}

fn find_amount(text: &str) -> Option<(AmountRange, Range<usize>)> {
    [&*PREFIX_AMOUNT, &*SUFFIX_AMOUNT]
        .into_iter()
        .flat_map(|re| re.captures_iter(text).filter_map(amount_from_captures))
        .min_by_key(|(_, span)| span.start)
}

fn amount_from_captures(caps: Captures<'_>) -> Option<(AmountRange, Range<usize>)> {
    let span = caps.get(0)?.range();
    let unit_a = caps.name("ua").map(|m| m.as_str());
    let unit_b = caps.name("ub").map(|m| m.as_str());
    // "1 - 2 million" applies the trailing unit to both ends
    let a = scaled(caps.name("a")?.as_str(), unit_a.or(unit_b))?;
    let b = match caps.name("b") {
        Some(m) => scaled(m.as_str(), unit_b)?,
        None => a,
    };
    if a <= 0.0 || b <= 0.0 {
        return None;
    }
    let currency = caps.name("cur").map(|m| normalize_currency(m.as_str()));
    Some((AmountRange::new(a, b, currency), span))
}

fn scaled(number: &str, unit: Option<&str>) -> Option<f64> {
    let value = number.replace(',', "").parse::<f64>().ok()?;
    let factor = match unit.map(str::to_lowercase).as_deref() {
        None => 1.0,
        Some("k" | "thousand") => 1_000.0,
        Some("m" | "million") => 1_000_000.0,
        Some("bn" | "billion") => 1_000_000_000.0,
        Some(_) => return None,
    };
    Some(value * factor)
}

fn normalize_currency(raw: &str) -> String {
    let lower = raw.to_lowercase();
    match lower.as_str() {
        "$" | "us$" | "usd" | "dollar" | "dollars" => "USD".to_string(),
        "€" | "eur" | "euro" | "euros" => "EUR".to_string(),
        "£" | "gbp" => "GBP".to_string(),
        _ => raw.to_uppercase(),
    }
}

fn find_date(text: &str) -> Option<(NaiveDate, Range<usize>)> {
    DATE_PATTERNS
        .iter()
        .filter_map(|re| {
            re.captures_iter(text)
                .find_map(|caps| Some((date_from_captures(&caps)?, caps.get(0)?.range())))
        })
        .min_by_key(|(_, span)| span.start)
}

fn date_from_captures(caps: &Captures<'_>) -> Option<NaiveDate> {
    let year = caps.name("y")?.as_str().parse::<i32>().ok()?;
    let day = caps.name("d")?.as_str().parse::<u32>().ok()?;
    let month = match (caps.name("m"), caps.name("mon")) {
        (Some(m), _) => m.as_str().parse::<u32>().ok()?,
        (None, Some(name)) => month_from_name(name.as_str())?,
        (None, None) => return None,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

fn month_from_name(name: &str) -> Option<u32> {
    let prefix = name.get(..3)?.to_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Target terms and generic funding vocabulary that occur in `text`.
fn matched_terms(text: &str, target: &CrawlTarget) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    let words = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<HashSet<_>>();
    let joined = format!(" {} ", words_in_order(&lower).join(" "));

    let mut candidates = target_terms(target);
    candidates.extend(FUNDING_VOCABULARY.iter().map(|t| t.to_string()));

    candidates
        .into_iter()
        .filter(|term| contains_term(&words, &joined, term))
        .collect()
}

fn words_in_order(lower: &str) -> Vec<&str> {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

fn contains_term(words: &HashSet<&str>, joined: &str, term: &str) -> bool {
    if term.contains(' ') {
        return joined.contains(&format!(" {term} "));
    }
    if words.contains(term) || words.contains(format!("{term}s").as_str()) {
        return true;
    }
    term.strip_suffix('y')
        .is_some_and(|stem| words.contains(format!("{stem}ies").as_str()))
}

fn markers(page_url: &str, text: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    if let Ok(url) = Url::parse(page_url) {
        let path = url.path().to_lowercase();
        for marker in URL_MARKERS {
            if path.contains(marker) {
                found.insert(format!("url:{marker}"));
            }
        }
    }
    let lower = text.to_lowercase();
    for marker in TEXT_MARKERS {
        if lower.contains(marker) {
            found.insert(format!("text:{marker}"));
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn plain(url: &str, body: &str) -> PageContent {
        PageContent {
            url: url.to_string(),
            content_type: "text/plain; charset=utf-8".to_string(),
            body: body.to_string(),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn amounts_cover_symbols_codes_ranges_and_units() {
        let r = parse_amount("Awards of $5,000 to $25,000 per project").unwrap();
        assert_eq!((r.min, r.max, r.currency.as_deref()), (5_000.0, 25_000.0, Some("USD")));

        let r = parse_amount("Budget: EUR 1.5 million").unwrap();
        assert_eq!((r.min, r.currency.as_deref()), (1_500_000.0, Some("EUR")));

        let r = parse_amount("between 10k - 40k USD").unwrap();
        assert_eq!((r.min, r.max), (10_000.0, 40_000.0));

        let r = parse_amount("£1 - 2 million available").unwrap();
        assert_eq!((r.min, r.max, r.currency.as_deref()), (1_000_000.0, 2_000_000.0, Some("GBP")));

        assert!(parse_amount("Founded in 2019 with 40 staff").is_none());
    }

    #[test]
    fn dates_cover_common_layouts() {
        let expected = NaiveDate::from_ymd_opt(2026, 6, 30);
        assert_eq!(parse_date("2026-06-30T17:00:00Z"), expected);
        assert_eq!(parse_date("30th June 2026"), expected);
        assert_eq!(parse_date("June 30, 2026"), expected);
        assert_eq!(parse_date("30/06/2026"), expected);
        assert_eq!(parse_date("31/02/2026"), None);
    }

    #[test]
    fn deadline_requires_nearby_deadline_wording() {
        let target = CrawlTarget::new("t", "https://example.org", "Example");
        let posted_only = plain(
            "https://example.org/news",
            "Posted 1 March 2026. Our annual report is out.",
        );
        let fields = RegexExtractor::new().extract(&posted_only, &target).unwrap();
        assert!(!fields.deadline.is_present());

        let with_deadline = plain(
            "https://example.org/grants/seed",
            "Posted 1 March 2026.\n\nApplications close on 15 April 2026 at noon.",
        );
        let fields = RegexExtractor::new().extract(&with_deadline, &target).unwrap();
        assert_eq!(fields.deadline.value, NaiveDate::from_ymd_opt(2026, 4, 15));
        assert!(fields
            .deadline
            .provenance
            .unwrap()
            .snippet
            .starts_with("Applications close"));
    }

    #[test]
    fn keywords_and_markers_come_from_text_and_url() {
        let mut target = CrawlTarget::new("t", "https://example.org", "Example");
        target.sectors = vec!["Health".into()];
        target.keywords = vec!["maternal care".into()];
        let page = plain(
            "https://example.org/funding/calls/2026",
            "Call for proposals\n\nNew opportunities for Maternal Care and health systems grants.",
        );
        let fields = RegexExtractor::new().extract(&page, &target).unwrap();
        for term in ["health", "maternal care", "grant", "opportunity", "call"] {
            assert!(fields.keywords.contains(term), "missing {term}");
        }
        assert!(fields.markers.contains("url:funding"));
        assert!(fields.markers.contains("url:call"));
        assert!(fields.markers.contains("text:call for proposals"));
        assert_eq!(fields.title.value.as_deref(), Some("Call for proposals"));
    }
}
