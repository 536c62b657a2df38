use chrono::Utc;
use fundscout_core::{CandidateFields, CrawlTarget, PageContent, PageEvaluation, ScoreBreakdown};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{target_terms, CompositeExtractor, ExtractError, Extractor};

/// Matched terms needed for full keyword credit (or all terms, if fewer).
const KEYWORD_SATURATION: usize = 3;

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("malformed content from {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("content from {url} is {bytes} bytes, limit is {limit}")]
    TooLarge { url: String, bytes: usize, limit: usize },
    #[error("scoring weights must sum to 100, got {0}")]
    InvalidWeights(u16),
    #[error(transparent)]
    Extraction(#[from] ExtractError),
}

/// Maximum points per signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub amount: u8,
    pub deadline: u8,
    pub keywords: u8,
    pub structure: u8,
    pub completeness: u8,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            amount: 25,
            deadline: 20,
            keywords: 25,
            structure: 20,
            completeness: 10,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<(), EvaluationError> {
        let sum = u16::from(self.amount)
            + u16::from(self.deadline)
            + u16::from(self.keywords)
            + u16::from(self.structure)
            + u16::from(self.completeness);
        if sum == 100 {
            Ok(())
        } else {
            Err(EvaluationError::InvalidWeights(sum))
        }
    }
}

/// Turns page content into a scored evaluation. Scores depend only on the
/// content and target, never on the clock.
pub struct ContentEvaluator {
    extractor: Box<dyn Extractor>,
    weights: ScoringWeights,
    max_content_bytes: usize,
}

impl ContentEvaluator {
    pub fn new(weights: ScoringWeights, max_content_bytes: usize) -> Result<Self, EvaluationError> {
        Self::with_extractor(Box::new(CompositeExtractor::default()), weights, max_content_bytes)
    }

    pub fn with_extractor(
        extractor: Box<dyn Extractor>,
        weights: ScoringWeights,
        max_content_bytes: usize,
    ) -> Result<Self, EvaluationError> {
        weights.validate()?;
        Ok(Self {
            extractor,
            weights,
            max_content_bytes,
        })
    }

    pub fn weights(&self) -> ScoringWeights {
        self.weights
    }

    pub fn evaluate(
        &self,
        job_id: Uuid,
        target: &CrawlTarget,
        page: &PageContent,
    ) -> Result<PageEvaluation, EvaluationError> {
        if page.body.len() > self.max_content_bytes {
            return Err(EvaluationError::TooLarge {
                url: page.url.clone(),
                bytes: page.body.len(),
                limit: self.max_content_bytes,
            });
        }
        if page.body.contains('\0') {
            return Err(EvaluationError::Malformed {
                url: page.url.clone(),
                reason: "content contains NUL bytes".to_string(),
            });
        }

        let fields = if page.body.trim().is_empty() {
            CandidateFields::default()
        } else {
            self.extractor.extract(page, target)?
        };
        let breakdown = self.score(&fields, target);

        Ok(PageEvaluation {
            job_id,
            target_id: target.target_id.clone(),
            source_url: fields
                .canonical_url
                .clone()
                .unwrap_or_else(|| page.url.clone()),
            source_name: target.display_name.clone(),
            country: target.country.clone(),
            sector: target.primary_sector().map(str::to_string),
            score: breakdown.total(),
            breakdown,
            fields,
            evaluated_at: Utc::now(),
        })
    }

    pub fn score(&self, fields: &CandidateFields, target: &CrawlTarget) -> ScoreBreakdown {
        let w = &self.weights;

        let amount = match &fields.amount.value {
            Some(range) if range.currency.is_some() => 1.0,
            Some(_) => 0.8,
            None => 0.0,
        };

        let deadline = if fields.deadline.is_present() { 1.0 } else { 0.0 };

        let terms = target_terms(target);
        let matched = terms.iter().filter(|t| fields.keywords.contains(*t)).count();
        let needed = terms.len().min(KEYWORD_SATURATION).max(1);
        let keywords = (matched as f64 / needed as f64).min(1.0);

        let structure = match fields.markers.len() {
            0 => 0.0,
            1 => 0.5,
            _ => 1.0,
        };

        let mut completeness = 0.0;
        if fields
            .title
            .value
            .as_ref()
            .is_some_and(|t| t.chars().count() >= 10)
        {
            completeness += 0.4;
        }
        let description_len = fields
            .description
            .value
            .as_ref()
            .map_or(0, |d| d.chars().count());
        if description_len >= 100 {
            completeness += 0.6;
        } else if description_len >= 50 {
            completeness += 0.3;
        }

        ScoreBreakdown {
            amount: portion(w.amount, amount),
            deadline: portion(w.deadline, deadline),
            keywords: portion(w.keywords, keywords),
            structure: portion(w.structure, structure),
            completeness: portion(w.completeness, completeness),
        }
    }
}

fn portion(weight: u8, fraction: f64) -> u8 {
    (f64::from(weight) * fraction.clamp(0.0, 1.0)).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RICH_PAGE: &str = r#"<html><head><title>Water Access Grant 2026</title>
        <meta name="description" content="The fund invites applications from community organisations for funding of rural water access projects, with grants awarded twice a year.">
        </head><body><h1>Water Access Grant 2026</h1>
        <p>Grants of USD 20,000 - 50,000 are available for eligible projects.</p>
        <p>Deadline: 30 June 2026. Submit your application online.</p>
        </body></html>"#;

    fn page(url: &str, body: &str) -> PageContent {
        PageContent::html(
            url,
            body,
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
        )
    }

    fn evaluator() -> ContentEvaluator {
        ContentEvaluator::new(ScoringWeights::default(), 1024 * 1024).unwrap()
    }

    #[test]
    fn rich_grant_page_scores_full_marks() {
        let target = CrawlTarget::new("water", "https://funds.example.org", "Example Fund");
        let eval = evaluator()
            .evaluate(Uuid::new_v4(), &target, &page("https://funds.example.org/grants/water", RICH_PAGE))
            .unwrap();
        assert_eq!(eval.breakdown.amount, 25);
        assert_eq!(eval.breakdown.deadline, 20);
        assert_eq!(eval.breakdown.keywords, 25);
        assert_eq!(eval.breakdown.structure, 20);
        assert_eq!(eval.breakdown.completeness, 10);
        assert_eq!(eval.score, 100);
        assert_eq!(eval.source_name, "Example Fund");
    }

    #[test]
    fn unrelated_page_scores_low() {
        let target = CrawlTarget::new("news", "https://news.example.org", "News");
        let body = "<html><head><title>Weather</title></head><body><p>Sunny with light winds.</p></body></html>";
        let eval = evaluator()
            .evaluate(Uuid::new_v4(), &target, &page("https://news.example.org/weather", body))
            .unwrap();
        assert!(eval.score < 20, "score was {}", eval.score);
    }

    #[test]
    fn same_content_scores_the_same() {
        let target = CrawlTarget::new("water", "https://funds.example.org", "Example Fund");
        let content = page("https://funds.example.org/grants/water", RICH_PAGE);
        let e = evaluator();
        let a = e.evaluate(Uuid::new_v4(), &target, &content).unwrap();
        let b = e.evaluate(Uuid::new_v4(), &target, &content).unwrap();
        assert_eq!(a.breakdown, b.breakdown);
        assert_eq!(a.fields, b.fields);
    }

    #[test]
    fn empty_content_scores_zero() {
        let target = CrawlTarget::new("t", "https://funds.example.org", "Example Fund");
        let eval = evaluator()
            .evaluate(Uuid::new_v4(), &target, &page("https://funds.example.org/", "  \n "))
            .unwrap();
        assert_eq!(eval.score, 0);
        assert_eq!(eval.fields, CandidateFields::default());
    }

    #[test]
    fn malformed_and_oversized_content_are_errors() {
        let target = CrawlTarget::new("t", "https://funds.example.org", "Example Fund");
        let e = ContentEvaluator::new(ScoringWeights::default(), 16).unwrap();
        let err = e
            .evaluate(Uuid::new_v4(), &target, &page("https://funds.example.org/", "a\0b"))
            .unwrap_err();
        assert!(matches!(err, EvaluationError::Malformed { .. }));
        let err = e
            .evaluate(Uuid::new_v4(), &target, &page("https://funds.example.org/", &"x".repeat(17)))
            .unwrap_err();
        assert!(matches!(err, EvaluationError::TooLarge { bytes: 17, limit: 16, .. }));
    }

    #[test]
    fn weights_must_sum_to_one_hundred() {
        let weights = ScoringWeights {
            amount: 50,
            ..ScoringWeights::default()
        };
        assert!(matches!(
            ContentEvaluator::new(weights, 1024),
            Err(EvaluationError::InvalidWeights(125))
        ));
    }
}
