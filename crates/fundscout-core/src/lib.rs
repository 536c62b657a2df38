//! Core domain model for the funding opportunity discovery engine.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundscout-core";

pub const DEFAULT_REWARD_THRESHOLD: u8 = 70;

fn default_priority() -> i32 {
    5
}

fn default_rate_limit_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

/// Per-target CSS selector overrides consumed by the DOM extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorOverrides {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub deadline: Option<String>,
}

/// A registered URL the crawler may visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTarget {
    pub target_id: String,
    pub url: String,
    pub display_name: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub sectors: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_rate_limit_secs")]
    pub rate_limit_secs: u64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub last_visited: Option<DateTime<Utc>>,
    #[serde(default)]
    pub selectors: SelectorOverrides,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl CrawlTarget {
    pub fn new(
        target_id: impl Into<String>,
        url: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            url: url.into(),
            display_name: display_name.into(),
            country: None,
            sectors: Vec::new(),
            keywords: Vec::new(),
            priority: default_priority(),
            rate_limit_secs: default_rate_limit_secs(),
            active: true,
            last_visited: None,
            selectors: SelectorOverrides::default(),
            parent_id: None,
        }
    }

    pub fn rate_limit(&self) -> TimeDelta {
        TimeDelta::seconds(i64::try_from(self.rate_limit_secs).unwrap_or(i64::MAX / 1000))
    }

    /// Earliest instant the rate limit allows another visit. `None` means never visited.
    pub fn next_eligible_at(&self) -> Option<DateTime<Utc>> {
        self.last_visited
            .map(|visited| visited.checked_add_signed(self.rate_limit()).unwrap_or(visited))
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at().map_or(true, |at| now >= at)
    }

    /// First declared sector, used as the record's sector label.
    pub fn primary_sector(&self) -> Option<&str> {
        self.sectors.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Abandoned,
}

impl JobState {
    /// `Running -> Pending` is the cancellation path: the job goes back to the
    /// queue without consuming an attempt.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Pending)
                | (Failed, Pending)
                | (Failed, Abandoned)
                | (TimedOut, Pending)
                | (TimedOut, Abandoned)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid job transition {from:?} -> {to:?} for job {job_id}")]
pub struct TransitionError {
    pub job_id: Uuid,
    pub from: JobState,
    pub to: JobState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitJob {
    pub job_id: Uuid,
    pub target_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub attempt: u32,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl VisitJob {
    pub fn new(target_id: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            target_id: target_id.into(),
            scheduled_at,
            attempt: 0,
            state: JobState::Pending,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    pub fn transition(&mut self, next: JobState, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                job_id: self.job_id,
                from: self.state,
                to: next,
            });
        }
        match next {
            JobState::Running => {
                self.started_at = Some(at);
                self.finished_at = None;
            }
            JobState::Pending => {}
            _ => self.finished_at = Some(at),
        }
        self.state = next;
        Ok(())
    }
}

/// Raw page content as captured by a page session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,
    pub content_type: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

impl PageContent {
    pub fn html(url: impl Into<String>, body: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            content_type: "text/html".to_string(),
            body: body.into(),
            fetched_at,
        }
    }

    pub fn is_html(&self) -> bool {
        let media = self.content_type.split(';').next().unwrap_or_default().trim();
        media.eq_ignore_ascii_case("text/html") || media.eq_ignore_ascii_case("application/xhtml+xml")
    }
}

/// Where an extracted value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub extractor: String,
    pub pointer: String,
    pub snippet: String,
}

/// Extracted value with optional provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub provenance: Option<Provenance>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            provenance: None,
        }
    }

    pub fn with_value_and_provenance(value: T, provenance: Provenance) -> Self {
        Self {
            value: Some(value),
            provenance: Some(provenance),
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    /// Keep `self` when it holds a value, otherwise take `other`.
    pub fn or(self, other: Field<T>) -> Field<T> {
        if self.value.is_some() {
            self
        } else {
            other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountRange {
    pub min: f64,
    pub max: f64,
    pub currency: Option<String>,
}

impl AmountRange {
    /// Builds a range with `min <= max` regardless of argument order.
    pub fn new(a: f64, b: f64, currency: Option<String>) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
            currency,
        }
    }
}

/// Typed output of an extraction strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateFields {
    pub title: Field<String>,
    pub description: Field<String>,
    pub amount: Field<AmountRange>,
    pub deadline: Field<NaiveDate>,
    pub keywords: BTreeSet<String>,
    pub markers: BTreeSet<String>,
    pub canonical_url: Option<String>,
}

impl CandidateFields {
    /// Field-wise merge; values already present in `self` win.
    pub fn merge(self, other: CandidateFields) -> CandidateFields {
        let mut keywords = self.keywords;
        keywords.extend(other.keywords);
        let mut markers = self.markers;
        markers.extend(other.markers);
        CandidateFields {
            title: self.title.or(other.title),
            description: self.description.or(other.description),
            amount: self.amount.or(other.amount),
            deadline: self.deadline.or(other.deadline),
            keywords,
            markers,
            canonical_url: self.canonical_url.or(other.canonical_url),
        }
    }
}

/// Points per scoring signal. The sum is the quality score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub amount: u8,
    pub deadline: u8,
    pub keywords: u8,
    pub structure: u8,
    pub completeness: u8,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u8 {
        let sum = u16::from(self.amount)
            + u16::from(self.deadline)
            + u16::from(self.keywords)
            + u16::from(self.structure)
            + u16::from(self.completeness);
        sum.min(100) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEvaluation {
    pub job_id: Uuid,
    pub target_id: String,
    pub source_url: String,
    pub source_name: String,
    pub country: Option<String>,
    pub sector: Option<String>,
    pub fields: CandidateFields,
    pub score: u8,
    pub breakdown: ScoreBreakdown,
    pub evaluated_at: DateTime<Utc>,
}

/// Opaque reference to a stored evidence artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub relative_path: String,
    pub content_type: String,
    pub byte_size: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_rewardable(self) -> bool {
        matches!(self, UpsertOutcome::Created | UpsertOutcome::Updated)
    }
}

/// Canonical persisted funding opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub id: Uuid,
    pub fingerprint: String,
    pub title: String,
    pub description: Option<String>,
    pub country: Option<String>,
    pub sector: Option<String>,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub currency: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub source_url: String,
    pub source_name: String,
    pub target_id: String,
    pub keywords: Vec<String>,
    pub quality_score: u8,
    pub evidence: Option<ArtifactRef>,
    pub verified: bool,
    pub possible_duplicate_of: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OpportunityRecord {
    /// Builds an unverified record from an evaluation. A missing title falls back
    /// to the source name.
    pub fn from_evaluation(
        evaluation: &PageEvaluation,
        fingerprint: impl Into<String>,
        evidence: Option<ArtifactRef>,
        now: DateTime<Utc>,
    ) -> Self {
        let fields = &evaluation.fields;
        let amount = fields.amount.value.as_ref();
        Self {
            id: Uuid::new_v4(),
            fingerprint: fingerprint.into(),
            title: fields
                .title
                .value
                .clone()
                .unwrap_or_else(|| evaluation.source_name.clone()),
            description: fields.description.value.clone(),
            country: evaluation.country.clone(),
            sector: evaluation.sector.clone(),
            amount_min: amount.map(|a| a.min),
            amount_max: amount.map(|a| a.max),
            currency: amount.and_then(|a| a.currency.clone()),
            deadline: fields.deadline.value,
            source_url: evaluation.source_url.clone(),
            source_name: evaluation.source_name.clone(),
            target_id: evaluation.target_id.clone(),
            keywords: fields.keywords.iter().cloned().collect(),
            quality_score: evaluation.score,
            evidence,
            verified: false,
            possible_duplicate_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when `incoming` changes any tracked field. Gaining evidence counts as a
    /// change; losing it does not.
    pub fn tracked_fields_differ(&self, incoming: &OpportunityRecord) -> bool {
        self.title != incoming.title
            || self.description != incoming.description
            || self.country != incoming.country
            || self.sector != incoming.sector
            || self.amount_min != incoming.amount_min
            || self.amount_max != incoming.amount_max
            || self.currency != incoming.currency
            || self.deadline != incoming.deadline
            || self.source_name != incoming.source_name
            || self.keywords != incoming.keywords
            || (self.evidence.is_none() && incoming.evidence.is_some())
    }

    /// Copies tracked fields from `incoming`, keeping identity, verification state
    /// and creation time.
    pub fn apply_update(&mut self, incoming: &OpportunityRecord, now: DateTime<Utc>) {
        self.title = incoming.title.clone();
        self.description = incoming.description.clone();
        self.country = incoming.country.clone();
        self.sector = incoming.sector.clone();
        self.amount_min = incoming.amount_min;
        self.amount_max = incoming.amount_max;
        self.currency = incoming.currency.clone();
        self.deadline = incoming.deadline;
        self.source_name = incoming.source_name.clone();
        self.keywords = incoming.keywords.clone();
        self.quality_score = incoming.quality_score;
        if incoming.evidence.is_some() {
            self.evidence = incoming.evidence.clone();
        }
        self.updated_at = now;
    }
}

/// Append-only ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEntry {
    pub entry_id: Uuid,
    pub target_id: String,
    pub worker_id: String,
    pub fingerprint: String,
    pub outcome: UpsertOutcome,
    pub points: u32,
    pub reason: String,
    pub artifact: ArtifactRef,
    pub awarded_at: DateTime<Utc>,
}

/// Result of one visit, reported by the worker back to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitSummary {
    pub score: Option<u8>,
    pub persist: Option<UpsertOutcome>,
    pub evidence_captured: bool,
    pub points: u32,
    pub degraded: bool,
    pub discovered_targets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded(VisitSummary),
    Failed { reason: String },
    TimedOut { reason: String },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded(_) => JobState::Succeeded,
            JobOutcome::Failed { .. } => JobState::Failed,
            JobOutcome::TimedOut { .. } => JobState::TimedOut,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobOutcome::Succeeded(_) => None,
            JobOutcome::Failed { reason } | JobOutcome::TimedOut { reason } => Some(reason),
        }
    }
}

/// Inclusive `[min, max]` range used for randomized behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub min: u64,
    pub max: u64,
}

impl RangeSpec {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BehaviorRanges {
    pub actions: RangeSpec,
    pub scroll_px: RangeSpec,
    pub dwell_ms: RangeSpec,
    pub pointer_steps: RangeSpec,
}

impl Default for BehaviorRanges {
    fn default() -> Self {
        Self {
            actions: RangeSpec::new(2, 6),
            scroll_px: RangeSpec::new(200, 1200),
            dwell_ms: RangeSpec::new(300, 2500),
            pointer_steps: RangeSpec::new(3, 12),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RewardPolicy {
    pub created_points: u32,
    pub updated_points: u32,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            created_points: 10,
            updated_points: 3,
        }
    }
}

impl RewardPolicy {
    /// Points scale with the score; every rewardable outcome earns at least one.
    pub fn points_for(&self, score: u8, outcome: UpsertOutcome) -> u32 {
        let base = match outcome {
            UpsertOutcome::Created => self.created_points,
            UpsertOutcome::Updated => self.updated_points,
            UpsertOutcome::Unchanged => return 0,
        };
        let scaled = (f64::from(base) * f64::from(score.min(100)) / 100.0).round() as u32;
        scaled.max(1)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("screenshotThreshold must be within 0..=100, got {0}")]
    ThresholdOutOfRange(u8),
    #[error("maxConcurrentBots must be at least 1")]
    NoWorkers,
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
    #[error("range {name} has min {min} greater than max {max}")]
    InvertedRange { name: &'static str, min: u64, max: u64 },
    #[error("backoffBaseMs {base} exceeds backoffMaxMs {max}")]
    BackoffInverted { base: u64, max: u64 },
    #[error("range {name} max {max} exceeds the limit of {limit}")]
    RangeTooLarge { name: &'static str, max: u64, limit: u64 },
}

/// Operator-tunable crawl settings. Recognized collaborator keys are
/// `stealthMode`, `humanBehavior`, `screenshotThreshold`, `maxConcurrentBots`
/// and `delayBetweenRequests` (milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlSettings {
    pub stealth_mode: bool,
    pub human_behavior: bool,
    pub screenshot_threshold: u8,
    pub max_concurrent_bots: usize,
    pub delay_between_requests: u64,
    pub follow_links: bool,
    pub max_discovered_links: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub fetch_timeout_ms: u64,
    pub stable_timeout_ms: u64,
    pub quiet_window_ms: u64,
    pub capture_timeout_ms: u64,
    pub job_timeout_ms: u64,
    pub max_content_bytes: usize,
    pub behavior: BehaviorRanges,
    pub rewards: RewardPolicy,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            stealth_mode: true,
            human_behavior: true,
            screenshot_threshold: DEFAULT_REWARD_THRESHOLD,
            max_concurrent_bots: 4,
            delay_between_requests: 2_000,
            follow_links: false,
            max_discovered_links: 10,
            max_retries: 3,
            backoff_base_ms: 30_000,
            backoff_max_ms: 3_600_000,
            fetch_timeout_ms: 30_000,
            stable_timeout_ms: 10_000,
            quiet_window_ms: 500,
            capture_timeout_ms: 60_000,
            job_timeout_ms: 120_000,
            max_content_bytes: 5 * 1024 * 1024,
            behavior: BehaviorRanges::default(),
            rewards: RewardPolicy::default(),
        }
    }
}

impl CrawlSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.screenshot_threshold > 100 {
            return Err(SettingsError::ThresholdOutOfRange(self.screenshot_threshold));
        }
        if self.max_concurrent_bots == 0 {
            return Err(SettingsError::NoWorkers);
        }
        for (name, value) in [
            ("fetchTimeoutMs", self.fetch_timeout_ms),
            ("stableTimeoutMs", self.stable_timeout_ms),
            ("captureTimeoutMs", self.capture_timeout_ms),
            ("jobTimeoutMs", self.job_timeout_ms),
            ("backoffBaseMs", self.backoff_base_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::ZeroDuration { name });
            }
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(SettingsError::BackoffInverted {
                base: self.backoff_base_ms,
                max: self.backoff_max_ms,
            });
        }
        let b = &self.behavior;
        for (name, range, limit) in [
            ("behavior.actions", b.actions, 100),
            ("behavior.scrollPx", b.scroll_px, 100_000),
            ("behavior.dwellMs", b.dwell_ms, 60_000),
            ("behavior.pointerSteps", b.pointer_steps, 1_000),
        ] {
            if range.min > range.max {
                return Err(SettingsError::InvertedRange {
                    name,
                    min: range.min,
                    max: range.max,
                });
            }
            if range.max > limit {
                return Err(SettingsError::RangeTooLarge {
                    name,
                    max: range.max,
                    limit,
                });
            }
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn stable_timeout(&self) -> Duration {
        Duration::from_millis(self.stable_timeout_ms)
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.delay_between_requests)
    }
}
