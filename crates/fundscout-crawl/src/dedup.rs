//! Content fingerprints and serialized upserts of opportunity records.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fundscout_core::{ArtifactRef, OpportunityRecord, PageEvaluation, UpsertOutcome};
use fundscout_storage::{OpportunityStore, PersistenceError};
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

pub const NEAR_DUPLICATE_THRESHOLD: f64 = 0.92;

pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lower-cased URL without fragment or trailing slash.
pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    let mut out = match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => trimmed.to_string(),
    };
    out.make_ascii_lowercase();
    while out.ends_with('/') {
        out.pop();
    }
    out
}

/// Stable SHA-256 over normalized title, source URL, amount range and deadline.
pub fn fingerprint(evaluation: &PageEvaluation) -> String {
    let fields = &evaluation.fields;
    let title = fields
        .title
        .value
        .as_deref()
        .unwrap_or(evaluation.source_name.as_str());
    let amount = fields
        .amount
        .value
        .as_ref()
        .map(|a| {
            format!(
                "{:.2}-{:.2}-{}",
                a.min,
                a.max,
                a.currency.as_deref().unwrap_or_default().to_lowercase()
            )
        })
        .unwrap_or_default();
    let deadline = fields
        .deadline
        .value
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    for part in [
        normalize_text(title),
        normalize_url(&evaluation.source_url),
        amount,
        deadline,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// Upserts records with writes serialized per fingerprint.
pub struct Persister {
    store: Arc<dyn OpportunityStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    near_duplicate_threshold: f64,
}

impl Persister {
    pub fn new(store: Arc<dyn OpportunityStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            near_duplicate_threshold: NEAR_DUPLICATE_THRESHOLD,
        }
    }

    pub fn store(&self) -> &Arc<dyn OpportunityStore> {
        &self.store
    }

    async fn fingerprint_lock(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Storage conflicts are retried once; a second conflict is returned.
    pub async fn upsert(
        &self,
        evaluation: &PageEvaluation,
        fingerprint: &str,
        evidence: Option<ArtifactRef>,
        now: DateTime<Utc>,
    ) -> Result<(UpsertOutcome, OpportunityRecord), PersistenceError> {
        let lock = self.fingerprint_lock(fingerprint).await;
        let _guard = lock.lock().await;

        match self.try_upsert(evaluation, fingerprint, evidence.clone(), now).await {
            Err(err) if err.is_conflict() => {
                debug!(fingerprint, "storage conflict; retrying upsert");
                self.try_upsert(evaluation, fingerprint, evidence, now).await
            }
            other => other,
        }
    }

    async fn try_upsert(
        &self,
        evaluation: &PageEvaluation,
        fingerprint: &str,
        evidence: Option<ArtifactRef>,
        now: DateTime<Utc>,
    ) -> Result<(UpsertOutcome, OpportunityRecord), PersistenceError> {
        let incoming = OpportunityRecord::from_evaluation(evaluation, fingerprint, evidence, now);

        let Some(existing) = self.store.get(fingerprint).await? else {
            let mut record = incoming;
            record.possible_duplicate_of = self.near_duplicate(&record).await?;
            self.store.insert(&record).await?;
            info!(
                fingerprint,
                title = %record.title,
                possible_duplicate_of = record.possible_duplicate_of.as_deref().unwrap_or(""),
                "opportunity created"
            );
            return Ok((UpsertOutcome::Created, record));
        };

        if !existing.tracked_fields_differ(&incoming) {
            return Ok((UpsertOutcome::Unchanged, existing));
        }
        let mut updated = existing;
        updated.apply_update(&incoming, now);
        self.store.update(&updated).await?;
        info!(fingerprint, title = %updated.title, "opportunity updated");
        Ok((UpsertOutcome::Updated, updated))
    }

    async fn near_duplicate(
        &self,
        record: &OpportunityRecord,
    ) -> Result<Option<String>, PersistenceError> {
        let title = normalize_text(&record.title);
        let best = self
            .store
            .titles()
            .await?
            .into_iter()
            .filter(|(fp, _)| fp != &record.fingerprint)
            .map(|(fp, other)| (jaro_winkler(&title, &normalize_text(&other)), fp))
            .filter(|(score, _)| *score >= self.near_duplicate_threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
        Ok(best.map(|(_, fp)| fp))
    }
}
