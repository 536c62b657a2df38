//! Append-only reward ledger with an optional JSON-lines journal.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fundscout_core::{ArtifactRef, RewardEntry, UpsertOutcome};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::error::LedgerError;

/// One award request. Points must be positive.
#[derive(Debug, Clone)]
pub struct Award {
    pub target_id: String,
    pub worker_id: String,
    pub fingerprint: String,
    pub outcome: UpsertOutcome,
    pub points: u32,
    pub reason: String,
    pub artifact: ArtifactRef,
}

#[derive(Debug, Default)]
pub struct RewardLedger {
    entries: RwLock<Vec<RewardEntry>>,
    journal: Option<PathBuf>,
    append_lock: Mutex<()>,
}

impl RewardLedger {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a journaled ledger, replaying any entries already on disk.
    pub async fn open(journal: PathBuf) -> Result<Self, LedgerError> {
        let io_err = |source| LedgerError::Io {
            path: journal.clone(),
            source,
        };
        let mut entries = Vec::new();
        if tokio::fs::try_exists(&journal).await.map_err(io_err)? {
            let raw = tokio::fs::read_to_string(&journal).await.map_err(io_err)?;
            for (idx, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: RewardEntry = serde_json::from_str(line).map_err(|source| {
                    LedgerError::Decode {
                        line: idx + 1,
                        source,
                    }
                })?;
                entries.push(entry);
            }
        }
        Ok(Self {
            entries: RwLock::new(entries),
            journal: Some(journal),
            append_lock: Mutex::new(()),
        })
    }

    pub async fn award(&self, award: Award, at: DateTime<Utc>) -> Result<RewardEntry, LedgerError> {
        if award.points == 0 {
            return Err(LedgerError::ZeroPoints);
        }
        let entry = RewardEntry {
            entry_id: Uuid::new_v4(),
            target_id: award.target_id,
            worker_id: award.worker_id,
            fingerprint: award.fingerprint,
            outcome: award.outcome,
            points: award.points,
            reason: award.reason,
            artifact: award.artifact,
            awarded_at: at,
        };

        let _append = self.append_lock.lock().await;
        if let Some(path) = &self.journal {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            let io_err = |source| LedgerError::Io {
                path: path.clone(),
                source,
            };
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(io_err)?;
            file.write_all(line.as_bytes()).await.map_err(io_err)?;
            file.flush().await.map_err(io_err)?;
        }
        self.entries.write().await.push(entry.clone());
        info!(
            target_id = %entry.target_id,
            worker_id = %entry.worker_id,
            points = entry.points,
            reason = %entry.reason,
            "reward awarded"
        );
        Ok(entry)
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> Vec<RewardEntry> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn total_points(&self) -> u64 {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| u64::from(e.points))
            .sum()
    }

    pub async fn totals_by_target(&self) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for entry in self.entries.read().await.iter() {
            *totals.entry(entry.target_id.clone()).or_default() += u64::from(entry.points);
        }
        totals
    }

    pub async fn totals_by_worker(&self) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for entry in self.entries.read().await.iter() {
            *totals.entry(entry.worker_id.clone()).or_default() += u64::from(entry.points);
        }
        totals
    }
}
