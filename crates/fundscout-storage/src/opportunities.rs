//! Opportunity record persistence keyed by content fingerprint.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use fundscout_core::{ArtifactRef, OpportunityRecord};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("fingerprint {fingerprint} already exists")]
    Conflict { fingerprint: String },
    #[error("no record with fingerprint {fingerprint}")]
    NotFound { fingerprint: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl PersistenceError {
    /// Conflicts resolve on a re-read; everything else is reported as-is.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PersistenceError::Conflict { .. })
    }
}

/// Storage backend for opportunity records. The fingerprint is unique: `insert`
/// must fail with [`PersistenceError::Conflict`] rather than create a second row.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Result<Option<OpportunityRecord>, PersistenceError>;
    async fn insert(&self, record: &OpportunityRecord) -> Result<(), PersistenceError>;
    async fn update(&self, record: &OpportunityRecord) -> Result<(), PersistenceError>;
    /// Most recently updated first.
    async fn list(&self, limit: usize) -> Result<Vec<OpportunityRecord>, PersistenceError>;
    /// `(fingerprint, title)` pairs for near-duplicate checks.
    async fn titles(&self) -> Result<Vec<(String, String)>, PersistenceError>;
    async fn set_verified(&self, fingerprint: &str, verified: bool) -> Result<(), PersistenceError>;
    async fn count(&self) -> Result<usize, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct MemoryOpportunityStore {
    records: RwLock<HashMap<String, OpportunityRecord>>,
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<OpportunityRecord>, PersistenceError> {
        Ok(self.records.read().await.get(fingerprint).cloned())
    }

    async fn insert(&self, record: &OpportunityRecord) -> Result<(), PersistenceError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.fingerprint) {
            return Err(PersistenceError::Conflict {
                fingerprint: record.fingerprint.clone(),
            });
        }
        records.insert(record.fingerprint.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &OpportunityRecord) -> Result<(), PersistenceError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.fingerprint) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(PersistenceError::NotFound {
                fingerprint: record.fingerprint.clone(),
            }),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<OpportunityRecord>, PersistenceError> {
        let records = self.records.read().await;
        let mut out = records.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        out.truncate(limit);
        Ok(out)
    }

    async fn titles(&self) -> Result<Vec<(String, String)>, PersistenceError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .map(|r| (r.fingerprint.clone(), r.title.clone()))
            .collect())
    }

    async fn set_verified(&self, fingerprint: &str, verified: bool) -> Result<(), PersistenceError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(fingerprint)
            .ok_or_else(|| PersistenceError::NotFound {
                fingerprint: fingerprint.to_string(),
            })?;
        record.verified = verified;
        Ok(())
    }

    async fn count(&self) -> Result<usize, PersistenceError> {
        Ok(self.records.read().await.len())
    }
}

/// Postgres-backed store; the unique index on `fingerprint` is the race guard.
#[derive(Debug, Clone)]
pub struct PgOpportunityStore {
    pool: PgPool,
}

impl PgOpportunityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("applying opportunity migrations")
}

const SELECT_COLUMNS: &str = r#"
    id, fingerprint, title, description, country, sector, amount_min, amount_max,
    currency, deadline, source_url, source_name, target_id, keywords, quality_score,
    evidence, verified, possible_duplicate_of, created_at, updated_at
"#;

fn record_from_row(row: &PgRow) -> Result<OpportunityRecord, PersistenceError> {
    let keywords: serde_json::Value = row.try_get("keywords")?;
    let evidence: Option<serde_json::Value> = row.try_get("evidence")?;
    let quality_score: i16 = row.try_get("quality_score")?;
    Ok(OpportunityRecord {
        id: row.try_get("id")?,
        fingerprint: row.try_get("fingerprint")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        country: row.try_get("country")?,
        sector: row.try_get("sector")?,
        amount_min: row.try_get("amount_min")?,
        amount_max: row.try_get("amount_max")?,
        currency: row.try_get("currency")?,
        deadline: row.try_get("deadline")?,
        source_url: row.try_get("source_url")?,
        source_name: row.try_get("source_name")?,
        target_id: row.try_get("target_id")?,
        keywords: serde_json::from_value(keywords)?,
        quality_score: quality_score.clamp(0, 100) as u8,
        evidence: evidence
            .map(serde_json::from_value::<ArtifactRef>)
            .transpose()?,
        verified: row.try_get("verified")?,
        possible_duplicate_of: row.try_get("possible_duplicate_of")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OpportunityStore for PgOpportunityStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<OpportunityRecord>, PersistenceError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM opportunities WHERE fingerprint = $1");
        let row = sqlx::query(&sql)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert(&self, record: &OpportunityRecord) -> Result<(), PersistenceError> {
        let evidence = record.evidence.as_ref().map(serde_json::to_value).transpose()?;
        let result = sqlx::query(
            r#"
            INSERT INTO opportunities (
                id, fingerprint, title, description, country, sector, amount_min, amount_max,
                currency, deadline, source_url, source_name, target_id, keywords, quality_score,
                evidence, verified, possible_duplicate_of, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.fingerprint)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.country)
        .bind(&record.sector)
        .bind(record.amount_min)
        .bind(record.amount_max)
        .bind(&record.currency)
        .bind(record.deadline)
        .bind(&record.source_url)
        .bind(&record.source_name)
        .bind(&record.target_id)
        .bind(serde_json::to_value(&record.keywords)?)
        .bind(i16::from(record.quality_score))
        .bind(evidence)
        .bind(record.verified)
        .bind(&record.possible_duplicate_of)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::Conflict {
                fingerprint: record.fingerprint.clone(),
            });
        }
        Ok(())
    }

    async fn update(&self, record: &OpportunityRecord) -> Result<(), PersistenceError> {
        let evidence = record.evidence.as_ref().map(serde_json::to_value).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE opportunities
               SET title = $2,
                   description = $3,
                   country = $4,
                   sector = $5,
                   amount_min = $6,
                   amount_max = $7,
                   currency = $8,
                   deadline = $9,
                   source_name = $10,
                   keywords = $11,
                   quality_score = $12,
                   evidence = $13,
                   updated_at = $14
             WHERE fingerprint = $1
            "#,
        )
        .bind(&record.fingerprint)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.country)
        .bind(&record.sector)
        .bind(record.amount_min)
        .bind(record.amount_max)
        .bind(&record.currency)
        .bind(record.deadline)
        .bind(&record.source_name)
        .bind(serde_json::to_value(&record.keywords)?)
        .bind(i16::from(record.quality_score))
        .bind(evidence)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound {
                fingerprint: record.fingerprint.clone(),
            });
        }
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<OpportunityRecord>, PersistenceError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM opportunities ORDER BY updated_at DESC, fingerprint LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn titles(&self) -> Result<Vec<(String, String)>, PersistenceError> {
        let rows = sqlx::query("SELECT fingerprint, title FROM opportunities")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get("fingerprint")?, row.try_get("title")?));
        }
        Ok(out)
    }

    async fn set_verified(&self, fingerprint: &str, verified: bool) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            "UPDATE opportunities SET verified = $2, updated_at = NOW() WHERE fingerprint = $1",
        )
        .bind(fingerprint)
        .bind(verified)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound {
                fingerprint: fingerprint.to_string(),
            });
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, PersistenceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunities")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
