//! Evidence artifact storage, HTTP fetch utilities and opportunity persistence.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fundscout_core::ArtifactRef;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod opportunities;

pub use opportunities::{
    run_migrations, MemoryOpportunityStore, OpportunityStore, PersistenceError, PgOpportunityStore,
};

pub const CRATE_NAME: &str = "fundscout-storage";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact path escapes the store root: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub content_type: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

impl StoredArtifact {
    /// Opaque reference handed to records, ledger entries and the API.
    pub fn to_ref(&self) -> ArtifactRef {
        let relative = self
            .relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        ArtifactRef {
            id: self.content_hash.clone(),
            url: format!("/artifacts/{relative}"),
            relative_path: relative,
            content_type: self.content_type.clone(),
            byte_size: self.byte_size as u64,
        }
    }
}

/// Content-addressed, write-once artifact directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn extension_for(content_type: &str) -> &'static str {
        match content_type.split(';').next().map(str::trim) {
            Some("text/html") => "html",
            Some("image/png") => "png",
            Some("image/jpeg") => "jpg",
            Some("application/json") => "json",
            Some("text/plain") => "txt",
            _ => "bin",
        }
    }

    pub fn artifact_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        target_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = captured_at.format("%Y%m%d").to_string();
        let owner = sanitize_segment(target_id);
        PathBuf::from(day)
            .join(owner)
            .join(format!("{content_hash}.{extension}"))
    }

    /// Writes `bytes` once under a hash-addressed path. Concurrent writers of the
    /// same bytes race on an atomic rename and both observe the same artifact.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        target_id: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredArtifact, ArtifactError> {
        let content_hash = Self::sha256_hex(bytes);
        let extension = Self::extension_for(content_type);
        let relative_path =
            self.artifact_relative_path(captured_at, target_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            content_type: content_type.to_string(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let Some(parent) = absolute_path.parent() else {
            return Err(ArtifactError::InvalidPath(relative_path.display().to_string()));
        };
        fs::create_dir_all(parent).await.map_err(|source| ArtifactError::Io {
            path: parent.to_path_buf(),
            source,
        })?;

        if fs::try_exists(&absolute_path).await.unwrap_or(false) {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let io_err = |source| ArtifactError::Io {
            path: temp_path.clone(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(ArtifactError::Io {
                    path: absolute_path.clone(),
                    source,
                })
            }
        }
    }

    /// Reads an artifact by its relative path, refusing anything outside the root.
    pub async fn read(&self, relative_path: &str) -> Result<Vec<u8>, ArtifactError> {
        let relative = Path::new(relative_path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || relative_path.is_empty() {
            return Err(ArtifactError::InvalidPath(relative_path.to_string()));
        }
        let path = self.root.join(relative);
        fs::read(&path)
            .await
            .map_err(|source| ArtifactError::Io { path, source })
    }
}

fn sanitize_segment(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-request header overrides (stealth profiles set these).
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch of {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// GET `url` with bounded global and per-host concurrency, retrying transient
    /// failures according to the backoff policy.
    pub async fn fetch(
        &self,
        target_id: &str,
        url: &str,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let span = info_span!("http_fetch", target_id, url, host = %host);
        async move {
            // Semaphores are owned by this fetcher and never closed.
            let _global = self.global_limit.acquire().await.ok();
            let per_host = self.per_host_semaphore(&host).await;
            let _host = per_host.acquire().await.ok();

            let mut attempt = 0u32;
            loop {
                let mut request = self.client.get(parsed.clone());
                for (name, value) in &options.headers {
                    request = request.header(name.as_str(), value.as_str());
                }

                let (disposition, err) = match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        if status.is_success() {
                            let content_type = resp
                                .headers()
                                .get(reqwest::header::CONTENT_TYPE)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("text/html")
                                .to_string();
                            let body = match resp.bytes().await {
                                Ok(bytes) => bytes.to_vec(),
                                Err(err) => return Err(FetchError::Request(err)),
                            };
                            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                content_type,
                                body,
                            });
                        }
                        let err = FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        };
                        (classify_status(status), err)
                    }
                    Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
                };

                if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries
                {
                    return Err(err);
                }
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_evidence_is_stored_once_and_readable_by_ref() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let captured_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(captured_at, "un-jobs/ss", "text/html; charset=utf-8", b"<html>grant</html>")
            .await
            .expect("first store");
        let second = store
            .store_bytes(captured_at, "un-jobs/ss", "text/html", b"<html>grant</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);

        let reference = first.to_ref();
        assert!(reference.relative_path.starts_with("20260224/un-jobs_ss/"));
        assert!(reference.relative_path.ends_with(".html"));
        assert_eq!(reference.url, format!("/artifacts/{}", reference.relative_path));
        let bytes = store.read(&reference.relative_path).await.expect("read");
        assert_eq!(bytes, b"<html>grant</html>");
    }

    #[tokio::test]
    async fn reading_outside_root_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        assert!(matches!(
            store.read("../etc/passwd").await,
            Err(ArtifactError::InvalidPath(_))
        ));
        assert!(matches!(store.read("/etc/passwd").await, Err(ArtifactError::InvalidPath(_))));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn malformed_url_is_not_fetched() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher
            .fetch("t1", "not a url", &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }
}
