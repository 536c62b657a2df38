use std::time::Duration;

use chrono::Utc;
use fundscout_core::{ArtifactRef, VisitJob};
use fundscout_storage::ArtifactStore;
use tracing::info;

use crate::error::CaptureError;
use crate::session::PageSession;

/// Captures page evidence into the artifact store.
#[derive(Debug, Clone)]
pub struct EvidenceCapturer {
    store: ArtifactStore,
}

impl EvidenceCapturer {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn capture(
        &self,
        session: &mut dyn PageSession,
        job: &VisitJob,
        timeout: Duration,
    ) -> Result<ArtifactRef, CaptureError> {
        let capture = tokio::time::timeout(timeout, session.capture())
            .await
            .map_err(|_| CaptureError::Timeout(timeout))??;
        if capture.bytes.is_empty() {
            return Err(CaptureError::Empty);
        }
        let stored = self
            .store
            .store_bytes(Utc::now(), &job.target_id, &capture.content_type, &capture.bytes)
            .await?;
        info!(
            job_id = %job.job_id,
            target_id = %job.target_id,
            artifact = %stored.relative_path.display(),
            deduplicated = stored.deduplicated,
            "evidence captured"
        );
        Ok(stored.to_ref())
    }
}
