//! Read-only projections over the scheduler snapshot feed and reward ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fundscout_core::{JobState, RewardEntry};
use fundscout_storage::OpportunityStore;
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

use crate::ledger::RewardLedger;
use crate::scheduler::{QueueSnapshot, TargetRun};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStatus {
    pub target_id: String,
    pub queued: bool,
    pub running: bool,
    pub next_visit_at: Option<DateTime<Utc>>,
    pub last_run: Option<TargetRun>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub generated_at: Option<DateTime<Utc>>,
    pub pending: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub abandoned: u64,
    pub review: Vec<String>,
    pub targets: Vec<TargetStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStats {
    pub jobs: BTreeMap<&'static str, u64>,
    pub pages_evaluated: u64,
    pub average_score: Option<f64>,
    pub opportunities_created: u64,
    pub opportunities_updated: u64,
    pub opportunities_unchanged: u64,
    pub opportunities_stored: Option<usize>,
    pub evidence_captured: u64,
    pub degraded_visits: u64,
    pub discovered_targets: u64,
    pub reward_entries: usize,
    pub total_points: u64,
    pub points_by_target: BTreeMap<String, u64>,
    pub points_by_worker: BTreeMap<String, u64>,
}

#[derive(Clone)]
pub struct StatusReporter {
    snapshots: watch::Receiver<Arc<QueueSnapshot>>,
    ledger: Arc<RewardLedger>,
    store: Arc<dyn OpportunityStore>,
}

impl StatusReporter {
    pub fn new(
        snapshots: watch::Receiver<Arc<QueueSnapshot>>,
        ledger: Arc<RewardLedger>,
        store: Arc<dyn OpportunityStore>,
    ) -> Self {
        Self {
            snapshots,
            ledger,
            store,
        }
    }

    fn snapshot(&self) -> Arc<QueueSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn queue_depth(&self) -> usize {
        self.snapshot().depth()
    }

    pub fn queue_status(&self) -> QueueStatus {
        let snap = self.snapshot();
        let mut targets: BTreeMap<&str, TargetStatus> = BTreeMap::new();
        let status_for = |id: &str| TargetStatus {
            target_id: id.to_string(),
            queued: false,
            running: false,
            next_visit_at: None,
            last_run: None,
        };

        for entry in &snap.queued {
            let status = targets
                .entry(entry.target_id.as_str())
                .or_insert_with(|| status_for(&entry.target_id));
            status.queued = true;
            status.next_visit_at = Some(entry.not_before);
        }
        for job in &snap.in_flight {
            targets
                .entry(job.target_id.as_str())
                .or_insert_with(|| status_for(&job.target_id))
                .running = true;
        }
        for (target_id, runs) in &snap.history {
            targets
                .entry(target_id.as_str())
                .or_insert_with(|| status_for(target_id))
                .last_run = runs.back().cloned();
        }

        QueueStatus {
            generated_at: snap.generated_at,
            pending: snap.counts.pending,
            running: snap.counts.running,
            succeeded: snap.counts.succeeded,
            failed: snap.counts.failed,
            timed_out: snap.counts.timed_out,
            abandoned: snap.counts.abandoned,
            review: snap.review.clone(),
            targets: targets.into_values().collect(),
        }
    }

    /// Newest run first.
    pub fn target_history(&self, target_id: &str) -> Vec<TargetRun> {
        self.snapshot()
            .history
            .get(target_id)
            .map(|runs| runs.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn aggregate_stats(&self) -> AggregateStats {
        let snap = self.snapshot();
        let counts = snap.counts;
        let totals = snap.totals;
        let jobs = BTreeMap::from([
            (JobState::Pending.as_str(), counts.pending as u64),
            (JobState::Running.as_str(), counts.running as u64),
            (JobState::Succeeded.as_str(), counts.succeeded),
            (JobState::Failed.as_str(), counts.failed),
            (JobState::TimedOut.as_str(), counts.timed_out),
            (JobState::Abandoned.as_str(), counts.abandoned),
        ]);
        let opportunities_stored = match self.store.count().await {
            Ok(n) => Some(n),
            Err(err) => {
                warn!(error = %err, "opportunity count unavailable");
                None
            }
        };
        AggregateStats {
            jobs,
            pages_evaluated: totals.evaluated,
            average_score: (totals.evaluated > 0)
                .then(|| totals.score_sum as f64 / totals.evaluated as f64),
            opportunities_created: totals.created,
            opportunities_updated: totals.updated,
            opportunities_unchanged: totals.unchanged,
            opportunities_stored,
            evidence_captured: totals.evidence_captured,
            degraded_visits: totals.degraded,
            discovered_targets: totals.discovered_targets,
            reward_entries: self.ledger.len().await,
            total_points: self.ledger.total_points().await,
            points_by_target: self.ledger.totals_by_target().await,
            points_by_worker: self.ledger.totals_by_worker().await,
        }
    }

    pub async fn reward_history(&self, limit: usize) -> Vec<RewardEntry> {
        self.ledger.recent(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingsHandle;
    use crate::registry::TargetRegistry;
    use crate::scheduler::Scheduler;
    use fundscout_core::{CrawlSettings, CrawlTarget, JobOutcome, UpsertOutcome, VisitSummary};
    use fundscout_storage::MemoryOpportunityStore;

    async fn fixture() -> (Scheduler, StatusReporter) {
        let targets = vec![
            CrawlTarget::new("a", "https://a.example.org", "A"),
            CrawlTarget::new("b", "https://b.example.org", "B"),
        ];
        let registry = Arc::new(TargetRegistry::from_targets(targets.clone()).unwrap());
        let scheduler = Scheduler::new(registry, SettingsHandle::new(CrawlSettings::default()).unwrap());
        for t in &targets {
            scheduler.enqueue(t, Utc::now()).await;
        }
        let reporter = StatusReporter::new(
            scheduler.subscribe(),
            Arc::new(RewardLedger::in_memory()),
            Arc::new(MemoryOpportunityStore::new()),
        );
        (scheduler, reporter)
    }

    #[tokio::test]
    async fn queue_status_tracks_runs_and_last_errors() {
        let (scheduler, reporter) = fixture().await;
        assert_eq!(reporter.queue_depth(), 2);

        let now = Utc::now();
        let first = scheduler.dequeue(now).await.unwrap();
        let status = reporter.queue_status();
        assert_eq!((status.pending, status.running), (1, 1));

        scheduler
            .complete(
                first.job_id,
                JobOutcome::Failed {
                    reason: "fetch failed: timeout".into(),
                },
                now,
            )
            .await
            .unwrap();
        let status = reporter.queue_status();
        assert_eq!(status.failed, 1);
        let row = status
            .targets
            .iter()
            .find(|t| t.target_id == first.target_id)
            .unwrap();
        assert!(row.queued);
        assert_eq!(
            row.last_run.as_ref().and_then(|r| r.error.as_deref()),
            Some("fetch failed: timeout")
        );
        assert_eq!(reporter.target_history(&first.target_id).len(), 1);
        assert!(reporter.target_history("missing").is_empty());
    }

    #[tokio::test]
    async fn aggregate_stats_average_scores_over_evaluated_pages() {
        let (scheduler, reporter) = fixture().await;
        let now = Utc::now();
        for (score, persist) in [(80, Some(UpsertOutcome::Created)), (40, None)] {
            let job = scheduler.dequeue(now).await.unwrap();
            let summary = VisitSummary {
                score: Some(score),
                persist,
                evidence_captured: persist.is_some(),
                ..VisitSummary::default()
            };
            scheduler
                .complete(job.job_id, JobOutcome::Succeeded(summary), now)
                .await
                .unwrap();
        }
        let stats = reporter.aggregate_stats().await;
        assert_eq!(stats.jobs["succeeded"], 2);
        assert_eq!(stats.average_score, Some(60.0));
        assert_eq!(stats.opportunities_created, 1);
        assert_eq!(stats.evidence_captured, 1);
        assert_eq!(stats.opportunities_stored, Some(0));
        assert_eq!(stats.total_points, 0);
    }
}
