//! One visit job, end to end: fetch, simulate, evaluate, then capture,
//! persist and reward when the page scores high enough.

use std::sync::Arc;

use chrono::Utc;
use fundscout_core::{
    ArtifactRef, CrawlSettings, CrawlTarget, JobOutcome, PageContent, UpsertOutcome, VisitJob,
    VisitSummary,
};
use fundscout_extract::{discover_links, ContentEvaluator};
use fundscout_storage::FetchError;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::behavior::BehaviorSimulator;
use crate::dedup::{fingerprint, Persister};
use crate::error::JobError;
use crate::evidence::EvidenceCapturer;
use crate::ledger::{Award, RewardLedger};
use crate::registry::TargetRegistry;
use crate::scheduler::Scheduler;
use crate::session::SessionFactory;

/// A reward is owed only for a page at or above the threshold whose evidence
/// was captured and whose record was created or changed.
pub fn reward_decision(
    score: u8,
    threshold: u8,
    evidence: Option<&ArtifactRef>,
    outcome: UpsertOutcome,
) -> bool {
    score >= threshold && evidence.is_some() && outcome.is_rewardable()
}

pub struct Pipeline {
    pub registry: Arc<TargetRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub sessions: Arc<dyn SessionFactory>,
    pub simulator: BehaviorSimulator,
    pub evaluator: ContentEvaluator,
    pub capturer: EvidenceCapturer,
    pub persister: Persister,
    pub ledger: Arc<RewardLedger>,
}

impl Pipeline {
    /// Runs the job under the settings' job ceiling. Never returns an error:
    /// every failure becomes a `Failed` or `TimedOut` outcome for the scheduler.
    pub async fn run(&self, job: &VisitJob, settings: &CrawlSettings, worker_id: &str) -> JobOutcome {
        let span = info_span!(
            "visit_job",
            job_id = %job.job_id,
            target_id = %job.target_id,
            attempt = job.attempt,
            worker_id
        );
        async move {
            let ceiling = settings.job_timeout();
            match tokio::time::timeout(ceiling, self.visit(job, settings, worker_id)).await {
                Ok(Ok(summary)) => {
                    info!(
                        score = summary.score,
                        persist = ?summary.persist,
                        points = summary.points,
                        degraded = summary.degraded,
                        "visit finished"
                    );
                    JobOutcome::Succeeded(summary)
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "visit failed");
                    JobOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
                Err(_) => {
                    warn!(timeout = ?ceiling, "visit exceeded job ceiling");
                    JobOutcome::TimedOut {
                        reason: format!("job exceeded {ceiling:?}"),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn visit(
        &self,
        job: &VisitJob,
        settings: &CrawlSettings,
        worker_id: &str,
    ) -> Result<VisitSummary, JobError> {
        let target = self
            .registry
            .get(&job.target_id)
            .await
            .ok_or_else(|| JobError::UnknownTarget(job.target_id.clone()))?;

        let fetch_timeout = settings.fetch_timeout();
        let mut session = tokio::time::timeout(fetch_timeout, self.sessions.open(&target, settings))
            .await
            .map_err(|_| FetchError::Timeout {
                url: target.url.clone(),
                after: fetch_timeout,
            })??;

        let (page, report) = self.simulator.run(&mut *session, settings).await;
        let evaluation = self.evaluator.evaluate(job.job_id, &target, &page)?;

        let mut summary = VisitSummary {
            score: Some(evaluation.score),
            degraded: report.degraded(),
            ..VisitSummary::default()
        };
        if settings.follow_links {
            summary.discovered_targets = self.follow_links(&target, &page, settings).await;
        }

        let threshold = settings.screenshot_threshold;
        if evaluation.score < threshold {
            debug!(score = evaluation.score, threshold, "below reward threshold; not persisted");
            return Ok(summary);
        }

        let evidence = match self
            .capturer
            .capture(&mut *session, job, settings.capture_timeout())
            .await
        {
            Ok(artifact) => Some(artifact),
            Err(err) => {
                warn!(error = %err, "evidence capture failed; no reward for this visit");
                None
            }
        };
        summary.evidence_captured = evidence.is_some();

        let fp = fingerprint(&evaluation);
        let (outcome, _record) = self
            .persister
            .upsert(&evaluation, &fp, evidence.clone(), Utc::now())
            .await?;
        summary.persist = Some(outcome);

        if let Some(artifact) = evidence
            .filter(|artifact| reward_decision(evaluation.score, threshold, Some(artifact), outcome))
        {
            let points = settings.rewards.points_for(evaluation.score, outcome);
            let reason = match outcome {
                UpsertOutcome::Created => format!("new opportunity scored {}", evaluation.score),
                _ => format!("updated opportunity scored {}", evaluation.score),
            };
            let award = Award {
                target_id: target.target_id.clone(),
                worker_id: worker_id.to_string(),
                fingerprint: fp,
                outcome,
                points,
                reason,
                artifact,
            };
            match self.ledger.award(award, Utc::now()).await {
                Ok(entry) => summary.points = entry.points,
                Err(err) => error!(error = %err, "reward could not be recorded"),
            }
        }
        Ok(summary)
    }

    /// Registers opportunity-looking links as child targets and queues them.
    async fn follow_links(
        &self,
        target: &CrawlTarget,
        page: &PageContent,
        settings: &CrawlSettings,
    ) -> usize {
        let links = match discover_links(page, settings.max_discovered_links) {
            Ok(links) => links,
            Err(err) => {
                warn!(error = %err, "link discovery failed");
                return 0;
            }
        };
        if links.is_empty() {
            return 0;
        }
        let children = match self
            .registry
            .register_discovered(&target.target_id, &links, settings.max_discovered_links)
            .await
        {
            Ok(children) => children,
            Err(err) => {
                warn!(error = %err, "could not register discovered links");
                return 0;
            }
        };
        let now = Utc::now();
        for child in &children {
            self.scheduler.enqueue(child, now).await;
        }
        if !children.is_empty() {
            info!(count = children.len(), "registered discovered targets");
        }
        children.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::ThreadRandom;
    use crate::config::SettingsHandle;
    use crate::error::{CaptureError, SimulationError};
    use crate::session::{Capture, PageSession};
    use async_trait::async_trait;
    use fundscout_extract::ScoringWeights;
    use fundscout_storage::{ArtifactStore, MemoryOpportunityStore};
    use std::time::Duration;

    fn artifact() -> ArtifactRef {
        ArtifactRef {
            id: "abc".into(),
            relative_path: "20260301/t/abc.html".into(),
            content_type: "text/html".into(),
            byte_size: 10,
            url: "/artifacts/20260301/t/abc.html".into(),
        }
    }

    #[test]
    fn reward_fires_at_the_threshold_boundary() {
        let a = artifact();
        assert!(reward_decision(70, 70, Some(&a), UpsertOutcome::Created));
        assert!(reward_decision(70, 70, Some(&a), UpsertOutcome::Updated));
        assert!(!reward_decision(69, 70, Some(&a), UpsertOutcome::Created));
        assert!(!reward_decision(90, 70, None, UpsertOutcome::Created));
        assert!(!reward_decision(90, 70, Some(&a), UpsertOutcome::Unchanged));
    }

    struct StalledFetch;

    #[async_trait]
    impl SessionFactory for StalledFetch {
        async fn open(
            &self,
            _target: &CrawlTarget,
            _settings: &CrawlSettings,
        ) -> Result<Box<dyn PageSession>, FetchError> {
            std::future::pending().await
        }
    }

    struct FrozenPage;

    #[async_trait]
    impl PageSession for FrozenPage {
        fn url(&self) -> &str {
            "https://frozen.example.org"
        }
        async fn scroll_by(&mut self, _dy: i64) -> Result<(), SimulationError> {
            Ok(())
        }
        async fn move_pointer(&mut self, _x: u32, _y: u32, _s: u32) -> Result<(), SimulationError> {
            Ok(())
        }
        async fn dwell(&mut self, _d: Duration) -> Result<(), SimulationError> {
            Ok(())
        }
        async fn wait_for_quiet(&mut self, _q: Duration) -> Result<(), SimulationError> {
            Ok(())
        }
        async fn content(&mut self) -> Result<PageContent, SimulationError> {
            std::future::pending().await
        }
        async fn capture(&mut self) -> Result<Capture, CaptureError> {
            Err(CaptureError::Empty)
        }
    }

    /// Opens fine, but its content can never be read.
    struct UnreadablePage;

    #[async_trait]
    impl PageSession for UnreadablePage {
        fn url(&self) -> &str {
            "https://slow.example.org"
        }
        async fn scroll_by(&mut self, _dy: i64) -> Result<(), SimulationError> {
            Ok(())
        }
        async fn move_pointer(&mut self, _x: u32, _y: u32, _s: u32) -> Result<(), SimulationError> {
            Ok(())
        }
        async fn dwell(&mut self, _d: Duration) -> Result<(), SimulationError> {
            Ok(())
        }
        async fn wait_for_quiet(&mut self, _q: Duration) -> Result<(), SimulationError> {
            Ok(())
        }
        async fn content(&mut self) -> Result<PageContent, SimulationError> {
            Err(SimulationError::Content("document detached".into()))
        }
        async fn capture(&mut self) -> Result<Capture, CaptureError> {
            Err(CaptureError::Empty)
        }
    }

    struct UnreadableFactory;

    #[async_trait]
    impl SessionFactory for UnreadableFactory {
        async fn open(
            &self,
            _target: &CrawlTarget,
            _settings: &CrawlSettings,
        ) -> Result<Box<dyn PageSession>, FetchError> {
            Ok(Box::new(UnreadablePage))
        }
    }

    struct FrozenFactory;

    #[async_trait]
    impl SessionFactory for FrozenFactory {
        async fn open(
            &self,
            _target: &CrawlTarget,
            _settings: &CrawlSettings,
        ) -> Result<Box<dyn PageSession>, FetchError> {
            Ok(Box::new(FrozenPage))
        }
    }

    fn pipeline(sessions: Arc<dyn SessionFactory>, dir: &std::path::Path) -> Pipeline {
        let registry = Arc::new(
            TargetRegistry::from_targets(vec![CrawlTarget::new(
                "slow",
                "https://slow.example.org",
                "Slow",
            )])
            .unwrap(),
        );
        let settings = SettingsHandle::new(CrawlSettings::default()).unwrap();
        Pipeline {
            scheduler: Arc::new(Scheduler::new(registry.clone(), settings)),
            registry,
            sessions,
            simulator: BehaviorSimulator::new(Arc::new(ThreadRandom)),
            evaluator: ContentEvaluator::new(ScoringWeights::default(), 1 << 20).unwrap(),
            capturer: EvidenceCapturer::new(ArtifactStore::new(dir)),
            persister: Persister::new(Arc::new(MemoryOpportunityStore::new())),
            ledger: Arc::new(RewardLedger::in_memory()),
        }
    }

    fn quick_settings() -> CrawlSettings {
        CrawlSettings {
            human_behavior: false,
            fetch_timeout_ms: 1_000,
            job_timeout_ms: 5_000,
            ..CrawlSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_timeout_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(StalledFetch), dir.path());
        let job = VisitJob::new("slow", Utc::now());
        let outcome = p.run(&job, &quick_settings(), "bot-0").await;
        match outcome {
            JobOutcome::Failed { reason } => assert!(reason.contains("timed out"), "{reason}"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn job_ceiling_marks_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(FrozenFactory), dir.path());
        let job = VisitJob::new("slow", Utc::now());
        let outcome = p.run(&job, &quick_settings(), "bot-0").await;
        assert!(matches!(outcome, JobOutcome::TimedOut { .. }), "{outcome:?}");
    }

    #[tokio::test]
    async fn unknown_target_fails_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(FrozenFactory), dir.path());
        let job = VisitJob::new("ghost", Utc::now());
        let outcome = p.run(&job, &quick_settings(), "bot-0").await;
        assert_eq!(outcome.error(), Some("unknown target ghost"));
    }

    #[tokio::test]
    async fn unreadable_content_degrades_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(UnreadableFactory), dir.path());
        let job = VisitJob::new("slow", Utc::now());
        match p.run(&job, &quick_settings(), "bot-0").await {
            JobOutcome::Succeeded(summary) => {
                assert!(summary.degraded);
                assert_eq!(summary.score, Some(0));
                assert_eq!(summary.persist, None);
            }
            other => panic!("expected a degraded success, got {other:?}"),
        }
    }
}
