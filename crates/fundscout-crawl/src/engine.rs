//! Engine lifecycle: assembly, the worker pool, stop with queue snapshot, and
//! the operator-facing operations the API and CLI call.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fundscout_core::{
    CrawlSettings, CrawlTarget, OpportunityRecord, RangeSpec, RewardEntry, SettingsError,
};
use fundscout_extract::{ContentEvaluator, ScoringWeights};
use fundscout_storage::{
    ArtifactStore, HttpClientConfig, MemoryOpportunityStore, OpportunityStore, PgOpportunityStore,
};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::behavior::{BehaviorSimulator, RandomSource, ThreadRandom};
use crate::config::{EngineConfig, SettingsHandle};
use crate::dedup::Persister;
use crate::error::{EngineError, RegistryError};
use crate::evidence::EvidenceCapturer;
use crate::ledger::RewardLedger;
use crate::registry::TargetRegistry;
use crate::scheduler::{PersistedQueue, Scheduler, TargetRun};
use crate::session::{HttpSessionFactory, SessionFactory};
use crate::status::StatusReporter;
use crate::worker::Pipeline;

/// Worker poll interval while the queue has nothing eligible.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Everything the engine is assembled from.
pub struct EngineParts {
    pub registry: TargetRegistry,
    pub settings: CrawlSettings,
    pub weights: ScoringWeights,
    pub store: Arc<dyn OpportunityStore>,
    pub artifacts: ArtifactStore,
    pub sessions: Arc<dyn SessionFactory>,
    pub random: Arc<dyn RandomSource>,
    pub ledger: RewardLedger,
    /// Where the queue snapshot is written on stop; `None` disables it.
    pub state_dir: Option<PathBuf>,
}

struct RunningCrawl {
    token: CancellationToken,
    workers: JoinSet<()>,
}

pub struct DiscoveryEngine {
    pipeline: Arc<Pipeline>,
    settings: SettingsHandle,
    random: Arc<dyn RandomSource>,
    store: Arc<dyn OpportunityStore>,
    status: StatusReporter,
    state_dir: Option<PathBuf>,
    running: Mutex<Option<RunningCrawl>>,
}

impl DiscoveryEngine {
    pub fn new(parts: EngineParts) -> Result<Self, EngineError> {
        let settings = SettingsHandle::new(parts.settings)?;
        let current = settings.current();
        let registry = Arc::new(parts.registry);
        let scheduler = Arc::new(Scheduler::new(registry.clone(), settings.clone()));
        let ledger = Arc::new(parts.ledger);
        let status = StatusReporter::new(scheduler.subscribe(), ledger.clone(), parts.store.clone());
        let pipeline = Pipeline {
            registry,
            scheduler,
            sessions: parts.sessions,
            simulator: BehaviorSimulator::new(parts.random.clone()),
            evaluator: ContentEvaluator::new(parts.weights, current.max_content_bytes)?,
            capturer: EvidenceCapturer::new(parts.artifacts),
            persister: Persister::new(parts.store.clone()),
            ledger,
        };
        Ok(Self {
            pipeline: Arc::new(pipeline),
            settings,
            random: parts.random,
            store: parts.store,
            status,
            state_dir: parts.state_dir,
            running: Mutex::new(None),
        })
    }

    /// Production assembly from environment configuration: registry file
    /// (or its saved copy under the state directory), optional settings file, Postgres when `DATABASE_URL` is set, the reward
    /// journal and the persisted queue under the state directory.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        let registry =
            TargetRegistry::open(&config.targets_path, &config.registry_state_path()).await?;
        let settings = config.load_settings()?;
        let store: Arc<dyn OpportunityStore> = match &config.database_url {
            Some(url) => Arc::new(PgOpportunityStore::connect(url).await?),
            None => {
                info!("DATABASE_URL not set; opportunities are kept in memory");
                Arc::new(MemoryOpportunityStore::new())
            }
        };
        let ledger = RewardLedger::open(config.reward_journal_path())
            .await
            .context("opening reward journal")?;
        let sessions = HttpSessionFactory::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })
        .context("building http client")?;

        let engine = Self::new(EngineParts {
            registry,
            settings,
            weights: ScoringWeights::default(),
            store,
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            sessions: Arc::new(sessions),
            random: Arc::new(ThreadRandom),
            ledger,
            state_dir: Some(config.state_dir.clone()),
        })?;
        engine.prime_queue().await?;
        Ok(engine)
    }

    fn queue_state_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join("queue.json"))
    }

    /// Restores a persisted queue if one exists, then queues every active
    /// target not already queued. Returns the number of queued targets.
    pub async fn prime_queue(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let scheduler = &self.pipeline.scheduler;
        if let Some(path) = self.queue_state_path() {
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => {
                    let persisted: PersistedQueue = serde_json::from_str(&raw)
                        .map_err(|source| EngineError::StateDecode {
                            path: path.clone(),
                            source,
                        })?;
                    let restored = scheduler.restore(persisted, now).await;
                    info!(path = %path.display(), restored, "restored persisted queue");
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(EngineError::State { path, source }),
            }
        }
        for target in self.pipeline.registry.list_active().await {
            scheduler.enqueue(&target, now).await;
        }
        Ok(scheduler.depth().await)
    }

    /// Starts the worker pool. Idempotent: returns `false` when already
    /// running. The pool size is read from the settings at this moment.
    pub async fn start_crawl(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return false;
        }
        let workers = self.settings.current().max_concurrent_bots;
        let token = CancellationToken::new();
        let mut set = JoinSet::new();
        for n in 0..workers {
            set.spawn(worker_loop(
                format!("bot-{n}"),
                self.pipeline.clone(),
                self.settings.clone(),
                self.random.clone(),
                token.clone(),
            ));
        }
        info!(workers, queued = self.status.queue_depth(), "crawl started");
        *running = Some(RunningCrawl {
            token,
            workers: set,
        });
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Cancels the pool, waits for workers to release in-flight jobs, and
    /// snapshots the queue. Returns `false` when nothing was running.
    ///
    /// The lifecycle lock is held until the snapshot is written, so a
    /// concurrent `start_crawl` waits for the old pool to drain.
    pub async fn stop(&self) -> Result<bool, EngineError> {
        let mut running = self.running.lock().await;
        let Some(crawl) = running.as_mut() else {
            return Ok(false);
        };
        crawl.token.cancel();
        while let Some(joined) = crawl.workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task ended abnormally");
            }
        }
        *running = None;
        if let Some(path) = self.queue_state_path() {
            self.write_queue_snapshot(&path).await?;
        }
        info!(queued = self.status.queue_depth(), "crawl stopped");
        Ok(true)
    }

    async fn write_queue_snapshot(&self, path: &std::path::Path) -> Result<(), EngineError> {
        let persisted = self.pipeline.scheduler.persist().await;
        let json = serde_json::to_vec_pretty(&persisted).map_err(|source| EngineError::StateDecode {
            path: path.to_path_buf(),
            source,
        })?;
        let io_err = |source| EngineError::State {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        info!(path = %path.display(), entries = persisted.entries.len(), "queue snapshot written");
        Ok(())
    }

    pub fn settings(&self) -> Arc<CrawlSettings> {
        self.settings.current()
    }

    /// Validated atomic swap. Running workers pick the new values up on their
    /// next job; the pool size changes only on the next start.
    pub fn update_settings(&self, settings: CrawlSettings) -> Result<Arc<CrawlSettings>, SettingsError> {
        let next = self.settings.replace(settings)?;
        info!(
            threshold = next.screenshot_threshold,
            workers = next.max_concurrent_bots,
            stealth = next.stealth_mode,
            "settings reloaded"
        );
        Ok(next)
    }

    pub async fn targets(&self) -> Vec<CrawlTarget> {
        self.pipeline.registry.list().await
    }

    /// Registers a target and queues it immediately.
    pub async fn add_target(&self, target: CrawlTarget) -> Result<CrawlTarget, EngineError> {
        let added = self.pipeline.registry.add(target).await?;
        self.pipeline.scheduler.enqueue(&added, Utc::now()).await;
        info!(target_id = %added.target_id, priority = added.priority, "target added");
        Ok(added)
    }

    pub async fn deactivate_target(&self, target_id: &str) -> Result<CrawlTarget, EngineError> {
        let target = self.pipeline.registry.deactivate(target_id).await?;
        self.pipeline.scheduler.remove(target_id, Utc::now()).await;
        info!(target_id, "target deactivated");
        Ok(target)
    }

    pub async fn set_priority(&self, target_id: &str, priority: i32) -> Result<CrawlTarget, EngineError> {
        let target = self.pipeline.registry.set_priority(target_id, priority).await?;
        self.pipeline
            .scheduler
            .reprioritize(target_id, priority, Utc::now())
            .await;
        Ok(target)
    }

    /// Moves a queued target's next visit. Returns `false` when it is not queued.
    pub async fn reschedule_target(
        &self,
        target_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if self.pipeline.registry.get(target_id).await.is_none() {
            return Err(RegistryError::Unknown(target_id.to_string()).into());
        }
        Ok(self
            .pipeline
            .scheduler
            .reschedule(target_id, not_before, Utc::now())
            .await)
    }

    pub async fn review_queue(&self) -> Vec<String> {
        self.pipeline.scheduler.review_queue().await
    }

    pub async fn clear_review(&self, target_id: &str) -> bool {
        self.pipeline.scheduler.clear_review(target_id, Utc::now()).await
    }

    pub async fn target_history(&self, target_id: &str) -> Result<Vec<TargetRun>, EngineError> {
        if self.pipeline.registry.get(target_id).await.is_none() {
            return Err(RegistryError::Unknown(target_id.to_string()).into());
        }
        Ok(self.status.target_history(target_id))
    }

    pub async fn opportunities(&self, limit: usize) -> Result<Vec<OpportunityRecord>, EngineError> {
        Ok(self.store.list(limit).await?)
    }

    pub async fn verify(&self, fingerprint: &str, verified: bool) -> Result<(), EngineError> {
        self.store.set_verified(fingerprint, verified).await?;
        info!(fingerprint, verified, "opportunity verification changed");
        Ok(())
    }

    pub async fn reward_history(&self, limit: usize) -> Vec<RewardEntry> {
        self.status.reward_history(limit).await
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        self.pipeline.capturer.store()
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }
}

/// Pause between jobs; stealth mode applies a +/-20% jitter.
fn request_delay(settings: &CrawlSettings, random: &dyn RandomSource) -> Duration {
    let base = settings.request_delay();
    if !settings.stealth_mode || base.is_zero() {
        return base;
    }
    let percent = random.next_in(RangeSpec::new(80, 120));
    base.mul_f64(percent as f64 / 100.0)
}

async fn worker_loop(
    worker_id: String,
    pipeline: Arc<Pipeline>,
    settings: SettingsHandle,
    random: Arc<dyn RandomSource>,
    token: CancellationToken,
) {
    info!(worker_id = %worker_id, "worker started");
    while !token.is_cancelled() {
        let job = match pipeline.scheduler.dequeue(Utc::now()).await {
            Some(job) => job,
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
                continue;
            }
        };

        let current = settings.current();
        tokio::select! {
            outcome = pipeline.run(&job, &current, &worker_id) => {
                pipeline.scheduler.complete(job.job_id, outcome, Utc::now()).await;
            }
            _ = token.cancelled() => {
                if !pipeline.scheduler.release(job.job_id, Utc::now()).await {
                    warn!(worker_id = %worker_id, job_id = %job.job_id, "cancelled job could not be released");
                }
                break;
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(request_delay(&current, random.as_ref())) => {}
        }
    }
    info!(worker_id = %worker_id, "worker stopped");
}
