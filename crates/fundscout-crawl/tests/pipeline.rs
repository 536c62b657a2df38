use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fundscout_core::{CrawlSettings, CrawlTarget, PageContent, UpsertOutcome};
use fundscout_crawl::{
    DiscoveryEngine, EngineParts, HttpPageSession, PageSession, RewardLedger, SessionFactory,
    TargetRegistry, ThreadRandom,
};
use fundscout_extract::ScoringWeights;
use fundscout_storage::{ArtifactStore, FetchError, MemoryOpportunityStore};

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/pages")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

/// Serves fixture pages by URL; anything else is a 404.
struct FixtureSessions {
    pages: HashMap<String, String>,
}

impl FixtureSessions {
    fn new(pages: &[(&str, &str)]) -> Self {
        Self {
            pages: pages
                .iter()
                .map(|(url, file)| (url.to_string(), fixture(file)))
                .collect(),
        }
    }
}

#[async_trait]
impl SessionFactory for FixtureSessions {
    async fn open(
        &self,
        target: &CrawlTarget,
        _settings: &CrawlSettings,
    ) -> Result<Box<dyn PageSession>, FetchError> {
        match self.pages.get(&target.url) {
            Some(body) => Ok(Box::new(HttpPageSession::new(PageContent::html(
                target.url.clone(),
                body.clone(),
                Utc::now(),
            )))),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: target.url.clone(),
            }),
        }
    }
}

fn water_target(id: &str, url: &str, name: &str, priority: i32) -> CrawlTarget {
    let mut target = CrawlTarget::new(id, url, name);
    target.sectors = vec!["water".into()];
    target.country = Some("KE".into());
    target.priority = priority;
    target
}

fn fast_settings() -> CrawlSettings {
    CrawlSettings {
        human_behavior: false,
        max_concurrent_bots: 2,
        delay_between_requests: 0,
        ..CrawlSettings::default()
    }
}

fn engine(
    registry: TargetRegistry,
    sessions: FixtureSessions,
    settings: CrawlSettings,
    dir: &Path,
    state_dir: Option<PathBuf>,
) -> DiscoveryEngine {
    DiscoveryEngine::new(EngineParts {
        registry,
        settings,
        weights: ScoringWeights::default(),
        store: Arc::new(MemoryOpportunityStore::new()),
        artifacts: ArtifactStore::new(dir.join("artifacts")),
        sessions: Arc::new(sessions),
        random: Arc::new(ThreadRandom),
        ledger: RewardLedger::in_memory(),
        state_dir,
    })
    .unwrap()
}

fn registry(targets: Vec<CrawlTarget>) -> TargetRegistry {
    TargetRegistry::from_targets(targets).unwrap()
}

async fn wait_until(engine: &DiscoveryEngine, done: impl Fn(&fundscout_crawl::QueueStatus) -> bool) {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if done(&engine.status().queue_status()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("engine did not reach the expected state in time");
}

const WATER_URL: &str = "https://funds.example.org/grants/water-access";
const MIRROR_URL: &str = "https://mirror.example.net/water";
const NEWS_URL: &str = "https://funds.example.org/news/annual-report";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crawl_persists_once_rewards_and_skips_low_scores() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = FixtureSessions::new(&[
        (WATER_URL, "water-access-grant.html"),
        (MIRROR_URL, "water-access-grant.html"),
        (NEWS_URL, "annual-report.html"),
    ]);
    let targets = vec![
        water_target("example-fund", WATER_URL, "Example Fund", 10),
        water_target("mirror", MIRROR_URL, "Mirror Listing", 5),
        water_target("news", NEWS_URL, "Example Fund News", 1),
    ];
    let engine = engine(registry(targets), sessions, fast_settings(), dir.path(), None);
    assert_eq!(engine.prime_queue().await.unwrap(), 3);

    assert!(engine.start_crawl().await);
    assert!(!engine.start_crawl().await);
    wait_until(&engine, |s| s.succeeded >= 3).await;
    assert!(engine.stop().await.unwrap());
    assert!(!engine.is_running().await);

    // Both listings carry the same canonical page: one record, never two.
    let records = engine.opportunities(10).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.title, "Water Access Grant 2027");
    assert_eq!(record.source_url, WATER_URL);
    assert_eq!(record.currency.as_deref(), Some("USD"));
    assert_eq!(record.amount_min, Some(50_000.0));
    assert_eq!(record.amount_max, Some(250_000.0));
    assert_eq!(record.deadline.map(|d| d.to_string()).as_deref(), Some("2027-06-30"));
    assert!(!record.verified);
    let evidence = record.evidence.as_ref().expect("evidence attached");
    let bytes = engine.artifacts().read(&evidence.relative_path).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("Water Access Grant 2027"));

    let rewards = engine.reward_history(10).await;
    let mut outcomes = rewards.iter().map(|r| r.outcome).collect::<Vec<_>>();
    outcomes.sort_by_key(|o| *o != UpsertOutcome::Created);
    assert_eq!(outcomes, vec![UpsertOutcome::Created, UpsertOutcome::Updated]);
    assert!(rewards.iter().all(|r| r.points > 0));
    assert!(rewards.iter().all(|r| r.target_id != "news"));

    let stats = engine.status().aggregate_stats().await;
    assert_eq!(stats.jobs["succeeded"], 3);
    assert_eq!(stats.pages_evaluated, 3);
    assert_eq!(stats.opportunities_created, 1);
    assert_eq!(stats.opportunities_updated, 1);
    assert_eq!(stats.evidence_captured, 2);
    assert_eq!(stats.opportunities_stored, Some(1));
    assert_eq!(stats.reward_entries, 2);

    let news = engine.target_history("news").await.unwrap();
    assert_eq!(news[0].summary.as_ref().and_then(|s| s.persist), None);
    assert!(news[0].summary.as_ref().and_then(|s| s.score).unwrap() < 70);

    engine.verify(&record.fingerprint, true).await.unwrap();
    assert!(engine.opportunities(1).await.unwrap()[0].verified);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_target_is_retried_then_sent_to_review() {
    let dir = tempfile::tempdir().unwrap();
    let settings = CrawlSettings {
        max_retries: 1,
        backoff_base_ms: 10,
        backoff_max_ms: 20,
        ..fast_settings()
    };
    let targets = vec![water_target("gone", "https://gone.example.org/grants", "Gone", 5)];
    let engine = engine(registry(targets), FixtureSessions::new(&[]), settings, dir.path(), None);
    engine.prime_queue().await.unwrap();

    engine.start_crawl().await;
    wait_until(&engine, |s| s.abandoned == 1).await;
    engine.stop().await.unwrap();

    let status = engine.status().queue_status();
    assert_eq!(status.failed, 2);
    assert_eq!(status.review, vec!["gone".to_string()]);
    assert_eq!(engine.review_queue().await, vec!["gone".to_string()]);
    let history = engine.target_history("gone").await.unwrap();
    assert!(history[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("404")));
    assert!(engine.reward_history(10).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovered_links_become_queued_child_targets() {
    let dir = tempfile::tempdir().unwrap();
    let settings = CrawlSettings {
        follow_links: true,
        max_retries: 0,
        ..fast_settings()
    };
    let targets = vec![water_target("example-fund", WATER_URL, "Example Fund", 10)];
    let sessions = FixtureSessions::new(&[(WATER_URL, "water-access-grant.html")]);
    let engine = engine(registry(targets), sessions, settings, dir.path(), None);
    engine.prime_queue().await.unwrap();

    engine.start_crawl().await;
    wait_until(&engine, |s| s.succeeded >= 1 && s.abandoned >= 1).await;
    engine.stop().await.unwrap();

    let children = engine
        .targets()
        .await
        .into_iter()
        .filter(|t| t.parent_id.as_deref() == Some("example-fund"))
        .collect::<Vec<_>>();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].url, "https://funds.example.org/grants/sanitation-2027");
    assert_eq!(children[0].priority, 9);
    assert_eq!(children[0].sectors, vec!["water".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_snapshots_queue_for_the_next_process() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let targets = || {
        vec![
            water_target("example-fund", WATER_URL, "Example Fund", 10),
            water_target("news", NEWS_URL, "Example Fund News", 1),
        ]
    };
    let pages = [
        (WATER_URL, "water-access-grant.html"),
        (NEWS_URL, "annual-report.html"),
    ];

    let first = engine(
        registry(targets()),
        FixtureSessions::new(&pages),
        fast_settings(),
        dir.path(),
        Some(state_dir.clone()),
    );
    first.prime_queue().await.unwrap();
    first.start_crawl().await;
    wait_until(&first, |s| s.succeeded >= 2).await;
    first.stop().await.unwrap();
    assert!(state_dir.join("queue.json").exists());

    let second = engine(
        registry(targets()),
        FixtureSessions::new(&pages),
        fast_settings(),
        dir.path(),
        Some(state_dir),
    );
    assert_eq!(second.prime_queue().await.unwrap(), 2);
    // Restored entries keep their rate-limited visit times.
    let now = Utc::now();
    let status = second.status().queue_status();
    assert!(status
        .targets
        .iter()
        .all(|t| t.next_visit_at.is_some_and(|at| at > now)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registry_changes_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let seed = dir.path().join("targets.yaml");
    let state = dir.path().join("state/targets.yaml");
    std::fs::write(
        &seed,
        format!(
            "targets:\n  - target_id: example-fund\n    url: {WATER_URL}\n    display_name: Example Fund\n  - target_id: news\n    url: {NEWS_URL}\n    display_name: Example Fund News\n"
        ),
    )
    .unwrap();

    let first = engine(
        TargetRegistry::open(&seed, &state).await.unwrap(),
        FixtureSessions::new(&[]),
        fast_settings(),
        dir.path(),
        None,
    );
    first
        .add_target(water_target("mirror", MIRROR_URL, "Mirror Listing", 5))
        .await
        .unwrap();
    first.deactivate_target("news").await.unwrap();

    let second = engine(
        TargetRegistry::open(&seed, &state).await.unwrap(),
        FixtureSessions::new(&[]),
        fast_settings(),
        dir.path(),
        None,
    );
    let targets = second.targets().await;
    assert_eq!(targets.len(), 3);
    let mirror = targets.iter().find(|t| t.target_id == "mirror").unwrap();
    assert_eq!(mirror.priority, 5);
    assert!(!targets.iter().find(|t| t.target_id == "news").unwrap().active);
    assert_eq!(second.prime_queue().await.unwrap(), 2);
}
