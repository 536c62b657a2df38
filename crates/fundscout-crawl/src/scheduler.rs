//! Priority crawl queue with rate limits, retries with backoff and an
//! operator review list.
//!
//! Entries wait in a min-heap keyed by eligibility time. `dequeue` promotes
//! every entry that has become eligible into a max-heap ordered by priority,
//! then earliest eligibility, then insertion order. A target handed to a
//! worker stays in the in-flight map until `complete` or `release`; while it
//! is there it cannot be queued again.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fundscout_core::{CrawlTarget, JobOutcome, JobState, UpsertOutcome, VisitJob, VisitSummary};
use fundscout_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SettingsHandle;
use crate::registry::TargetRegistry;

pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEntry {
    pub target_id: String,
    pub priority: i32,
    pub not_before: DateTime<Utc>,
    /// Carried over from a failed attempt; `None` starts a fresh job.
    #[serde(default)]
    pub job: Option<VisitJob>,
}

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    entry: QueuedEntry,
}

/// Ordering for the waiting heap: earliest `not_before` first.
struct Waiting(Slot);

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Waiting {}
impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Waiting {
    fn cmp(&self, other: &Self) -> Ordering {
        Reverse((self.0.entry.not_before, self.0.seq)).cmp(&Reverse((other.0.entry.not_before, other.0.seq)))
    }
}

/// Ordering for the ready heap: highest priority, then earliest eligibility,
/// then FIFO.
struct Ready(Slot);

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Ready {}
impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .entry
            .priority
            .cmp(&other.0.entry.priority)
            .then_with(|| other.0.entry.not_before.cmp(&self.0.entry.not_before))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// One finished attempt, as kept in per-target history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRun {
    pub job_id: Uuid,
    pub attempt: u32,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub summary: Option<VisitSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub abandoned: u64,
}

/// Cumulative visit results used for aggregate statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitTotals {
    pub evaluated: u64,
    pub score_sum: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub evidence_captured: u64,
    pub points: u64,
    pub degraded: u64,
    pub discovered_targets: u64,
}

/// Immutable view published after every queue mutation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub generated_at: Option<DateTime<Utc>>,
    pub counts: StateCounts,
    pub totals: VisitTotals,
    pub queued: Vec<QueuedEntry>,
    pub in_flight: Vec<VisitJob>,
    pub review: Vec<String>,
    pub history: BTreeMap<String, VecDeque<TargetRun>>,
}

impl QueueSnapshot {
    pub fn depth(&self) -> usize {
        self.counts.pending
    }
}

/// Serializable queue contents for stop/restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedQueue {
    pub entries: Vec<QueuedEntry>,
    #[serde(default)]
    pub review: Vec<String>,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    waiting: BinaryHeap<Waiting>,
    ready: BinaryHeap<Ready>,
    queued: HashSet<String>,
    in_flight: HashMap<String, VisitJob>,
    review: Vec<String>,
    history: BTreeMap<String, VecDeque<TargetRun>>,
    counts: StateCounts,
    totals: VisitTotals,
}

impl QueueState {
    fn push(&mut self, entry: QueuedEntry) {
        self.queued.insert(entry.target_id.clone());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting.push(Waiting(Slot { seq, entry }));
    }

    fn promote(&mut self, now: DateTime<Utc>) {
        while self
            .waiting
            .peek()
            .is_some_and(|w| w.0.entry.not_before <= now)
        {
            if let Some(Waiting(slot)) = self.waiting.pop() {
                self.ready.push(Ready(slot));
            }
        }
    }

    fn entries(&self) -> Vec<QueuedEntry> {
        let mut slots = self
            .ready
            .iter()
            .map(|r| &r.0)
            .chain(self.waiting.iter().map(|w| &w.0))
            .collect::<Vec<_>>();
        slots.sort_by(|a, b| {
            b.entry
                .priority
                .cmp(&a.entry.priority)
                .then_with(|| a.entry.not_before.cmp(&b.entry.not_before))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        slots.into_iter().map(|s| s.entry.clone()).collect()
    }

    /// Rebuilds both heaps keeping only entries accepted by `keep`.
    fn retain(&mut self, mut keep: impl FnMut(&mut QueuedEntry) -> bool) {
        let mut slots = std::mem::take(&mut self.ready)
            .into_iter()
            .map(|r| r.0)
            .chain(std::mem::take(&mut self.waiting).into_iter().map(|w| w.0))
            .collect::<Vec<_>>();
        slots.retain_mut(|slot| keep(&mut slot.entry));
        self.queued = slots.iter().map(|s| s.entry.target_id.clone()).collect();
        self.waiting = slots.into_iter().map(Waiting).collect();
    }

    fn record(&mut self, job: &VisitJob, summary: Option<VisitSummary>) {
        let runs = self.history.entry(job.target_id.clone()).or_default();
        runs.push_back(TargetRun {
            job_id: job.job_id,
            attempt: job.attempt,
            state: job.state,
            started_at: job.started_at,
            finished_at: job.finished_at,
            error: job.last_error.clone(),
            summary,
        });
        while runs.len() > HISTORY_LIMIT {
            runs.pop_front();
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> QueueSnapshot {
        let mut counts = self.counts;
        counts.pending = self.queued.len();
        counts.running = self.in_flight.len();
        let mut in_flight = self.in_flight.values().cloned().collect::<Vec<_>>();
        in_flight.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        QueueSnapshot {
            generated_at: Some(now),
            counts,
            totals: self.totals,
            queued: self.entries(),
            in_flight,
            review: self.review.clone(),
            history: self.history.clone(),
        }
    }
}

pub struct Scheduler {
    registry: Arc<TargetRegistry>,
    settings: SettingsHandle,
    state: Mutex<QueueState>,
    snapshots: watch::Sender<Arc<QueueSnapshot>>,
}

impl Scheduler {
    pub fn new(registry: Arc<TargetRegistry>, settings: SettingsHandle) -> Self {
        let (snapshots, _rx) = watch::channel(Arc::new(QueueSnapshot::default()));
        Self {
            registry,
            settings,
            state: Mutex::new(QueueState::default()),
            snapshots,
        }
    }

    /// Snapshot feed for readers that must not contend with workers.
    pub fn subscribe(&self) -> watch::Receiver<Arc<QueueSnapshot>> {
        self.snapshots.subscribe()
    }

    fn publish(&self, state: &QueueState, now: DateTime<Utc>) {
        self.snapshots.send_replace(Arc::new(state.snapshot(now)));
    }

    fn backoff(&self) -> (BackoffPolicy, u32) {
        let settings = self.settings.current();
        let policy = BackoffPolicy {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.backoff_base_ms),
            max_delay: Duration::from_millis(settings.backoff_max_ms),
        };
        (policy, settings.max_retries)
    }

    /// Queues an active target at its next eligible time. Returns `false` when
    /// the target is inactive, already queued, in flight, or under review.
    pub async fn enqueue(&self, target: &CrawlTarget, now: DateTime<Utc>) -> bool {
        if !target.active {
            return false;
        }
        let mut state = self.state.lock().await;
        let id = &target.target_id;
        if state.queued.contains(id) || state.in_flight.contains_key(id) || state.review.contains(id) {
            return false;
        }
        state.push(QueuedEntry {
            target_id: id.clone(),
            priority: target.priority,
            not_before: target.next_eligible_at().unwrap_or(now),
            job: None,
        });
        self.publish(&state, now);
        true
    }

    /// Hands out the best eligible target as a running job. Entries for
    /// targets that have since been deactivated or removed are dropped.
    pub async fn dequeue(&self, now: DateTime<Utc>) -> Option<VisitJob> {
        let mut state = self.state.lock().await;
        state.promote(now);
        while let Some(Ready(slot)) = state.ready.pop() {
            let entry = slot.entry;
            state.queued.remove(&entry.target_id);
            match self.registry.get(&entry.target_id).await {
                Some(target) if target.active => {}
                Some(_) => {
                    info!(target_id = %entry.target_id, "dropping queued visit for inactive target");
                    continue;
                }
                None => {
                    warn!(target_id = %entry.target_id, "dropping queued visit for unregistered target");
                    continue;
                }
            }
            let mut job = entry
                .job
                .unwrap_or_else(|| VisitJob::new(entry.target_id.clone(), now));
            if let Err(err) = job.transition(JobState::Running, now) {
                error!(error = %err, "queued job was not pending; discarding");
                continue;
            }
            job.attempt += 1;
            state.in_flight.insert(job.target_id.clone(), job.clone());
            self.publish(&state, now);
            return Some(job);
        }
        self.publish(&state, now);
        None
    }

    /// Moves an entry's eligibility time. Used by operators to defer or
    /// expedite a queued target.
    pub async fn reschedule(&self, target_id: &str, not_before: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        let mut found = false;
        state.retain(|entry| {
            if entry.target_id == target_id {
                entry.not_before = not_before;
                found = true;
            }
            true
        });
        self.publish(&state, now);
        found
    }

    /// Applies a new priority to a queued target.
    pub async fn reprioritize(&self, target_id: &str, priority: i32, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.retain(|entry| {
            if entry.target_id == target_id {
                entry.priority = priority;
            }
            true
        });
        self.publish(&state, now);
    }

    /// Drops any queued entry for the target.
    pub async fn remove(&self, target_id: &str, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.retain(|entry| entry.target_id != target_id);
        self.publish(&state, now);
    }

    /// Worker completion report. Successes are re-queued after the rate limit;
    /// failures back off until the retry cap, then go to operator review.
    pub async fn complete(&self, job_id: Uuid, outcome: JobOutcome, now: DateTime<Utc>) -> Option<VisitJob> {
        let mut state = self.state.lock().await;
        let target_id = state
            .in_flight
            .iter()
            .find(|(_, j)| j.job_id == job_id)
            .map(|(t, _)| t.clone());
        let Some(mut job) = target_id.and_then(|t| state.in_flight.remove(&t)) else {
            warn!(%job_id, "completion for unknown job ignored");
            return None;
        };

        if let Err(err) = job.transition(outcome.state(), now) {
            error!(error = %err, "rejecting completion");
            state.in_flight.insert(job.target_id.clone(), job);
            return None;
        }
        job.last_error = outcome.error().map(str::to_string);

        match &outcome {
            JobOutcome::Succeeded(summary) => {
                state.counts.succeeded += 1;
                let totals = &mut state.totals;
                if let Some(score) = summary.score {
                    totals.evaluated += 1;
                    totals.score_sum += u64::from(score);
                }
                match summary.persist {
                    Some(UpsertOutcome::Created) => totals.created += 1,
                    Some(UpsertOutcome::Updated) => totals.updated += 1,
                    Some(UpsertOutcome::Unchanged) => totals.unchanged += 1,
                    None => {}
                }
                totals.evidence_captured += u64::from(summary.evidence_captured);
                totals.points += u64::from(summary.points);
                totals.degraded += u64::from(summary.degraded);
                totals.discovered_targets += summary.discovered_targets as u64;
                state.record(&job, Some(summary.clone()));

                match self.registry.mark_visited(&job.target_id, now).await {
                    Ok(target) if target.active => {
                        let not_before = now
                            .checked_add_signed(target.rate_limit())
                            .unwrap_or(now);
                        state.push(QueuedEntry {
                            target_id: target.target_id.clone(),
                            priority: target.priority,
                            not_before,
                            job: None,
                        });
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "could not record visit"),
                }
            }
            JobOutcome::Failed { .. } | JobOutcome::TimedOut { .. } => {
                if matches!(outcome, JobOutcome::TimedOut { .. }) {
                    state.counts.timed_out += 1;
                } else {
                    state.counts.failed += 1;
                }
                state.record(&job, None);

                let (policy, max_retries) = self.backoff();
                if job.attempt > max_retries {
                    if let Err(err) = job.transition(JobState::Abandoned, now) {
                        error!(error = %err, "could not abandon job");
                    }
                    state.counts.abandoned += 1;
                    state.record(&job, None);
                    state.review.push(job.target_id.clone());
                    error!(
                        target_id = %job.target_id,
                        attempts = job.attempt,
                        last_error = job.last_error.as_deref().unwrap_or(""),
                        "job abandoned; target needs operator review"
                    );
                } else if let Err(err) = job.transition(JobState::Pending, now) {
                    error!(error = %err, "could not requeue job");
                } else {
                    let delay = policy.delay_for_attempt(job.attempt.saturating_sub(1));
                    let not_before = TimeDelta::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(now);
                    let priority = self
                        .registry
                        .get(&job.target_id)
                        .await
                        .map_or(0, |t| t.priority);
                    warn!(
                        target_id = %job.target_id,
                        attempt = job.attempt,
                        retry_at = %not_before,
                        "job failed; retrying with backoff"
                    );
                    state.push(QueuedEntry {
                        target_id: job.target_id.clone(),
                        priority,
                        not_before,
                        job: Some(job.clone()),
                    });
                }
            }
        }
        self.publish(&state, now);
        Some(job)
    }

    /// Returns a cancelled in-flight job to the queue without consuming an
    /// attempt.
    pub async fn release(&self, job_id: Uuid, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        let target_id = state
            .in_flight
            .iter()
            .find(|(_, j)| j.job_id == job_id)
            .map(|(t, _)| t.clone());
        let Some(mut job) = target_id.and_then(|t| state.in_flight.remove(&t)) else {
            return false;
        };
        if let Err(err) = job.transition(JobState::Pending, now) {
            error!(error = %err, "could not release job");
            return false;
        }
        job.attempt = job.attempt.saturating_sub(1);
        job.started_at = None;
        let priority = self
            .registry
            .get(&job.target_id)
            .await
            .map_or(0, |t| t.priority);
        info!(target_id = %job.target_id, "released in-flight job back to queue");
        state.push(QueuedEntry {
            target_id: job.target_id.clone(),
            priority,
            not_before: now,
            job: Some(job),
        });
        self.publish(&state, now);
        true
    }

    /// Targets whose jobs were abandoned.
    pub async fn review_queue(&self) -> Vec<String> {
        self.state.lock().await.review.clone()
    }

    /// Takes a target off the review list and queues it for a fresh attempt.
    pub async fn clear_review(&self, target_id: &str, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        let before = state.review.len();
        state.review.retain(|t| t != target_id);
        if state.review.len() == before {
            return false;
        }
        if let Some(target) = self.registry.get(target_id).await.filter(|t| t.active) {
            state.push(QueuedEntry {
                target_id: target.target_id.clone(),
                priority: target.priority,
                not_before: now,
                job: None,
            });
        }
        self.publish(&state, now);
        true
    }

    pub async fn depth(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    /// Queue contents for persistence. In-flight jobs are not included; stop
    /// releases them first.
    pub async fn persist(&self) -> PersistedQueue {
        let state = self.state.lock().await;
        PersistedQueue {
            entries: state.entries(),
            review: state.review.clone(),
        }
    }

    /// Loads persisted entries, skipping targets already queued or in flight.
    pub async fn restore(&self, persisted: PersistedQueue, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().await;
        let mut restored = 0;
        for mut entry in persisted.entries {
            if state.queued.contains(&entry.target_id)
                || state.in_flight.contains_key(&entry.target_id)
            {
                continue;
            }
            if let Some(job) = entry.job.as_mut() {
                if job.state != JobState::Pending {
                    entry.job = None;
                }
            }
            state.push(entry);
            restored += 1;
        }
        for target_id in persisted.review {
            if !state.review.contains(&target_id) {
                state.review.push(target_id);
            }
        }
        self.publish(&state, now);
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fundscout_core::CrawlSettings;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn target(id: &str, priority: i32) -> CrawlTarget {
        let mut t = CrawlTarget::new(id, format!("https://{id}.example.org"), id);
        t.priority = priority;
        t
    }

    fn scheduler(targets: Vec<CrawlTarget>, settings: CrawlSettings) -> Scheduler {
        Scheduler::new(
            Arc::new(TargetRegistry::from_targets(targets).unwrap()),
            SettingsHandle::new(settings).unwrap(),
        )
    }

    fn failed() -> JobOutcome {
        JobOutcome::Failed {
            reason: "fetch failed".into(),
        }
    }

    #[tokio::test]
    async fn higher_priority_wins_when_both_eligible() {
        let mut high = target("high", 10);
        high.rate_limit_secs = 600;
        high.last_visited = Some(t0() - TimeDelta::seconds(1200));
        let low = target("low", 3);
        let s = scheduler(vec![high.clone(), low.clone()], CrawlSettings::default());

        s.enqueue(&low, t0()).await;
        s.enqueue(&high, t0()).await;
        assert_eq!(s.dequeue(t0()).await.unwrap().target_id, "high");
        assert_eq!(s.dequeue(t0()).await.unwrap().target_id, "low");
        assert!(s.dequeue(t0()).await.is_none());
    }

    #[tokio::test]
    async fn rate_limited_target_waits_and_ties_are_fifo() {
        let mut recent = target("recent", 9);
        recent.rate_limit_secs = 600;
        recent.last_visited = Some(t0());
        let a = target("a", 5);
        let b = target("b", 5);
        let s = scheduler(vec![recent.clone(), a.clone(), b.clone()], CrawlSettings::default());

        for t in [&recent, &a, &b] {
            assert!(s.enqueue(t, t0()).await);
        }
        assert_eq!(s.dequeue(t0()).await.unwrap().target_id, "a");
        assert_eq!(s.dequeue(t0()).await.unwrap().target_id, "b");
        assert!(s.dequeue(t0()).await.is_none());
        let later = t0() + TimeDelta::seconds(600);
        assert_eq!(s.dequeue(later).await.unwrap().target_id, "recent");
    }

    #[tokio::test]
    async fn in_flight_target_is_never_handed_out_twice() {
        let a = target("a", 5);
        let s = scheduler(vec![a.clone()], CrawlSettings::default());
        s.enqueue(&a, t0()).await;
        let job = s.dequeue(t0()).await.unwrap();
        assert!(!s.enqueue(&a, t0()).await);
        assert!(s.dequeue(t0()).await.is_none());

        let summary = VisitSummary {
            score: Some(40),
            ..VisitSummary::default()
        };
        let done = s.complete(job.job_id, JobOutcome::Succeeded(summary), t0()).await.unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        // re-queued behind the rate limit
        assert!(s.dequeue(t0()).await.is_none());
        assert!(s.dequeue(t0() + TimeDelta::seconds(3600)).await.is_some());
    }

    #[tokio::test]
    async fn failure_backs_off_then_abandons_at_retry_cap() {
        let a = target("a", 5);
        let settings = CrawlSettings {
            max_retries: 1,
            backoff_base_ms: 30_000,
            ..CrawlSettings::default()
        };
        let s = scheduler(vec![a.clone()], settings);
        s.enqueue(&a, t0()).await;

        let first = s.dequeue(t0()).await.unwrap();
        assert_eq!(first.attempt, 1);
        let after = s.complete(first.job_id, failed(), t0()).await.unwrap();
        assert_eq!(after.state, JobState::Pending);
        assert!(s.dequeue(t0() + TimeDelta::seconds(29)).await.is_none());

        let retry_at = t0() + TimeDelta::seconds(30);
        let second = s.dequeue(retry_at).await.unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.attempt, 2);
        let end = s.complete(second.job_id, failed(), retry_at).await.unwrap();
        assert_eq!(end.state, JobState::Abandoned);
        assert_eq!(s.review_queue().await, vec!["a".to_string()]);
        assert!(s.dequeue(retry_at + TimeDelta::days(1)).await.is_none());
        assert!(!s.enqueue(&a, retry_at).await);

        let snap = s.subscribe().borrow().clone();
        assert_eq!(snap.counts.failed, 2);
        assert_eq!(snap.counts.abandoned, 1);
        let states = snap.history["a"].iter().map(|r| r.state).collect::<Vec<_>>();
        assert_eq!(states, vec![JobState::Failed, JobState::Failed, JobState::Abandoned]);

        assert!(s.clear_review("a", retry_at).await);
        let fresh = s.dequeue(retry_at).await.unwrap();
        assert_ne!(fresh.job_id, first.job_id);
        assert_eq!(fresh.attempt, 1);
    }

    #[tokio::test]
    async fn release_returns_job_without_consuming_attempt() {
        let a = target("a", 5);
        let s = scheduler(vec![a.clone()], CrawlSettings::default());
        s.enqueue(&a, t0()).await;
        let job = s.dequeue(t0()).await.unwrap();
        assert!(s.release(job.job_id, t0()).await);
        let again = s.dequeue(t0()).await.unwrap();
        assert_eq!(again.job_id, job.job_id);
        assert_eq!(again.attempt, 1);
    }

    #[tokio::test]
    async fn reschedule_defers_a_queued_target() {
        let s = scheduler(vec![target("a", 5), target("b", 1)], CrawlSettings::default());
        s.enqueue(&target("a", 5), t0()).await;
        s.enqueue(&target("b", 1), t0()).await;

        assert!(s.reschedule("a", t0() + TimeDelta::minutes(10), t0()).await);
        assert!(!s.reschedule("missing", t0(), t0()).await);
        assert_eq!(s.dequeue(t0()).await.unwrap().target_id, "b");
        assert!(s.dequeue(t0()).await.is_none());
        assert_eq!(
            s.dequeue(t0() + TimeDelta::minutes(10)).await.unwrap().target_id,
            "a"
        );
    }

    #[tokio::test]
    async fn deactivated_targets_are_dropped_at_dequeue() {
        let a = target("a", 5);
        let registry = Arc::new(TargetRegistry::from_targets(vec![a.clone()]).unwrap());
        let s = Scheduler::new(registry.clone(), SettingsHandle::new(CrawlSettings::default()).unwrap());
        s.enqueue(&a, t0()).await;
        registry.deactivate("a").await.unwrap();
        assert!(s.dequeue(t0()).await.is_none());
        assert_eq!(s.depth().await, 0);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let a = target("a", 5);
        let s = scheduler(vec![a.clone()], CrawlSettings::default());
        s.enqueue(&a, t0()).await;
        let mut now = t0();
        for _ in 0..(HISTORY_LIMIT + 5) {
            let job = s.dequeue(now).await.unwrap();
            s.complete(job.job_id, JobOutcome::Succeeded(VisitSummary::default()), now)
                .await
                .unwrap();
            now += TimeDelta::seconds(3600);
        }
        assert_eq!(s.subscribe().borrow().history["a"].len(), HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn persisted_queue_restores_order_and_review() {
        let a = target("a", 5);
        let b = target("b", 8);
        let s = scheduler(vec![a.clone(), b.clone()], CrawlSettings::default());
        s.enqueue(&a, t0()).await;
        s.enqueue(&b, t0()).await;
        let persisted = PersistedQueue {
            review: vec!["c".into()],
            ..s.persist().await
        };
        let json = serde_json::to_string(&persisted).unwrap();

        let restored = scheduler(vec![a, b], CrawlSettings::default());
        let n = restored
            .restore(serde_json::from_str(&json).unwrap(), t0())
            .await;
        assert_eq!(n, 2);
        assert_eq!(restored.review_queue().await, vec!["c".to_string()]);
        assert_eq!(restored.dequeue(t0()).await.unwrap().target_id, "b");
    }
}
