//! Human-like page interaction before content is read.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use fundscout_core::{CrawlSettings, PageContent, RangeSpec};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SimulationError;
use crate::session::PageSession;

/// Source of every random draw the crawler makes.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[range.min, range.max]`.
    fn next_in(&self, range: RangeSpec) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_in(&self, range: RangeSpec) -> u64 {
        if range.min >= range.max {
            return range.min;
        }
        rand::rng().random_range(range.min..=range.max)
    }
}

/// Replays a fixed sequence, clamping each value into the requested range.
#[derive(Debug)]
pub struct SequenceRandom {
    values: Vec<u64>,
    cursor: Mutex<usize>,
}

impl SequenceRandom {
    pub fn new(values: Vec<u64>) -> Self {
        Self {
            values,
            cursor: Mutex::new(0),
        }
    }
}

impl RandomSource for SequenceRandom {
    fn next_in(&self, range: RangeSpec) -> u64 {
        if self.values.is_empty() {
            return range.min;
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let value = self.values[*cursor % self.values.len()];
        *cursor += 1;
        value.clamp(range.min, range.max.max(range.min))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Scroll { dy: i64 },
    Pointer { x: u32, y: u32, steps: u32 },
    Dwell { ms: u64 },
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Scroll { .. } => "scroll",
            Action::Pointer { .. } => "pointer",
            Action::Dwell { .. } => "dwell",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub actions: Vec<Action>,
    pub errors: Vec<String>,
    pub settled: bool,
}

impl SimulationReport {
    pub fn degraded(&self) -> bool {
        !self.errors.is_empty() || !self.settled
    }
}

const VIEWPORT_WIDTH: u64 = 1366;
const VIEWPORT_HEIGHT: u64 = 768;

pub struct BehaviorSimulator {
    random: Arc<dyn RandomSource>,
}

impl BehaviorSimulator {
    pub fn new(random: Arc<dyn RandomSource>) -> Self {
        Self { random }
    }

    /// Draws the action plan for one visit. Empty when human behavior is off.
    pub fn plan(&self, settings: &CrawlSettings) -> Vec<Action> {
        if !settings.human_behavior {
            return Vec::new();
        }
        let ranges = &settings.behavior;
        let count = self.random.next_in(ranges.actions);
        (0..count)
            .map(|_| match self.random.next_in(RangeSpec::new(0, 2)) {
                0 => {
                    let px = self.random.next_in(ranges.scroll_px) as i64;
                    // one in four scrolls goes back up
                    let up = self.random.next_in(RangeSpec::new(0, 3)) == 0;
                    Action::Scroll {
                        dy: if up { -px } else { px },
                    }
                }
                1 => Action::Pointer {
                    x: self.random.next_in(RangeSpec::new(0, VIEWPORT_WIDTH)) as u32,
                    y: self.random.next_in(RangeSpec::new(0, VIEWPORT_HEIGHT)) as u32,
                    steps: self.random.next_in(ranges.pointer_steps) as u32,
                },
                _ => Action::Dwell {
                    ms: self.random.next_in(ranges.dwell_ms),
                },
            })
            .collect()
    }

    /// Plays the plan, waits for the page to settle and reads its content.
    /// Every failure is recorded in the report; an unreadable page yields
    /// empty content for the session's URL.
    pub async fn run(
        &self,
        session: &mut dyn PageSession,
        settings: &CrawlSettings,
    ) -> (PageContent, SimulationReport) {
        let mut report = SimulationReport::default();

        for action in self.plan(settings) {
            let result = match action {
                Action::Scroll { dy } => session.scroll_by(dy).await,
                Action::Pointer { x, y, steps } => session.move_pointer(x, y, steps).await,
                Action::Dwell { ms } => session.dwell(Duration::from_millis(ms)).await,
            };
            match result {
                Ok(()) => report.actions.push(action),
                Err(err) => {
                    warn!(url = session.url(), action = action.name(), error = %err, "page action failed");
                    report.errors.push(err.to_string());
                }
            }
        }

        let stable_timeout = settings.stable_timeout();
        match tokio::time::timeout(stable_timeout, session.wait_for_quiet(settings.quiet_window())).await {
            Ok(Ok(())) => report.settled = true,
            Ok(Err(err)) => {
                warn!(url = session.url(), error = %err, "page did not settle");
                report.errors.push(err.to_string());
            }
            Err(_) => {
                let err = SimulationError::StableTimeout(stable_timeout);
                warn!(url = session.url(), error = %err, "page did not settle");
                report.errors.push(err.to_string());
            }
        }

        let content = match session.content().await {
            Ok(content) => content,
            Err(err) => {
                warn!(url = session.url(), error = %err, "page content unreadable; continuing with empty content");
                report.errors.push(err.to_string());
                PageContent::html(session.url(), "", Utc::now())
            }
        };
        debug!(
            url = session.url(),
            actions = report.actions.len(),
            degraded = report.degraded(),
            "simulation finished"
        );
        (content, report)
    }
}
