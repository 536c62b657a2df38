//! Page sessions: the surface the behavior simulator and evidence capturer
//! drive. The bundled implementation is a plain HTTP fetch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fundscout_core::{CrawlSettings, CrawlTarget, PageContent};
use fundscout_storage::{FetchError, FetchOptions, HttpClientConfig, HttpFetcher};

use crate::error::{CaptureError, SimulationError};

/// Raw bytes of a captured evidence artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait PageSession: Send {
    fn url(&self) -> &str;
    async fn scroll_by(&mut self, dy: i64) -> Result<(), SimulationError>;
    async fn move_pointer(&mut self, x: u32, y: u32, steps: u32) -> Result<(), SimulationError>;
    async fn dwell(&mut self, duration: Duration) -> Result<(), SimulationError>;
    /// Resolves once the page has had no network activity for `quiet`.
    async fn wait_for_quiet(&mut self, quiet: Duration) -> Result<(), SimulationError>;
    async fn content(&mut self) -> Result<PageContent, SimulationError>;
    async fn capture(&mut self) -> Result<Capture, CaptureError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Opens a session on the target's URL. This is the network fetch step.
    async fn open(
        &self,
        target: &CrawlTarget,
        settings: &CrawlSettings,
    ) -> Result<Box<dyn PageSession>, FetchError>;
}

const DESKTOP_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

pub struct HttpSessionFactory {
    fetcher: HttpFetcher,
    next_agent: AtomicUsize,
}

impl HttpSessionFactory {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        Ok(Self {
            fetcher: HttpFetcher::new(config)?,
            next_agent: AtomicUsize::new(0),
        })
    }

    /// Browser-like request headers with a rotating user agent.
    fn stealth_headers(&self) -> Vec<(String, String)> {
        let idx = self.next_agent.fetch_add(1, Ordering::Relaxed) % DESKTOP_USER_AGENTS.len();
        vec![
            ("User-Agent".to_string(), DESKTOP_USER_AGENTS[idx].to_string()),
            (
                "Accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            ),
            ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
            ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
        ]
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(
        &self,
        target: &CrawlTarget,
        settings: &CrawlSettings,
    ) -> Result<Box<dyn PageSession>, FetchError> {
        let options = FetchOptions {
            headers: if settings.stealth_mode {
                self.stealth_headers()
            } else {
                Vec::new()
            },
        };
        let response = self
            .fetcher
            .fetch(&target.target_id, &target.url, &options)
            .await?;
        let page = PageContent {
            url: response.final_url,
            content_type: response.content_type,
            body: String::from_utf8_lossy(&response.body).into_owned(),
            fetched_at: Utc::now(),
        };
        Ok(Box::new(HttpPageSession::new(page)))
    }
}

/// Session over an already fetched document. Motion is only recorded.
#[derive(Debug, Clone)]
pub struct HttpPageSession {
    page: PageContent,
    scroll_y: i64,
    pointer: (u32, u32),
}

impl HttpPageSession {
    pub fn new(page: PageContent) -> Self {
        Self {
            page,
            scroll_y: 0,
            pointer: (0, 0),
        }
    }

    pub fn scroll_position(&self) -> i64 {
        self.scroll_y
    }
}

#[async_trait]
impl PageSession for HttpPageSession {
    fn url(&self) -> &str {
        &self.page.url
    }

    async fn scroll_by(&mut self, dy: i64) -> Result<(), SimulationError> {
        self.scroll_y = self.scroll_y.saturating_add(dy).max(0);
        Ok(())
    }

    async fn move_pointer(&mut self, x: u32, y: u32, _steps: u32) -> Result<(), SimulationError> {
        self.pointer = (x, y);
        Ok(())
    }

    async fn dwell(&mut self, duration: Duration) -> Result<(), SimulationError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    async fn wait_for_quiet(&mut self, _quiet: Duration) -> Result<(), SimulationError> {
        Ok(())
    }

    async fn content(&mut self) -> Result<PageContent, SimulationError> {
        Ok(self.page.clone())
    }

    async fn capture(&mut self) -> Result<Capture, CaptureError> {
        Ok(Capture {
            content_type: self.page.content_type.clone(),
            bytes: self.page.body.clone().into_bytes(),
        })
    }
}
