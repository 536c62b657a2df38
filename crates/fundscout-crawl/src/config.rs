use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use fundscout_core::{CrawlSettings, SettingsError};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub targets_path: PathBuf,
    pub settings_path: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            targets_path: std::env::var("FUNDSCOUT_TARGETS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./targets.yaml")),
            settings_path: std::env::var("FUNDSCOUT_SETTINGS").ok().map(PathBuf::from),
            state_dir: std::env::var("FUNDSCOUT_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            user_agent: std::env::var("FUNDSCOUT_USER_AGENT")
                .unwrap_or_else(|_| "fundscout-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("FUNDSCOUT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            web_port: std::env::var("FUNDSCOUT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    /// Saved registry, including targets added or discovered at runtime.
    pub fn registry_state_path(&self) -> PathBuf {
        self.state_dir.join("targets.yaml")
    }

    pub fn reward_journal_path(&self) -> PathBuf {
        self.state_dir.join("rewards.jsonl")
    }

    /// Settings from the configured YAML file, or defaults when none is set.
    pub fn load_settings(&self) -> Result<CrawlSettings> {
        match &self.settings_path {
            Some(path) => load_settings_file(path),
            None => Ok(CrawlSettings::default()),
        }
    }
}

pub fn load_settings_file(path: &Path) -> Result<CrawlSettings> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings {}", path.display()))?;
    let settings: CrawlSettings = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing settings {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("validating settings {}", path.display()))?;
    Ok(settings)
}

/// Shared, atomically swappable crawl settings. Readers take a cheap `Arc`
/// clone of the current value; a reload replaces it wholesale.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<Arc<CrawlSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: CrawlSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        let (tx, _rx) = watch::channel(Arc::new(settings));
        Ok(Self { tx: Arc::new(tx) })
    }

    pub fn current(&self) -> Arc<CrawlSettings> {
        self.tx.borrow().clone()
    }

    pub fn replace(&self, settings: CrawlSettings) -> Result<Arc<CrawlSettings>, SettingsError> {
        settings.validate()?;
        let next = Arc::new(settings);
        self.tx.send_replace(next.clone());
        Ok(next)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<CrawlSettings>> {
        self.tx.subscribe()
    }
}
