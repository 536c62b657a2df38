use std::path::PathBuf;
use std::time::Duration;

use fundscout_core::SettingsError;
use fundscout_extract::EvaluationError;
use fundscout_storage::{ArtifactError, FetchError, PersistenceError};
use thiserror::Error;

/// Behavior simulation problems. Always absorbed by the simulator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimulationError {
    #[error("page action {action} failed: {reason}")]
    Action { action: &'static str, reason: String },
    #[error("page did not settle within {0:?}")]
    StableTimeout(Duration),
    #[error("page content unavailable: {0}")]
    Content(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("session capture failed: {0}")]
    Session(String),
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),
    #[error("captured artifact is empty")]
    Empty,
    #[error(transparent)]
    Storage(#[from] ArtifactError),
}

/// Reasons a visit job fails. Rendered into the job's `last_error`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("unknown target {0}")]
    UnknownTarget(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("target {0} is already registered")]
    Duplicate(String),
    #[error("unknown target {0}")]
    Unknown(String),
    #[error("invalid target url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("saving target registry to {path}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("reward points must be positive")]
    ZeroPoints,
    #[error("ledger journal io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger journal line {line} is invalid: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding reward entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("queue state io at {path}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("queue state at {path} is invalid: {source}")]
    StateDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
