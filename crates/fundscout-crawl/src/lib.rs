//! Crawl orchestration: target registry, scheduler, worker pipeline and the
//! engine that ties them together.

pub mod behavior;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod ledger;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod status;
pub mod worker;

pub use behavior::{BehaviorSimulator, RandomSource, SequenceRandom, ThreadRandom};
pub use config::{load_settings_file, EngineConfig, SettingsHandle};
pub use dedup::{fingerprint, Persister};
pub use engine::{DiscoveryEngine, EngineParts};
pub use error::{CaptureError, EngineError, JobError, LedgerError, RegistryError, SimulationError};
pub use evidence::EvidenceCapturer;
pub use ledger::{Award, RewardLedger};
pub use registry::{RegistryFile, TargetRegistry};
pub use scheduler::{PersistedQueue, QueueSnapshot, Scheduler, TargetRun};
pub use session::{Capture, HttpPageSession, HttpSessionFactory, PageSession, SessionFactory};
pub use status::{AggregateStats, QueueStatus, StatusReporter, TargetStatus};
pub use worker::{reward_decision, Pipeline};

pub const CRATE_NAME: &str = "fundscout-crawl";
