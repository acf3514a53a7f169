//! Dependency-ordered epic orchestration.
//!
//! An [`Epic`] is a set of [`Story`] records with declared dependencies and
//! file footprints. [`EpicRunner`] layers the stories into waves, checks each
//! wave for file conflicts, runs it with bounded concurrency through
//! role-specific [`StoryExecutor`]s and persists the epic after every story
//! transition, so an interrupted run can be resumed without redoing
//! completed work.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapps_epic::{
//!     ConflictPolicy, EngineConfig, EpicDocument, EpicRunner, ExecutorRegistry,
//!     FailurePolicy, FsStateStore, StateManager, StoryExecutor,
//! };
//!
//! # async fn demo(executor: Arc<dyn StoryExecutor>) -> tapps_epic::EngineResult<()> {
//! let config = EngineConfig::new(ConflictPolicy::Serialize, FailurePolicy::SkipDependents);
//! let state = StateManager::new(FsStateStore::new(".")?, config.storage_retry);
//! let runner = EpicRunner::new(config, ExecutorRegistry::new().with_default(executor), state);
//!
//! let epic = EpicDocument::load(std::path::Path::new("epic.json"))?.into_epic()?;
//! let report = runner.run(epic).await?;
//! println!("{} after {} waves", report.status(), report.waves_executed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod epic;
pub mod error;
pub mod executor;
pub mod journal;
pub mod logging;
pub mod metrics;
pub mod parallel;
pub mod quality;
pub mod state;

pub use config::{ConflictPolicy, EngineConfig, EngineSettings, FailurePolicy, RetryPolicy};
pub use epic::{
    AgentRole, Epic, EpicDocument, EpicStatus, ExecutionStatus, FailureReason, GateVerdict, Story,
    StoryStatus,
};
pub use error::{EngineError, EngineResult, StoryError};
pub use executor::{
    EpicContext, ExecutorError, ExecutorRegistry, OutcomeStatus, StoryExecutor, StoryOutcome,
    StoryRequest,
};
pub use parallel::{
    CancelHandle, Conflict, ConflictDetector, DependencyGraph, EpicReport, EpicRunner,
};
pub use quality::{GateResult, QualityGate};
pub use state::{FsStateStore, ResumeOptions, StateManager, StateStore};
