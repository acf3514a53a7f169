//! Error types for the orchestration engine.
//!
//! Fatal, run-halting errors are [`EngineError`]. Story-level failures are
//! recorded on the story itself (see [`crate::epic::FailureReason`]) and only
//! surface as [`StoryError`] when displayed.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::epic::AgentRole;
use crate::parallel::conflict::Conflict;

/// Errors that halt an epic run.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The dependency graph contains a cycle (self-dependency included).
    #[error("circular dependency among stories [{}]{}", stories.join(", "), format_cycle_path(path))]
    CycleDetected {
        /// Every story that never became ready.
        stories: Vec<String>,
        /// One concrete cycle, first story repeated at the end.
        path: Option<Vec<String>>,
    },

    /// A story depends on an identifier that is not in the epic.
    #[error("story '{story}' depends on unknown story '{missing}'")]
    DanglingDependency { story: String, missing: String },

    /// Two stories share the same identifier.
    #[error("duplicate story id '{0}'")]
    DuplicateStory(String),

    /// The epic has no stories to schedule.
    #[error("epic '{0}' has no stories")]
    EmptyEpic(String),

    /// An identifier cannot be used as a storage key.
    #[error("invalid {kind} identifier '{value}'")]
    InvalidIdentifier { kind: &'static str, value: String },

    /// No executor is registered for a role that stories require.
    #[error("no executor registered for role '{role}' (stories: {})", stories.join(", "))]
    MissingExecutor { role: AgentRole, stories: Vec<String> },

    /// File-overlap conflicts in a wave under the `abort` conflict policy.
    #[error("{} file conflict(s) in wave {wave}: {}", conflicts.len(), format_conflicts(conflicts))]
    ConflictDetected { wave: usize, conflicts: Vec<Conflict> },

    /// Persisted state failed verification.
    #[error("corrupt state at {}: {reason}", location.display())]
    CorruptState { location: PathBuf, reason: String },

    /// No persisted state exists for the requested run.
    #[error("no saved state for epic '{epic_id}' run '{run_id}'")]
    StateNotFound { epic_id: String, run_id: String },

    /// Persisting state failed after every retry.
    #[error("failed to persist state to {} after {attempts} attempt(s): {reason}", location.display())]
    StorageWriteFailure {
        location: PathBuf,
        attempts: u32,
        reason: String,
    },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error outside of state persistence.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Story-level failures, recorded rather than propagated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoryError {
    #[error("story timed out after {after_ms} ms")]
    StoryTimeout { after_ms: u64 },

    #[error("story execution failed: {0}")]
    StoryExecutionError(String),

    #[error("quality gate failed: {}", format_gate(*score, *threshold))]
    QualityGateFailure { score: Option<f64>, threshold: f64 },

    #[error("upstream dependency '{0}' failed")]
    UpstreamFailed(String),
}

fn format_cycle_path(path: &Option<Vec<String>>) -> String {
    match path {
        Some(path) if !path.is_empty() => format!(" (cycle: {})", path.join(" -> ")),
        _ => String::new(),
    }
}

fn format_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} <-> {} on [{}]", c.story_a, c.story_b, c.files.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_gate(score: Option<f64>, threshold: f64) -> String {
    match score {
        Some(score) => format!("score {score:.2} below threshold {threshold:.2}"),
        None => format!("no score reported (threshold {threshold:.2})"),
    }
}
