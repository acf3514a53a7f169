//! Epic state persistence and crash-safe resume.
//!
//! Every story transition is saved through [`StateManager::save`]. A save
//! writes a checksummed [`PersistedState`] via an atomic replace; a failed
//! write is retried a bounded number of times and then surfaces as
//! [`EngineError::StorageWriteFailure`], which halts the run.

mod record;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::epic::{Epic, EpicStatus, StoryStatus};
use crate::error::{EngineError, EngineResult};
use crate::parallel::dependency::DependencyGraph;

pub use record::{compute_checksum, PersistedState, STATE_SCHEMA_VERSION};
pub use store::{validate_identifier, FsStateStore, StateKey, StateStore};

/// Options for resuming a persisted run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Reset failed stories, and the dependents skipped because of them,
    /// back to `pending`.
    pub retry_failed: bool,
}

/// A loaded run, normalized and ready to continue.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub epic: Epic,
    pub graph: DependencyGraph,
    /// Stories eligible to run first.
    pub initial_wave: Vec<String>,
    /// Stories found `running` or `ready` and reset to `pending`.
    pub reset: Vec<String>,
}

impl ResumePlan {
    /// Nothing left to do: every story is terminal and nothing was reset.
    pub fn is_finished(&self) -> bool {
        self.epic.all_terminal() && self.reset.is_empty()
    }
}

/// Saves, loads and resumes epic state for one run at a time.
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
}

impl StateManager {
    pub fn new(store: impl StateStore + 'static, retry: RetryPolicy) -> Self {
        Self::with_store(Arc::new(store), retry)
    }

    pub fn with_store(store: Arc<dyn StateStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Same store, different write retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Bump the epic revision and persist it atomically.
    pub async fn save(&self, epic: &mut Epic) -> EngineResult<()> {
        let key = StateKey::new(&epic.epic_id, &epic.run_id)?;
        epic.touch();
        let bytes = PersistedState::seal(epic)?.to_bytes()?;

        let max_attempts = self.retry.max_attempts();
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.store.write(&key, &bytes) {
                Ok(()) => {
                    debug!(
                        epic_id = %key.epic_id,
                        run_id = %key.run_id,
                        revision = epic.revision,
                        "state saved"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        epic_id = %key.epic_id,
                        run_id = %key.run_id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "state write failed"
                    );
                    last_error = err.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        let location = self.store.location(&key);
        error!(location = %location.display(), attempts = max_attempts, "giving up on state write");
        Err(EngineError::StorageWriteFailure {
            location,
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// Load and verify the canonical state of a run.
    pub fn load(&self, epic_id: &str, run_id: &str) -> EngineResult<Epic> {
        let key = StateKey::new(epic_id, run_id)?;
        let bytes = self.store.read(&key)?.ok_or_else(|| EngineError::StateNotFound {
            epic_id: epic_id.to_string(),
            run_id: run_id.to_string(),
        })?;
        self.verify(&key, &bytes)
    }

    /// Load and verify the state that preceded the latest save.
    pub fn load_backup(&self, epic_id: &str, run_id: &str) -> EngineResult<Epic> {
        let key = StateKey::new(epic_id, run_id)?;
        let bytes = self
            .store
            .read_backup(&key)?
            .ok_or_else(|| EngineError::StateNotFound {
                epic_id: epic_id.to_string(),
                run_id: run_id.to_string(),
            })?;
        self.verify(&key, &bytes)
    }

    fn verify(&self, key: &StateKey, bytes: &[u8]) -> EngineResult<Epic> {
        let location = self.store.location(key);
        let record = PersistedState::from_bytes(bytes, &location)?;
        if record.epic.epic_id != key.epic_id || record.epic.run_id != key.run_id {
            return Err(EngineError::CorruptState {
                location,
                reason: format!(
                    "record belongs to epic '{}' run '{}'",
                    record.epic.epic_id, record.epic.run_id
                ),
            });
        }
        Ok(record.epic)
    }

    /// Load a run and prepare it for continuation.
    ///
    /// Completed stories keep their results. Stories caught `running` (or
    /// `ready`) at crash time are reset to `pending` because their partial
    /// work cannot be trusted.
    pub fn resume(
        &self,
        epic_id: &str,
        run_id: &str,
        options: ResumeOptions,
    ) -> EngineResult<ResumePlan> {
        let mut epic = self.load(epic_id, run_id)?;
        let graph = DependencyGraph::build(&epic.stories)?;

        let mut reset = Vec::new();
        for story in epic.stories.iter_mut() {
            let retry = options.retry_failed
                && matches!(story.status, StoryStatus::Failed | StoryStatus::Skipped);
            if matches!(story.status, StoryStatus::Running | StoryStatus::Ready) || retry {
                story.reset_to_pending();
                reset.push(story.id.clone());
            }
        }

        if !reset.is_empty() && epic.status != EpicStatus::NotStarted {
            epic.status = EpicStatus::InProgress;
            epic.halt_reason = None;
            epic.completed_at = None;
        }

        let initial_wave = graph.ready_wave(&epic);
        info!(
            epic_id,
            run_id,
            revision = epic.revision,
            reset = reset.len(),
            initial_wave = initial_wave.len(),
            "resuming epic"
        );
        Ok(ResumePlan {
            epic,
            graph,
            initial_wave,
            reset,
        })
    }

    pub fn list_runs(&self, epic_id: &str) -> EngineResult<Vec<String>> {
        validate_identifier("epic", epic_id)?;
        Ok(self.store.list_runs(epic_id)?)
    }

    pub fn run_dir(&self, epic: &Epic) -> Option<PathBuf> {
        let key = StateKey::new(&epic.epic_id, &epic.run_id).ok()?;
        self.store.run_dir(&key)
    }
}
