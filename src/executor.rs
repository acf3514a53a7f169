//! Story executor contract and role registry.
//!
//! The engine never implements stories itself. Each [`AgentRole`] is backed by
//! a [`StoryExecutor`] registered in an [`ExecutorRegistry`]; stories are
//! routed by their role.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::epic::{AgentRole, Epic, Story};
use crate::error::{EngineError, EngineResult};

/// Outcome reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// What an executor returns for one story attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryOutcome {
    pub status: OutcomeStatus,
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    pub error: Option<String>,
}

impl StoryOutcome {
    pub fn success(quality_score: Option<f64>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            quality_score,
            files_changed: Vec::new(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            quality_score: None,
            files_changed: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_files_changed<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files_changed = files.into_iter().map(Into::into).collect();
        self
    }
}

/// Errors raised by an executor instead of returning an outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// Worth retrying (network hiccup, rate limit, ...).
    #[error("transient executor error: {0}")]
    Transient(String),
    /// Permanent failure.
    #[error("executor failed: {0}")]
    Failed(String),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::Transient(_))
    }
}

/// Summary of a completed story, visible to later stories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStory {
    pub id: String,
    pub title: String,
    pub quality_score: Option<f64>,
    pub files_changed: Vec<String>,
}

/// Accumulated epic context handed to every executor call.
#[derive(Debug, Clone, PartialEq)]
pub struct EpicContext {
    pub epic_id: String,
    pub run_id: String,
    pub epic_title: String,
    pub wave: usize,
    pub completed: Vec<CompletedStory>,
}

impl EpicContext {
    pub fn from_epic(epic: &Epic, wave: usize) -> Self {
        let completed = epic
            .stories
            .iter()
            .filter(|s| s.is_success())
            .map(|s| CompletedStory {
                id: s.id.clone(),
                title: s.title.clone(),
                quality_score: s.quality_score,
                files_changed: s.files_changed.clone(),
            })
            .collect();
        Self {
            epic_id: epic.epic_id.clone(),
            run_id: epic.run_id.clone(),
            epic_title: epic.title.clone(),
            wave,
            completed,
        }
    }
}

/// One executor invocation.
#[derive(Debug, Clone)]
pub struct StoryRequest {
    pub story: Story,
    /// 1-based attempt number; above 1 on retries.
    pub attempt: u32,
    pub context: Arc<EpicContext>,
}

/// Implements, reviews and tests a single story.
#[async_trait]
pub trait StoryExecutor: Send + Sync {
    async fn execute(&self, request: StoryRequest) -> Result<StoryOutcome, ExecutorError>;
}

/// Executors keyed by role.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<AgentRole, Arc<dyn StoryExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for a role.
    pub fn register(mut self, role: AgentRole, executor: Arc<dyn StoryExecutor>) -> Self {
        self.executors.insert(role, executor);
        self
    }

    /// Register one executor for every role.
    pub fn with_default(mut self, executor: Arc<dyn StoryExecutor>) -> Self {
        for role in [
            AgentRole::Analyst,
            AgentRole::Architect,
            AgentRole::Implementer,
            AgentRole::Reviewer,
            AgentRole::Tester,
            AgentRole::Documenter,
        ] {
            self.executors.entry(role).or_insert_with(|| executor.clone());
        }
        self
    }

    pub fn get(&self, role: AgentRole) -> Option<Arc<dyn StoryExecutor>> {
        self.executors.get(&role).cloned()
    }

    pub fn roles(&self) -> Vec<AgentRole> {
        let mut roles: Vec<AgentRole> = self.executors.keys().copied().collect();
        roles.sort_by_key(|r| r.as_label());
        roles
    }

    /// Every role used by `stories` must have an executor.
    pub fn ensure_covers(&self, stories: &[Story]) -> EngineResult<()> {
        let mut missing: BTreeMap<&'static str, (AgentRole, Vec<String>)> = BTreeMap::new();
        for story in stories.iter().filter(|s| !s.is_terminal()) {
            if !self.executors.contains_key(&story.role) {
                missing
                    .entry(story.role.as_label())
                    .or_insert_with(|| (story.role, Vec::new()))
                    .1
                    .push(story.id.clone());
            }
        }
        match missing.into_values().next() {
            Some((role, stories)) => Err(EngineError::MissingExecutor { role, stories }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}
