//! Stories: the schedulable units of an epic.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoryError;

/// Lifecycle status of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StoryStatus {
    /// Completed, failed and skipped stories never run again in this run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StoryStatus::Completed | StoryStatus::Failed | StoryStatus::Skipped
        )
    }

    pub fn as_label(self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::Ready => "ready",
            StoryStatus::Running => "running",
            StoryStatus::Completed => "completed",
            StoryStatus::Failed => "failed",
            StoryStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// The kind of agent a story is routed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Analyst,
    Architect,
    #[default]
    Implementer,
    Reviewer,
    Tester,
    Documenter,
}

impl AgentRole {
    pub fn as_label(self) -> &'static str {
        match self {
            AgentRole::Analyst => "analyst",
            AgentRole::Architect => "architect",
            AgentRole::Implementer => "implementer",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Tester => "tester",
            AgentRole::Documenter => "documenter",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Whether the executor ran the story to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
}

/// Quality gate outcome, tracked separately from execution success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Passed,
    Failed,
    /// No threshold configured for this run.
    NotEnforced,
}

/// Why a story ended up failed or skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout { after_ms: u64 },
    ExecutionError { message: String },
    QualityGate { score: Option<f64>, threshold: f64 },
    UpstreamFailed { dependency: String },
}

impl FailureReason {
    /// Stable label used in logs and the run journal.
    pub fn as_label(&self) -> &'static str {
        match self {
            FailureReason::Timeout { .. } => "timeout",
            FailureReason::ExecutionError { .. } => "execution_error",
            FailureReason::QualityGate { .. } => "quality_gate",
            FailureReason::UpstreamFailed { .. } => "upstream_failed",
        }
    }

    pub fn to_error(&self) -> StoryError {
        match self {
            FailureReason::Timeout { after_ms } => StoryError::StoryTimeout {
                after_ms: *after_ms,
            },
            FailureReason::ExecutionError { message } => {
                StoryError::StoryExecutionError(message.clone())
            }
            FailureReason::QualityGate { score, threshold } => StoryError::QualityGateFailure {
                score: *score,
                threshold: *threshold,
            },
            FailureReason::UpstreamFailed { dependency } => {
                StoryError::UpstreamFailed(dependency.clone())
            }
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_error())
    }
}

/// A unit of work with declared dependencies and file footprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    /// Stories that must complete first, in declaration order.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Files (or glob patterns) the story is expected to modify.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub role: AgentRole,
    pub status: StoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Files the executor reported as changed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            depends_on: Vec::new(),
            files: Vec::new(),
            role: AgentRole::default(),
            status: StoryStatus::Pending,
            execution: None,
            gate: None,
            quality_score: None,
            failure: None,
            files_changed: Vec::new(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.role = role;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completed and passed its gate; the only status that unblocks dependents.
    pub fn is_success(&self) -> bool {
        self.status == StoryStatus::Completed
    }

    pub(crate) fn mark_ready(&mut self) {
        self.status = StoryStatus::Ready;
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = StoryStatus::Running;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    pub(crate) fn mark_completed(&mut self, score: Option<f64>, gate: GateVerdict) {
        self.status = StoryStatus::Completed;
        self.execution = Some(ExecutionStatus::Succeeded);
        self.gate = Some(gate);
        self.quality_score = finite_score(score);
        self.failure = None;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, execution: ExecutionStatus, mut reason: FailureReason) {
        self.status = StoryStatus::Failed;
        self.execution = Some(execution);
        if let FailureReason::QualityGate { score, .. } = &mut reason {
            *score = finite_score(*score);
            self.gate = Some(GateVerdict::Failed);
            self.quality_score = *score;
        }
        self.failure = Some(reason);
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn mark_skipped(&mut self, dependency: impl Into<String>) {
        self.status = StoryStatus::Skipped;
        self.failure = Some(FailureReason::UpstreamFailed {
            dependency: dependency.into(),
        });
        self.completed_at = Some(Utc::now());
    }

    /// Back to `pending`, dropping any in-flight bookkeeping.
    pub(crate) fn reset_to_pending(&mut self) {
        self.status = StoryStatus::Pending;
        self.execution = None;
        self.gate = None;
        self.quality_score = None;
        self.failure = None;
        self.files_changed.clear();
        self.started_at = None;
        self.completed_at = None;
    }
}

/// NaN and infinite scores carry no information and cannot be persisted as
/// JSON numbers, so they are recorded as missing.
pub(crate) fn finite_score(score: Option<f64>) -> Option<f64> {
    score.filter(|s| s.is_finite())
}
