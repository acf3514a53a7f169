//! Epic data model.
//!
//! An [`Epic`] owns its [`Story`] records for the lifetime of a run. Stories
//! are never removed; they only move towards a terminal status and remain as
//! history in the persisted state.

mod document;
mod story;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use document::{EpicDocument, StoryDocument};
pub use story::{AgentRole, ExecutionStatus, FailureReason, GateVerdict, Story, StoryStatus};
pub(crate) use story::finite_score;

/// Overall status of an epic run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Paused,
}

impl EpicStatus {
    pub fn as_label(self) -> &'static str {
        match self {
            EpicStatus::NotStarted => "not_started",
            EpicStatus::InProgress => "in_progress",
            EpicStatus::Completed => "completed",
            EpicStatus::Failed => "failed",
            EpicStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for EpicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A top-level unit of work composed of dependent stories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epic {
    pub epic_id: String,
    /// Unique per execution attempt; empty until a run starts.
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub title: String,
    pub status: EpicStatus,
    /// Incremented on every persisted mutation.
    #[serde(default)]
    pub revision: u64,
    pub stories: Vec<Story>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Epic {
    pub fn new(epic_id: impl Into<String>, title: impl Into<String>, stories: Vec<Story>) -> Self {
        let now = Utc::now();
        Self {
            epic_id: epic_id.into(),
            run_id: String::new(),
            title: title.into(),
            status: EpicStatus::NotStarted,
            revision: 0,
            stories,
            halt_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    pub fn story_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.stories.iter_mut().find(|s| s.id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<StoryStatus> {
        self.story(id).map(|s| s.status)
    }

    pub fn all_terminal(&self) -> bool {
        self.stories.iter().all(Story::is_terminal)
    }

    pub fn all_completed(&self) -> bool {
        self.stories.iter().all(Story::is_success)
    }

    /// Number of stories per status, in a stable order.
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for story in &self.stories {
            *counts.entry(story.status.as_label().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, status: StoryStatus) -> usize {
        self.stories.iter().filter(|s| s.status == status).count()
    }

    /// Records a mutation: bumps the revision and the update timestamp.
    pub(crate) fn touch(&mut self) {
        self.revision = self.revision.saturating_add(1);
        self.updated_at = Utc::now();
    }

    pub(crate) fn finish(&mut self, status: EpicStatus, halt_reason: Option<String>) {
        self.status = status;
        self.halt_reason = halt_reason;
        if matches!(status, EpicStatus::Completed | EpicStatus::Failed) {
            self.completed_at = Some(Utc::now());
        }
    }
}

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a run ID from timestamp, process ID and a per-process sequence.
pub fn generate_run_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let pid = std::process::id();
    let seq = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("run-{}-{}-{}", timestamp_ms, pid, seq)
}
