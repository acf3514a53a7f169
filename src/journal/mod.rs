//! Append-only run journal.
//!
//! Lifecycle events for a run are appended as JSON lines next to the run's
//! state file. The journal is diagnostic: a failed append is logged and the
//! run carries on, since the state file is the durable record.

mod event;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;

use crate::epic::{Epic, Story};
use crate::parallel::conflict::Conflict;

pub use event::{JournalEvent, JournalEventType, JOURNAL_SCHEMA_VERSION};

const EVENTS_FILE_NAME: &str = "events.jsonl";

/// Writes journal events for one run.
#[derive(Debug, Clone)]
pub struct EventJournal {
    epic_id: String,
    run_id: String,
    path: PathBuf,
}

impl EventJournal {
    pub fn try_new(run_dir: &Path, epic_id: &str, run_id: &str) -> io::Result<Self> {
        fs::create_dir_all(run_dir)?;
        Ok(Self {
            epic_id: epic_id.to_string(),
            run_id: run_id.to_string(),
            path: run_dir.join(EVENTS_FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn emit_run_start(&self, resumed: bool, total_stories: usize) {
        let mut event = self.event(JournalEventType::RunStart);
        event.details = Some(json!({ "resumed": resumed, "totalStories": total_stories }));
        self.write_event(event);
    }

    pub fn emit_wave_start(&self, wave: usize, story_ids: &[String]) {
        let mut event = self.event(JournalEventType::WaveStart);
        event.wave = Some(wave);
        event.details = Some(json!({ "stories": story_ids }));
        self.write_event(event);
    }

    pub fn emit_conflict(&self, wave: usize, conflict: &Conflict, policy: &str) {
        let mut event = self.event(JournalEventType::Conflict);
        event.wave = Some(wave);
        event.status = Some(policy.to_string());
        event.details = serde_json::to_value(conflict).ok();
        self.write_event(event);
    }

    pub fn emit_story(&self, wave: usize, story: &Story) {
        let mut event = self.event(JournalEventType::Story);
        event.wave = Some(wave);
        event.story_id = Some(story.id.clone());
        event.status = Some(story.status.as_label().to_string());
        if let Some(failure) = &story.failure {
            event.error_type = Some(failure.as_label().to_string());
            event.error_message = Some(failure.to_string());
        }
        let mut details = json!({ "retryCount": story.retry_count });
        if let Some(score) = story.quality_score {
            details["qualityScore"] = json!(score);
        }
        event.details = Some(details);
        self.write_event(event);
    }

    pub fn emit_run_complete(&self, epic: &Epic, metrics: Option<Value>) {
        let mut event = self.event(JournalEventType::RunComplete);
        event.status = Some(epic.status.as_label().to_string());
        event.error_message = epic.halt_reason.clone();
        event.details = Some(json!({
            "revision": epic.revision,
            "counts": epic.status_counts(),
            "metrics": metrics,
        }));
        self.write_event(event);
    }

    fn event(&self, event_type: JournalEventType) -> JournalEvent {
        JournalEvent::new(event_type, &self.epic_id, &self.run_id)
    }

    fn write_event(&self, event: JournalEvent) {
        if let Err(err) = self.append(&event) {
            warn!(
                path = %self.path.display(),
                error = %err,
                "failed to write journal event"
            );
        }
    }

    fn append(&self, event: &JournalEvent) -> io::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.sync_all()
    }
}
