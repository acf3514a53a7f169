use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// Current journal schema version.
pub const JOURNAL_SCHEMA_VERSION: &str = "v1";

/// Journal event types for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    RunStart,
    WaveStart,
    Conflict,
    Story,
    RunComplete,
}

/// One line of the run journal.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEvent {
    pub schema_version: &'static str,
    pub event_type: JournalEventType,
    pub timestamp: String,
    pub epic_id: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl JournalEvent {
    pub fn new(event_type: JournalEventType, epic_id: &str, run_id: &str) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            event_type,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            epic_id: epic_id.to_string(),
            run_id: run_id.to_string(),
            wave: None,
            story_id: None,
            status: None,
            error_type: None,
            error_message: None,
            details: None,
        }
    }
}
