//! JSON epic documents.
//!
//! Converts an authored epic description into an [`Epic`] ready to schedule.
//! Graph validity (cycles, dangling references) is checked by the dependency
//! graph, not here.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AgentRole, Epic, Story};
use crate::error::{EngineError, EngineResult};

/// A story as written in an epic document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryDocument {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, alias = "targetFiles")]
    pub files: Vec<String>,
    #[serde(default)]
    pub role: AgentRole,
}

/// An epic as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpicDocument {
    pub epic_id: String,
    #[serde(default)]
    pub title: String,
    pub stories: Vec<StoryDocument>,
}

impl EpicDocument {
    pub fn from_json(content: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn into_epic(self) -> EngineResult<Epic> {
        if self.epic_id.trim().is_empty() {
            return Err(EngineError::InvalidIdentifier {
                kind: "epic",
                value: self.epic_id,
            });
        }
        let stories = self
            .stories
            .into_iter()
            .map(|doc| {
                Story::new(doc.id, doc.title)
                    .with_dependencies(doc.depends_on)
                    .with_files(doc.files)
                    .with_role(doc.role)
            })
            .collect();
        Ok(Epic::new(self.epic_id, self.title, stories))
    }
}
