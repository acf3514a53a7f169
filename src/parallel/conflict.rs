//! File-overlap conflict detection between stories of the same wave.
//!
//! Declared file entries are compared after light normalization. An entry may
//! be a glob pattern (`src/**/*.rs`) or a directory (`src/api`), in which case
//! it overlaps every path it covers.

use std::collections::{BTreeSet, HashMap};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::epic::Story;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Two stories in one wave whose declared files intersect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub story_a: String,
    pub story_b: String,
    /// Overlapping entries, normalized and sorted.
    pub files: Vec<String>,
}

/// Pairwise conflict detection over a wave.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Every pair of stories with overlapping files. Pairs follow the order
    /// of `stories`; an empty result means the wave is conflict-free.
    pub fn detect(stories: &[&Story]) -> Vec<Conflict> {
        let normalized: Vec<Vec<String>> = stories
            .iter()
            .map(|s| s.files.iter().filter_map(|f| normalize_path(f)).collect())
            .collect();

        let mut conflicts = Vec::new();
        for i in 0..stories.len() {
            for j in (i + 1)..stories.len() {
                let files = overlapping_entries(&normalized[i], &normalized[j]);
                if !files.is_empty() {
                    conflicts.push(Conflict {
                        story_a: stories[i].id.clone(),
                        story_b: stories[j].id.clone(),
                        files,
                    });
                }
            }
        }
        conflicts
    }
}

/// Normalize a declared file entry. Blank entries are dropped.
pub fn normalize_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    let parts: Vec<&str> = unified
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn is_pattern(entry: &str) -> bool {
    entry.contains(['*', '?', '['])
}

/// The overlapping part of two normalized entries, if any. For a pattern or
/// directory against a concrete path this is the concrete path.
fn entry_overlap(a: &str, b: &str) -> Option<String> {
    if a == b {
        return Some(a.to_string());
    }
    if covers(a, b) {
        return Some(b.to_string());
    }
    if covers(b, a) {
        return Some(a.to_string());
    }
    None
}

fn covers(outer: &str, inner: &str) -> bool {
    if is_pattern(outer) {
        return Pattern::new(outer)
            .map(|p| p.matches_with(inner, MATCH_OPTIONS))
            .unwrap_or(false);
    }
    !is_pattern(inner)
        && inner.len() > outer.len()
        && inner.starts_with(outer)
        && inner.as_bytes()[outer.len()] == b'/'
}

fn overlapping_entries(a: &[String], b: &[String]) -> Vec<String> {
    let mut files = BTreeSet::new();
    for fa in a {
        for fb in b {
            if let Some(shared) = entry_overlap(fa, fb) {
                files.insert(shared);
            }
        }
    }
    files.into_iter().collect()
}

/// File locks held by running stories, used to serialize conflicting stories.
#[derive(Debug, Clone, Default)]
pub struct FileLockTable {
    held: HashMap<String, Vec<String>>,
}

impl FileLockTable {
    /// Attempts to lock all of `files` for `story_id`.
    ///
    /// Returns `false` without taking any lock if another story holds an
    /// overlapping entry.
    pub fn acquire(&mut self, story_id: &str, files: &[String]) -> bool {
        let wanted: Vec<String> = files.iter().filter_map(|f| normalize_path(f)).collect();
        let blocked = self
            .held
            .iter()
            .filter(|(holder, _)| holder.as_str() != story_id)
            .any(|(_, locked)| !overlapping_entries(locked, &wanted).is_empty());
        if blocked {
            return false;
        }
        self.held.entry(story_id.to_string()).or_default().extend(wanted);
        true
    }

    /// Releases all locks held by a story.
    pub fn release(&mut self, story_id: &str) {
        self.held.remove(story_id);
    }

    /// The story currently holding a lock that overlaps `file`.
    pub fn holder_of(&self, file: &str) -> Option<&str> {
        let file = normalize_path(file)?;
        self.held
            .iter()
            .find(|(_, locked)| locked.iter().any(|l| entry_overlap(l, &file).is_some()))
            .map(|(holder, _)| holder.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
