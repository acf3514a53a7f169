use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

const TAPPS_DIR_NAME: &str = ".tapps";
const EPICS_DIR_NAME: &str = "epics";
const STATE_FILE_NAME: &str = "state.json";
const STATE_TEMP_FILE_NAME: &str = "state.json.tmp";
const STATE_BACKUP_FILE_NAME: &str = "state.json.bak";

/// Identifies one run of one epic in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub epic_id: String,
    pub run_id: String,
}

impl StateKey {
    pub fn new(epic_id: impl Into<String>, run_id: impl Into<String>) -> EngineResult<Self> {
        let key = Self {
            epic_id: epic_id.into(),
            run_id: run_id.into(),
        };
        validate_identifier("epic", &key.epic_id)?;
        validate_identifier("run", &key.run_id)?;
        Ok(key)
    }
}

/// Identifiers become path components, so they must be plain names.
pub fn validate_identifier(kind: &'static str, value: &str) -> EngineResult<()> {
    let invalid = value.trim().is_empty()
        || value != value.trim()
        || value == "."
        || value.contains("..")
        || value.contains(['/', '\\', '\0']);
    if invalid {
        return Err(EngineError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Durable storage for epic state.
///
/// `write` must replace the stored state atomically: after a crash, a reader
/// sees either the previous content or the new one, never a mix.
pub trait StateStore: Send + Sync {
    fn write(&self, key: &StateKey, bytes: &[u8]) -> io::Result<()>;

    /// `Ok(None)` when nothing has been stored for `key`.
    fn read(&self, key: &StateKey) -> io::Result<Option<Vec<u8>>>;

    /// The state that was current before the latest write.
    fn read_backup(&self, key: &StateKey) -> io::Result<Option<Vec<u8>>>;

    fn list_runs(&self, epic_id: &str) -> io::Result<Vec<String>>;

    /// Where the canonical state lives, for diagnostics.
    fn location(&self, key: &StateKey) -> PathBuf;

    /// Directory for per-run artifacts such as the event journal.
    fn run_dir(&self, _key: &StateKey) -> Option<PathBuf> {
        None
    }
}

/// State store backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    root_dir: PathBuf,
}

impl FsStateStore {
    /// Create a store rooted at `<base_dir>/.tapps/epics`.
    pub fn new(base_dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let root_dir = base_dir.into().join(TAPPS_DIR_NAME).join(EPICS_DIR_NAME);
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn dir_for(&self, key: &StateKey) -> PathBuf {
        self.root_dir.join(&key.epic_id).join(&key.run_id)
    }

    fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl StateStore for FsStateStore {
    fn write(&self, key: &StateKey, bytes: &[u8]) -> io::Result<()> {
        let run_dir = self.dir_for(key);
        fs::create_dir_all(&run_dir)?;

        let temp_path = run_dir.join(STATE_TEMP_FILE_NAME);
        let state_path = run_dir.join(STATE_FILE_NAME);

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        if state_path.exists() {
            fs::copy(&state_path, run_dir.join(STATE_BACKUP_FILE_NAME))?;
        }
        fs::rename(&temp_path, &state_path)?;
        Ok(())
    }

    fn read(&self, key: &StateKey) -> io::Result<Option<Vec<u8>>> {
        Self::read_optional(&self.dir_for(key).join(STATE_FILE_NAME))
    }

    fn read_backup(&self, key: &StateKey) -> io::Result<Option<Vec<u8>>> {
        Self::read_optional(&self.dir_for(key).join(STATE_BACKUP_FILE_NAME))
    }

    fn list_runs(&self, epic_id: &str) -> io::Result<Vec<String>> {
        let epic_dir = self.root_dir.join(epic_id);
        let entries = match fs::read_dir(&epic_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !entry.path().join(STATE_FILE_NAME).exists() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                runs.push(name.to_string());
            }
        }
        runs.sort();
        Ok(runs)
    }

    fn location(&self, key: &StateKey) -> PathBuf {
        self.dir_for(key).join(STATE_FILE_NAME)
    }

    fn run_dir(&self, key: &StateKey) -> Option<PathBuf> {
        Some(self.dir_for(key))
    }
}
