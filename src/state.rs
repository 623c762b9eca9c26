//! Lifecycle state of a gear.
//!
//! The current phase is a single upper-case word in
//! `app-root/runtime/.state`. Every write also appends
//! `STATE|rfc3339-timestamp` to `.state_history` so the sequence of phases a
//! pipeline went through can be inspected after the fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{LifecycleError, Result};
use crate::gear::GearPaths;

/// Pipeline phase of a gear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    New,
    Building,
    Deploying,
    Started,
    Stopped,
    Idle,
    Unknown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::New => "NEW",
            LifecycleState::Building => "BUILDING",
            LifecycleState::Deploying => "DEPLOYING",
            LifecycleState::Started => "STARTED",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Idle => "IDLE",
            LifecycleState::Unknown => "UNKNOWN",
        }
    }

    /// Parse a persisted value; anything unrecognised is `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "NEW" => LifecycleState::New,
            "BUILDING" => LifecycleState::Building,
            "DEPLOYING" => LifecycleState::Deploying,
            "STARTED" => LifecycleState::Started,
            "STOPPED" => LifecycleState::Stopped,
            "IDLE" => LifecycleState::Idle,
            _ => LifecycleState::Unknown,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable single-value store for the lifecycle state.
///
/// Enforces no transition rules; legality of transitions belongs to the
/// orchestrator.
pub trait StateStore: Send + Sync {
    fn get(&self) -> Result<LifecycleState>;

    /// Persist `state`. Returns only after the write is durable.
    fn set(&self, state: LifecycleState) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: LifecycleState,
    pub timestamp: DateTime<Utc>,
}

pub struct FileStateStore {
    state_file: PathBuf,
    history_file: PathBuf,
}

impl FileStateStore {
    pub fn new(state_file: PathBuf, history_file: PathBuf) -> Self {
        Self {
            state_file,
            history_file,
        }
    }

    pub fn for_gear(paths: &GearPaths) -> Self {
        Self::new(paths.state_file(), paths.state_history_file())
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// All recorded transitions, oldest first. Malformed lines are skipped.
    pub fn history(&self) -> Result<Vec<StateEntry>> {
        if !self.history_file.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.history_file)
            .map_err(|e| LifecycleError::io(&self.history_file, e))?;

        let entries = content
            .lines()
            .filter_map(|line| {
                let (state, timestamp) = line.split_once('|')?;
                Some(StateEntry {
                    state: LifecycleState::parse(state),
                    timestamp: DateTime::parse_from_rfc3339(timestamp)
                        .ok()?
                        .with_timezone(&Utc),
                })
            })
            .collect();
        Ok(entries)
    }

    fn persist(&self, state: LifecycleState) -> std::io::Result<()> {
        let dir = self
            .state_file
            .parent()
            .ok_or_else(|| std::io::Error::other("state file has no parent directory"))?;
        fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(".state.tmp-{}", uuid::Uuid::new_v4()));
        let written = (|| {
            let mut file = File::create(&tmp)?;
            file.write_all(state.as_str().as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp, &self.state_file)
        })();
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        written?;

        // The rename is only durable once the directory entry is flushed.
        File::open(dir)?.sync_all()
    }

    fn append_history(&self, state: LifecycleState) -> std::io::Result<()> {
        let entry = format!("{}|{}\n", state.as_str(), Utc::now().to_rfc3339());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_file)?
            .write_all(entry.as_bytes())
    }
}

impl StateStore for FileStateStore {
    fn get(&self) -> Result<LifecycleState> {
        match fs::read_to_string(&self.state_file) {
            Ok(content) => {
                let state = LifecycleState::parse(&content);
                if state == LifecycleState::Unknown {
                    tracing::warn!(
                        path = %self.state_file.display(),
                        value = content.trim(),
                        "Unrecognised lifecycle state"
                    );
                }
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LifecycleState::New),
            Err(e) => Err(LifecycleError::io(&self.state_file, e)),
        }
    }

    fn set(&self, state: LifecycleState) -> Result<()> {
        self.persist(state)
            .map_err(|source| LifecycleError::StatePersistence {
                path: self.state_file.clone(),
                source,
            })?;
        if let Err(e) = self.append_history(state) {
            tracing::warn!(path = %self.history_file.display(), error = %e, "Failed to append state history");
        }
        tracing::debug!(state = %state, "Lifecycle state set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (FileStateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let paths = GearPaths::new(dir.path());
        (FileStateStore::for_gear(&paths), dir)
    }

    #[test]
    fn test_missing_state_reads_as_new() {
        let (store, _dir) = make_store();
        assert_eq!(store.get().unwrap(), LifecycleState::New);
        assert!(store.history().unwrap().is_empty());
    }

    #[test]
    fn test_set_then_get() {
        let (store, _dir) = make_store();
        store.set(LifecycleState::Building).unwrap();
        assert_eq!(store.get().unwrap(), LifecycleState::Building);
        assert_eq!(
            fs::read_to_string(store.state_file()).unwrap(),
            "BUILDING\n"
        );
    }

    #[test]
    fn test_set_leaves_no_temp_files() {
        let (store, dir) = make_store();
        store.set(LifecycleState::Deploying).unwrap();
        store.set(LifecycleState::Started).unwrap();
        let runtime = dir.path().join("app-root/runtime");
        let leftovers: Vec<_> = fs::read_dir(&runtime)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".state.tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_history_records_transitions_in_order() {
        let (store, _dir) = make_store();
        store.set(LifecycleState::Building).unwrap();
        store.set(LifecycleState::Deploying).unwrap();
        store.set(LifecycleState::Started).unwrap();
        let states: Vec<LifecycleState> =
            store.history().unwrap().into_iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                LifecycleState::Building,
                LifecycleState::Deploying,
                LifecycleState::Started
            ]
        );
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let paths = GearPaths::new(dir.path());
        {
            let store = FileStateStore::for_gear(&paths);
            store.set(LifecycleState::Stopped).unwrap();
        }
        let store = FileStateStore::for_gear(&paths);
        assert_eq!(store.get().unwrap(), LifecycleState::Stopped);
    }

    #[test]
    fn test_unrecognised_value_is_unknown() {
        let (store, _dir) = make_store();
        fs::create_dir_all(store.state_file().parent().unwrap()).unwrap();
        fs::write(store.state_file(), "exploded\n").unwrap();
        assert_eq!(store.get().unwrap(), LifecycleState::Unknown);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(LifecycleState::parse("started\n"), LifecycleState::Started);
        assert_eq!(LifecycleState::parse("IDLE"), LifecycleState::Idle);
        assert_eq!(LifecycleState::Deploying.to_string(), "DEPLOYING");
    }

    #[test]
    fn test_set_fails_when_runtime_dir_is_a_file() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let store = FileStateStore::new(blocker.join(".state"), blocker.join(".state_history"));
        let err = store.set(LifecycleState::Building).unwrap_err();
        assert!(matches!(err, LifecycleError::StatePersistence { .. }));
    }
}
