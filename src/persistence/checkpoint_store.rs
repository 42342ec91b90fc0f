//! File-backed checkpoint store.
//!
//! The whole keyed collection lives in memory. Every `put` or `delete`
//! serializes the entire collection to a temporary file next to the
//! canonical file and atomically renames it into place, so a crash
//! mid-write leaves the previous file intact.
//!
//! Disk failures never reach the caller: the in-memory collection stays
//! authoritative for the rest of the process lifetime and the failure is
//! logged as a warning.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::models::checkpoint::Checkpoint;
use crate::{AppError, Result};

/// Durable `session_id -> Checkpoint` map with atomic whole-file commits.
///
/// All mutation goes through one internal mutex held across
/// mutate + serialize + rename, which makes the store single-writer even
/// when reset races a step commit for an unrelated session.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Checkpoint>>,
}

impl CheckpointStore {
    /// Open the store at `path`, loading the canonical file if present.
    ///
    /// A missing file yields an empty store. An unreadable or malformed file
    /// is logged and also yields an empty store; individual entries that
    /// fail validation are dropped with a warning.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load(&path);
        info!(
            path = %path.display(),
            sessions = entries.len(),
            "checkpoint store opened"
        );
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Canonical file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current checkpoint for `session_id`, if any.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Checkpoint> {
        self.lock().get(session_id).cloned()
    }

    /// Replace the checkpoint for `session_id` and commit the collection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` only if `checkpoint` violates its structural
    /// invariants; nothing is changed in that case. Disk failures are logged
    /// and not returned.
    pub fn put(&self, session_id: &str, checkpoint: Checkpoint) -> Result<()> {
        checkpoint.validate()?;
        let mut entries = self.lock();
        entries.insert(session_id.to_owned(), checkpoint);
        self.commit(&entries);
        debug!(session_id, "checkpoint stored");
        Ok(())
    }

    /// Remove the checkpoint for `session_id`.
    ///
    /// Returns `true` if a checkpoint existed.
    #[must_use]
    pub fn delete(&self, session_id: &str) -> bool {
        let mut entries = self.lock();
        let existed = entries.remove(session_id).is_some();
        if existed {
            self.commit(&entries);
            info!(session_id, "checkpoint deleted");
        }
        existed
    }

    /// Identifiers of every stored session, sorted.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Checkpoint>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn commit(&self, entries: &HashMap<String, Checkpoint>) {
        if let Err(err) = persist(&self.path, entries) {
            warn!(
                path = %self.path.display(),
                %err,
                "checkpoint persist failed; in-memory state remains authoritative"
            );
        }
    }
}

fn load(path: &Path) -> HashMap<String, Checkpoint> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to read checkpoint file; starting empty");
            return HashMap::new();
        }
    };

    let parsed: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to parse checkpoint file; starting empty");
            return HashMap::new();
        }
    };

    let mut entries = HashMap::with_capacity(parsed.len());
    for (session_id, value) in parsed {
        let decoded = serde_json::from_value::<Checkpoint>(value)
            .map_err(AppError::from)
            .and_then(|checkpoint| checkpoint.validate().map(|()| checkpoint));
        match decoded {
            Ok(checkpoint) => {
                entries.insert(session_id, checkpoint);
            }
            Err(err) => warn!(session_id, %err, "dropping invalid checkpoint entry"),
        }
    }
    entries
}

fn persist(path: &Path, entries: &HashMap<String, Checkpoint>) -> Result<()> {
    // Sorted keys keep the file diff-friendly.
    let ordered: BTreeMap<&String, &Checkpoint> = entries.iter().collect();
    let bytes = serde_json::to_vec_pretty(&ordered)?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Store(format!(
            "failed to create directory {}: {err}",
            parent.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Store(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(&bytes)
        .and_then(|()| tmp.flush())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| AppError::Store(format!("failed to write temporary file: {err}")))?;
    tmp.persist(path).map_err(|err| {
        AppError::Store(format!(
            "failed to persist checkpoint file {}: {err}",
            path.display()
        ))
    })?;
    Ok(())
}
