//! Crash-consistent storage of the active session table.
//!
//! The table lives in one JSON document replaced atomically on every
//! checkpoint. Icons are kept out of the document in a companion directory,
//! one file per session, and are only rewritten when their digest changes.

use crate::errors::PersistenceError;
use crate::paths;
use crate::session::{InstallSession, PersistedSession, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current document format version.
pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SessionDocument {
    version: u32,
    #[serde(default)]
    sessions: Vec<serde_json::Value>,
    #[serde(default)]
    legacy_session_ids: Vec<i32>,
}

/// Everything recovered from disk at boot.
#[derive(Debug, Default)]
pub struct LoadedSessions {
    /// Sessions young enough to resume
    pub active: Vec<InstallSession>,
    /// Sessions at or over the maximum age; archived without events
    pub expired: Vec<InstallSession>,
    pub legacy_ids: BTreeSet<SessionId>,
    /// Every id seen in the document, including skipped entries
    pub allocated: HashSet<SessionId>,
    /// Entries that could not be reconstructed
    pub skipped: usize,
}

/// Hex sha256 of an icon blob.
pub fn icon_digest(icon: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(icon);
    paths::hex_encode(&hasher.finalize())
}

pub struct PersistenceStore {
    state_dir: PathBuf,
    max_age: chrono::Duration,
    /// Digest of the icon file currently on disk, per session.
    written_digests: HashMap<SessionId, String>,
}

impl PersistenceStore {
    /// Opens the store, creating the state and icon directories.
    pub fn open(state_dir: PathBuf, max_age: chrono::Duration) -> Result<Self, PersistenceError> {
        let icons = paths::icons_dir(&state_dir);
        fs::create_dir_all(&icons).map_err(|source| PersistenceError::Write {
            path: icons.clone(),
            source,
        })?;
        Ok(Self {
            state_dir,
            max_age,
            written_digests: HashMap::new(),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn document_path(&self) -> PathBuf {
        paths::sessions_file(&self.state_dir)
    }

    /// Reads the persisted table.
    ///
    /// Never fails: a missing document is a first run, an unreadable one is
    /// logged and treated as empty, and bad entries are skipped one by one.
    pub fn load(&mut self, now: DateTime<Utc>) -> LoadedSessions {
        let path = self.document_path();
        let mut loaded = LoadedSessions::default();

        let document = match read_document(&path) {
            Ok(Some(document)) => document,
            Ok(None) => {
                tracing::debug!(path = %path.display(), "No session document, starting empty");
                return loaded;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load sessions, starting empty");
                return loaded;
            }
        };

        if document.version != DOCUMENT_VERSION {
            tracing::warn!(
                found = document.version,
                expected = DOCUMENT_VERSION,
                "Session document version differs, reading entries best-effort"
            );
        }

        for raw_id in document.legacy_session_ids {
            let id = SessionId(raw_id);
            if id.is_valid() {
                loaded.legacy_ids.insert(id);
                loaded.allocated.insert(id);
            }
        }

        for entry in document.sessions {
            if let Some(id) = entry_session_id(&entry) {
                loaded.allocated.insert(id);
            }
            match self.reconstruct(entry) {
                Ok(session) => {
                    if now.signed_duration_since(session.created_at()) >= self.max_age {
                        tracing::info!(session_id = %session.id(), "Discarding session older than max age");
                        loaded.expired.push(session);
                    } else {
                        loaded.active.push(session);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable session entry");
                    loaded.skipped += 1;
                }
            }
        }

        tracing::info!(
            active = loaded.active.len(),
            expired = loaded.expired.len(),
            skipped = loaded.skipped,
            "Loaded persisted sessions"
        );
        loaded
    }

    fn reconstruct(&mut self, entry: serde_json::Value) -> anyhow::Result<InstallSession> {
        let record: PersistedSession = serde_json::from_value(entry)?;
        record.validate()?;
        let id = SessionId(record.session_id);
        let icon = match &record.app_icon_digest {
            Some(digest) => self.read_icon(id, digest),
            None => None,
        };
        record.into_session(icon)
    }

    fn read_icon(&mut self, id: SessionId, expected: &str) -> Option<Vec<u8>> {
        let path = paths::icon_path(&self.state_dir, id.get());
        match fs::read(&path) {
            Ok(bytes) if icon_digest(&bytes) == expected => {
                self.written_digests.insert(id, expected.to_string());
                Some(bytes)
            }
            Ok(_) => {
                tracing::warn!(session_id = %id, "Icon digest mismatch, dropping icon");
                None
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Failed to read session icon");
                None
            }
        }
    }

    /// Writes the full active table with an atomic replace.
    pub fn save(
        &mut self,
        sessions: &[InstallSession],
        legacy_ids: &BTreeSet<SessionId>,
    ) -> Result<(), PersistenceError> {
        let mut entries = Vec::with_capacity(sessions.len());
        let mut current_digests = HashMap::new();

        for session in sessions.iter().filter(|s| !s.state().is_finished()) {
            let digest = match &session.params().app_icon {
                Some(icon) => Some(self.write_icon(session.id(), icon)?),
                None => None,
            };
            if let Some(digest) = &digest {
                current_digests.insert(session.id(), digest.clone());
            }
            if let Some(record) = PersistedSession::capture(session, digest) {
                entries.push(serde_json::to_value(record).map_err(PersistenceError::Encode)?);
            }
        }

        let document = SessionDocument {
            version: DOCUMENT_VERSION,
            sessions: entries,
            legacy_session_ids: legacy_ids.iter().map(|id| id.get()).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&document).map_err(PersistenceError::Encode)?;
        let path = self.document_path();
        write_atomic(&path, &bytes).map_err(|source| PersistenceError::Write { path, source })?;

        let stale: Vec<SessionId> = self
            .written_digests
            .keys()
            .filter(|id| !current_digests.contains_key(id))
            .copied()
            .collect();
        for id in stale {
            self.delete_icon(id);
        }
        Ok(())
    }

    fn write_icon(&mut self, id: SessionId, icon: &[u8]) -> Result<String, PersistenceError> {
        let digest = icon_digest(icon);
        if self.written_digests.get(&id) == Some(&digest) {
            return Ok(digest);
        }
        let path = paths::icon_path(&self.state_dir, id.get());
        write_atomic(&path, icon).map_err(|source| PersistenceError::Write { path, source })?;
        self.written_digests.insert(id, digest.clone());
        Ok(digest)
    }

    /// Removes a session's icon file, if any.
    pub fn delete_icon(&mut self, id: SessionId) {
        self.written_digests.remove(&id);
        let path = paths::icon_path(&self.state_dir, id.get());
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(session_id = %id, "Deleted session icon"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to delete session icon"),
        }
    }

    /// Deletes icon files that belong to no live session. Returns how many.
    pub fn prune_icons(&mut self, live: &HashSet<SessionId>) -> usize {
        let dir = paths::icons_dir(&self.state_dir);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to list icons");
                return 0;
            }
        };

        let mut orphans = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(paths::parse_icon_file_name) else {
                continue;
            };
            if !live.contains(&SessionId(id)) {
                orphans.push(SessionId(id));
            }
        }

        for id in &orphans {
            tracing::info!(session_id = %id, "Deleting orphaned icon");
            self.delete_icon(*id);
        }
        orphans.len()
    }
}

fn read_document(path: &Path) -> Result<Option<SessionDocument>, PersistenceError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PersistenceError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| PersistenceError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn entry_session_id(entry: &serde_json::Value) -> Option<SessionId> {
    let raw = entry.get("session_id")?.as_i64()?;
    let id = SessionId(i32::try_from(raw).ok()?);
    id.is_valid().then_some(id)
}

/// Temp file, fsync, rename, then fsync the parent so the rename is durable.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let temp_path = path.with_file_name(format!("{}.tmp", file_name));

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/persistence_tests.rs"]
mod tests;
