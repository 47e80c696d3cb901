//! Orphaned stage cleanup.
//!
//! A staging root accumulates `vmdl<id>.tmp` directories and `smdl<id>.tmp`
//! container files. Anything matching those names that no live session claims
//! is left over from a crash or an abandoned session and gets deleted.

use crate::errors::{InstallerError, InstallerResult};
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

const STAGE_DIR_PREFIX: &str = "vmdl";
const STAGE_CONTAINER_PREFIX: &str = "smdl";
const LEGACY_STAGE_PREFIX: &str = "smdl2tmp";
const STAGE_SUFFIX: &str = ".tmp";

/// Directory name of a session's stage.
pub fn stage_dir_name(id: SessionId) -> String {
    format!("{}{}{}", STAGE_DIR_PREFIX, id, STAGE_SUFFIX)
}

/// Token naming a session's external container.
pub fn stage_container_name(id: SessionId) -> String {
    format!("{}{}{}", STAGE_CONTAINER_PREFIX, id, STAGE_SUFFIX)
}

/// True for names the reconciler owns, including the legacy container prefix.
pub fn is_stage_name(name: &str) -> bool {
    let is_file = (name.starts_with(STAGE_DIR_PREFIX) || name.starts_with(STAGE_CONTAINER_PREFIX))
        && name.ends_with(STAGE_SUFFIX);
    is_file || name.starts_with(LEGACY_STAGE_PREFIX)
}

/// Stage references held by live or in-flight sessions.
#[derive(Debug, Clone, Default)]
pub struct ClaimedStages {
    pub dirs: HashSet<PathBuf>,
    pub containers: HashSet<String>,
}

impl ClaimedStages {
    fn claims(&self, path: &Path, name: &str) -> bool {
        self.dirs.contains(path) || self.containers.contains(name)
    }
}

/// Source of the claimed set. Implemented by the session registry.
pub trait StageClaims {
    fn claimed_stages(&self) -> ClaimedStages;
}

/// Outcome of one reconciliation pass over a staging root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub volume: String,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Display name used for the internal volume in logs and reports.
pub const INTERNAL_VOLUME: &str = "internal";

/// Knows every staging root and sweeps them on demand.
#[derive(Debug, Clone)]
pub struct StageReconciler {
    internal_root: PathBuf,
    adopted: BTreeMap<String, PathBuf>,
}

impl StageReconciler {
    pub fn new(internal_root: PathBuf, adopted: BTreeMap<String, PathBuf>) -> Self {
        Self {
            internal_root,
            adopted,
        }
    }

    /// Staging root for a volume; `None` is internal storage.
    pub fn staging_root(&self, volume_uuid: Option<&str>) -> InstallerResult<&Path> {
        match volume_uuid {
            None => Ok(&self.internal_root),
            Some(uuid) => self
                .adopted
                .get(uuid)
                .map(PathBuf::as_path)
                .ok_or_else(|| InstallerError::InvalidRequest {
                    message: format!("Unknown volume {}", uuid),
                }),
        }
    }

    /// Every known volume, internal first.
    pub fn volumes(&self) -> Vec<Option<String>> {
        std::iter::once(None)
            .chain(self.adopted.keys().cloned().map(Some))
            .collect()
    }

    /// Deletes unclaimed stage entries under one volume's staging root.
    ///
    /// Candidates are listed before the claimed set is taken, so a stage
    /// created concurrently is either absent from the listing or already
    /// claimed.
    pub fn reconcile(
        &self,
        volume_uuid: Option<&str>,
        claims: &dyn StageClaims,
    ) -> InstallerResult<ReconcileReport> {
        let root = self.staging_root(volume_uuid)?;
        let mut report = ReconcileReport {
            volume: volume_uuid.unwrap_or(INTERNAL_VOLUME).to_string(),
            ..Default::default()
        };

        let candidates = match list_stage_candidates(root) {
            Ok(candidates) => candidates,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(root = %root.display(), "Staging root missing, nothing to reconcile");
                return Ok(report);
            }
            Err(e) => {
                return Err(InstallerError::Io {
                    message: format!("Failed to list {}: {}", root.display(), e),
                })
            }
        };

        let claimed = claims.claimed_stages();
        for (path, name) in candidates {
            if claimed.claims(&path, &name) {
                continue;
            }
            tracing::info!(path = %path.display(), "Deleting orphaned stage");
            match remove_stage(&path) {
                Ok(()) => report.deleted.push(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete orphaned stage");
                    report.failed.push(path);
                }
            }
        }

        Ok(report)
    }
}

fn list_stage_candidates(root: &Path) -> std::io::Result<Vec<(PathBuf, String)>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_stage_name(&name) {
            candidates.push((entry.path(), name));
        }
    }
    Ok(candidates)
}

fn remove_stage(path: &Path) -> std::io::Result<()> {
    let metadata = std::fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
