//! Ordered background work: coalesced checkpoints and deferred teardown.

use super::Shared;
use crate::errors::{InstallerError, InstallerResult, PersistenceError};
use crate::session::{SessionId, SessionOutcome, StageRef};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

pub(crate) enum WorkItem {
    /// Persist the current table. Coalesced through `Shared::checkpoint_pending`.
    Checkpoint,
    /// Archive a finished session and release its resources.
    Teardown {
        session_id: SessionId,
        outcome: SessionOutcome,
    },
    Flush(oneshot::Sender<()>),
}

/// Drains the work queue in order until the registry is dropped.
pub(crate) async fn run_registry_worker(
    shared: Weak<Shared>,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
) {
    while let Some(item) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match item {
            WorkItem::Checkpoint => {
                if shared.checkpoint_pending.swap(false, Ordering::SeqCst) {
                    if let Err(e) = checkpoint(shared).await {
                        tracing::error!(error = %e, "Async checkpoint failed, memory stays authoritative");
                    }
                }
            }
            WorkItem::Teardown {
                session_id,
                outcome,
            } => teardown(shared, session_id, outcome).await,
            WorkItem::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Registry worker exiting");
}

/// Writes the table now. The snapshot is taken while the store lock is held,
/// so concurrent checkpoints land in the order their snapshots were taken.
pub(crate) fn checkpoint_blocking(shared: &Shared) -> Result<(), PersistenceError> {
    let mut store = shared.lock_store();
    let (sessions, legacy) = {
        let tables = shared.lock_tables();
        (tables.checkpoint_snapshot(), tables.legacy.clone())
    };
    store.save(&sessions, &legacy)
}

pub(crate) async fn checkpoint(shared: Arc<Shared>) -> InstallerResult<()> {
    match tokio::task::spawn_blocking(move || checkpoint_blocking(&shared)).await {
        Ok(result) => result.map_err(InstallerError::from),
        Err(e) => Err(InstallerError::PersistenceWrite {
            message: format!("Checkpoint task failed: {}", e),
        }),
    }
}

async fn teardown(shared: Arc<Shared>, session_id: SessionId, outcome: SessionOutcome) {
    let removed = {
        let mut tables = shared.lock_tables();
        let removed = tables.sessions.remove(&session_id);
        if let Some(session) = &removed {
            tables.archive(session, outcome.clone(), chrono::Utc::now());
        }
        removed
    };
    let Some(session) = removed else {
        return;
    };
    tracing::info!(session_id = %session_id, outcome = %outcome, "Session torn down");

    let stage_path = shared.stage_path(session.stage());
    let cleanup_shared = shared.clone();
    let cleanup = tokio::task::spawn_blocking(move || {
        if let Some(path) = stage_path {
            remove_stage(&path);
        }
        cleanup_shared.lock_store().delete_icon(session_id);
    })
    .await;
    if let Err(e) = cleanup {
        tracing::warn!(session_id = %session_id, error = %e, "Stage cleanup task failed");
    }

    if let Err(e) = checkpoint(shared).await {
        tracing::error!(error = %e, "Checkpoint after teardown failed");
    }
}

fn remove_stage(path: &Path) {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stage"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove stage"),
    }
}

/// Creates the on-disk stage for a new session.
pub(crate) fn prepare_stage(stage: &StageRef, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match stage {
        StageRef::Directory(_) => {
            std::fs::create_dir(path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
            }
        }
        StageRef::Container(_) => {
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)?;
        }
    }
    Ok(())
}
