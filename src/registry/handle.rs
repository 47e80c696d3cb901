//! Open handles and the commit path.

use super::{worker, SessionRegistry};
use crate::callbacks::SessionEventKind;
use crate::engine::{CommitOutcome, CommitRequest};
use crate::errors::{InstallerError, InstallerResult};
use crate::session::SessionId;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;

/// An open reference to a session. Dropping it closes it.
///
/// The session counts as active for as long as at least one handle is open.
pub struct SessionHandle {
    registry: SessionRegistry,
    session_id: SessionId,
    closed: bool,
}

impl SessionHandle {
    pub(super) fn new(registry: SessionRegistry, session_id: SessionId) -> Self {
        Self {
            registry,
            session_id,
            closed: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn set_client_progress(&self, progress: f32) -> InstallerResult<()> {
        let (user_id, report) = {
            let mut tables = self.registry.shared.lock_tables();
            let session = tables.sessions.get_mut(&self.session_id).ok_or(
                InstallerError::SessionNotFound {
                    session_id: self.session_id.get(),
                },
            )?;
            (session.user_id(), session.set_client_progress(progress)?)
        };
        if let Some(progress) = report {
            self.registry.notify(
                self.session_id,
                user_id,
                SessionEventKind::ProgressChanged { progress },
            );
        }
        Ok(())
    }

    /// Seals the session and waits for the seal to be on disk.
    ///
    /// Commit refuses a session whose seal was not written, so a failed write
    /// surfaces here and the caller can seal again.
    pub async fn seal(&self) -> InstallerResult<()> {
        {
            let mut tables = self.registry.shared.lock_tables();
            let session = tables.sessions.get_mut(&self.session_id).ok_or(
                InstallerError::SessionNotFound {
                    session_id: self.session_id.get(),
                },
            )?;
            session.seal()?;
            if session.is_sealed_durably() {
                return Ok(());
            }
        }

        if let Err(e) = worker::checkpoint(self.registry.shared.clone()).await {
            tracing::error!(session_id = %self.session_id, error = %e, "Seal was not persisted");
            return Err(match e {
                InstallerError::PersistenceWrite { .. } => e,
                other => InstallerError::PersistenceWrite {
                    message: other.to_string(),
                },
            });
        }

        let mut tables = self.registry.shared.lock_tables();
        if let Some(session) = tables.sessions.get_mut(&self.session_id) {
            session.mark_sealed_durably();
        }
        tracing::debug!(session_id = %self.session_id, "Session sealed");
        Ok(())
    }

    /// Hands a durably sealed session to the install engine.
    pub async fn commit(&self) -> InstallerResult<CommitOutcome> {
        {
            let mut tables = self.registry.shared.lock_tables();
            let session = tables.sessions.get_mut(&self.session_id).ok_or(
                InstallerError::SessionNotFound {
                    session_id: self.session_id.get(),
                },
            )?;
            session.begin_commit()?;
        }
        self.registry.run_commit(self.session_id).await
    }

    pub fn abandon(&self) -> InstallerResult<()> {
        self.registry.abandon_checked(self.session_id, None)
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.registry.release_handle(self.session_id);
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl SessionRegistry {
    /// Runs the engine for a session already moved to ACTIVE.
    pub(super) async fn run_commit(&self, session_id: SessionId) -> InstallerResult<CommitOutcome> {
        let request = {
            let tables = self.shared.lock_tables();
            let session = tables
                .sessions
                .get(&session_id)
                .ok_or(InstallerError::SessionNotFound {
                    session_id: session_id.get(),
                })?;
            CommitRequest {
                session_id,
                user_id: session.user_id(),
                installer_package: session.installer_package().to_string(),
                stage: session.stage().clone(),
                stage_path: self.shared.stage_path(session.stage()),
                params: session.params().clone(),
                permissions_granted: session.permissions_accepted(),
            }
        };

        tracing::info!(session_id = %session_id, stage = %request.stage, "Committing session");
        // The engine runs on a task the registry owns, so a caller that gives
        // up mid-commit cannot strand the session in ACTIVE.
        let registry = self.clone();
        let task = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(registry.shared.engine.commit(request))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => CommitOutcome::Failed("Install engine panicked".to_string()),
            };
            registry.apply_commit_outcome(session_id, &outcome);
            outcome
        });
        task.await.map_err(|e| InstallerError::Io {
            message: format!("Commit task for session {} failed: {}", session_id, e),
        })
    }

    fn apply_commit_outcome(&self, session_id: SessionId, outcome: &CommitOutcome) {
        match outcome {
            CommitOutcome::Installed => self.finish_session(session_id, true, None),
            CommitOutcome::Failed(message) => {
                tracing::warn!(session_id = %session_id, message = %message, "Commit failed");
                self.finish_session(session_id, false, Some(message.clone()));
            }
            CommitOutcome::PendingUserAction => {
                if let Some(session) = self.shared.lock_tables().sessions.get_mut(&session_id) {
                    session.await_user_action();
                }
                tracing::info!(session_id = %session_id, "Commit waiting on user action");
                self.request_checkpoint();
            }
        }
    }

    fn release_handle(&self, session_id: SessionId) {
        let user_id = {
            let mut tables = self.shared.lock_tables();
            match tables.sessions.get_mut(&session_id) {
                Some(session) => {
                    if !session.close_handle() {
                        return;
                    }
                    session.user_id()
                }
                None => return,
            }
        };
        self.notify(
            session_id,
            user_id,
            SessionEventKind::ActiveChanged { active: false },
        );
    }
}
