//! On-disk form of a live session.

use crate::reconciler::{stage_container_name, stage_dir_name};
use crate::session::install_session::InstallSession;
use crate::session::types::{InstallFlags, InstallMode, SessionId, SessionParams, SessionState, StageRef};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_size_bytes() -> i64 {
    -1
}

/// One entry of the `sessions` array in the persisted document.
///
/// Icons are not embedded; the entry carries the digest of the companion
/// icon file instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub session_id: i32,
    pub user_id: u32,
    pub installer_uid: u32,
    pub installer_package: String,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub mode: InstallMode,
    pub install_flags: InstallFlags,
    #[serde(default = "default_size_bytes")]
    pub size_bytes: i64,
    #[serde(default)]
    pub app_package_name: Option<String>,
    #[serde(default)]
    pub app_label: Option<String>,
    #[serde(default)]
    pub app_icon_digest: Option<String>,
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub stage: StageRef,
    #[serde(default)]
    pub client_progress: f32,
    #[serde(default)]
    pub permissions_accepted: bool,
}

impl PersistedSession {
    /// Captures a session for checkpointing. Finished sessions are never written.
    pub fn capture(session: &InstallSession, app_icon_digest: Option<String>) -> Option<Self> {
        if session.state().is_finished() {
            return None;
        }
        let params = session.params();
        Some(Self {
            session_id: session.id().get(),
            user_id: session.user_id(),
            installer_uid: session.installer_uid(),
            installer_package: session.installer_package().to_string(),
            created_at: session.created_at(),
            state: session.state(),
            mode: params.mode,
            install_flags: params.install_flags,
            size_bytes: params.size_bytes,
            app_package_name: params.app_package_name.clone(),
            app_label: params.app_label.clone(),
            app_icon_digest,
            volume_uuid: params.volume_uuid.clone(),
            stage: session.stage().clone(),
            client_progress: session.client_progress(),
            permissions_accepted: session.permissions_accepted(),
        })
    }

    /// Checks the entry is self-consistent before it is trusted.
    pub fn validate(&self) -> Result<()> {
        let id = SessionId(self.session_id);
        if !id.is_valid() {
            bail!("Session id {} is out of range", self.session_id);
        }
        if self.state.is_finished() {
            bail!("Session {} was persisted in a finished state", id);
        }
        if !self.client_progress.is_finite() {
            bail!("Session {} has a non-finite progress", id);
        }
        match &self.stage {
            StageRef::Directory(path) => {
                let expected = stage_dir_name(id);
                if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
                    bail!(
                        "Session {} stage directory {} does not match {}",
                        id,
                        path.display(),
                        expected
                    );
                }
            }
            StageRef::Container(token) => {
                if *token != stage_container_name(id) {
                    bail!("Session {} stage container {} does not match its id", id, token);
                }
            }
        }
        Ok(())
    }

    /// Rebuilds the in-memory session, attaching the icon read from disk.
    pub fn into_session(self, app_icon: Option<Vec<u8>>) -> Result<InstallSession> {
        self.validate()?;
        let params = SessionParams {
            mode: self.mode,
            install_flags: self.install_flags,
            size_bytes: self.size_bytes,
            app_package_name: self.app_package_name,
            app_label: self.app_label,
            app_icon,
            volume_uuid: self.volume_uuid,
        };
        let session = InstallSession::new(
            SessionId(self.session_id),
            self.user_id,
            self.installer_uid,
            self.installer_package,
            params,
            self.stage,
            self.created_at,
        );
        Ok(InstallSession::restore(
            session,
            self.state,
            self.client_progress,
            self.permissions_accepted,
        ))
    }
}
