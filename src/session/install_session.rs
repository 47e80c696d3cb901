//! Per-session state machine.
//!
//! `InstallSession` holds no locks and performs no I/O. The registry owns every
//! instance behind its table lock and turns the return values of these methods
//! into events, checkpoints and teardown work.

use crate::errors::{InstallerError, InstallerResult};
use crate::session::types::{SessionId, SessionInfo, SessionParams, SessionState, StageRef, UserId};
use chrono::{DateTime, Utc};

/// Weight of the installer-reported progress in the published value.
const CLIENT_PROGRESS_WEIGHT: f32 = 0.8;
/// Weight of the engine-reported progress in the published value.
const INTERNAL_PROGRESS_WEIGHT: f32 = 0.2;
/// Smallest progress movement worth an event.
const PROGRESS_REPORT_STEP: f32 = 0.01;

/// What the registry should do after a permissions decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionsFollowup {
    /// Session was parked on user action and may now be committed again
    Recommit,
    /// Session was parked on user action and must fail
    Fail,
    /// Decision recorded for a later commit
    Recorded,
}

#[derive(Debug, Clone)]
pub struct InstallSession {
    id: SessionId,
    user_id: UserId,
    installer_uid: u32,
    installer_package: String,
    created_at: DateTime<Utc>,
    params: SessionParams,
    stage: StageRef,
    state: SessionState,
    sealed_durably: bool,
    client_progress: f32,
    internal_progress: f32,
    reported_progress: f32,
    open_count: u32,
    awaiting_user_action: bool,
    permissions_accepted: bool,
    finish_message: Option<String>,
}

impl InstallSession {
    pub fn new(
        id: SessionId,
        user_id: UserId,
        installer_uid: u32,
        installer_package: String,
        params: SessionParams,
        stage: StageRef,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            installer_uid,
            installer_package,
            created_at,
            params,
            stage,
            state: SessionState::Open,
            sealed_durably: false,
            client_progress: 0.0,
            internal_progress: 0.0,
            reported_progress: 0.0,
            open_count: 0,
            awaiting_user_action: false,
            permissions_accepted: false,
            finish_message: None,
        }
    }

    /// Rebuilds a session read back from the persisted document.
    ///
    /// Anything persisted past OPEN was durably sealed; a commit that was in
    /// flight when the process died is not trusted and reloads as SEALED.
    pub(crate) fn restore(
        mut session: InstallSession,
        state: SessionState,
        client_progress: f32,
        permissions_accepted: bool,
    ) -> Self {
        session.state = match state {
            SessionState::Active => SessionState::Sealed,
            other => other,
        };
        session.sealed_durably = session.state == SessionState::Sealed;
        session.client_progress = client_progress.clamp(0.0, 1.0);
        session.reported_progress = session.progress();
        session.permissions_accepted = permissions_accepted;
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn installer_uid(&self) -> u32 {
        self.installer_uid
    }

    pub fn installer_package(&self) -> &str {
        &self.installer_package
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn stage(&self) -> &StageRef {
        &self.stage
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_sealed_durably(&self) -> bool {
        self.sealed_durably
    }

    pub fn client_progress(&self) -> f32 {
        self.client_progress
    }

    pub fn is_active(&self) -> bool {
        self.open_count > 0
    }

    pub fn awaiting_user_action(&self) -> bool {
        self.awaiting_user_action
    }

    pub fn permissions_accepted(&self) -> bool {
        self.permissions_accepted
    }

    pub fn finish_message(&self) -> Option<&str> {
        self.finish_message.as_deref()
    }

    pub fn progress(&self) -> f32 {
        (self.client_progress * CLIENT_PROGRESS_WEIGHT
            + self.internal_progress * INTERNAL_PROGRESS_WEIGHT)
            .clamp(0.0, 1.0)
    }

    pub fn info(&self, include_icon: bool) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            user_id: self.user_id,
            installer_uid: self.installer_uid,
            installer_package: self.installer_package.clone(),
            created_at: self.created_at,
            state: self.state,
            mode: self.params.mode,
            size_bytes: self.params.size_bytes,
            app_package_name: self.params.app_package_name.clone(),
            app_label: self.params.app_label.clone(),
            app_icon: if include_icon {
                self.params.app_icon.clone()
            } else {
                None
            },
            volume_uuid: self.params.volume_uuid.clone(),
            progress: self.progress(),
            active: self.is_active(),
        }
    }

    fn invalid_state(&self, message: &str) -> InstallerError {
        InstallerError::InvalidState {
            session_id: self.id.get(),
            message: format!("{} (state {})", message, self.state),
        }
    }

    /// Returns the progress to publish, if it moved enough to be worth an event.
    fn take_progress_report(&mut self) -> Option<f32> {
        let progress = self.progress();
        let moved = (progress - self.reported_progress).abs() >= PROGRESS_REPORT_STEP;
        let completed = progress >= 1.0 && self.reported_progress < 1.0;
        if moved || completed {
            self.reported_progress = progress;
            Some(progress)
        } else {
            None
        }
    }

    pub fn set_client_progress(&mut self, progress: f32) -> InstallerResult<Option<f32>> {
        if self.state.is_finished() {
            return Err(self.invalid_state("Progress update on finished session"));
        }
        if progress.is_nan() {
            return Err(InstallerError::InvalidRequest {
                message: "Progress must be a number".to_string(),
            });
        }
        self.client_progress = progress.clamp(0.0, 1.0);
        Ok(self.take_progress_report())
    }

    /// Registers an open handle. Returns true on the idle to active edge.
    pub fn open_handle(&mut self) -> bool {
        self.open_count += 1;
        self.open_count == 1
    }

    /// Releases an open handle. Returns true on the active to idle edge.
    pub fn close_handle(&mut self) -> bool {
        if self.open_count == 0 {
            return false;
        }
        self.open_count -= 1;
        self.open_count == 0
    }

    pub fn update_icon(&mut self, icon: Option<Vec<u8>>) -> InstallerResult<()> {
        if self.state != SessionState::Open {
            return Err(self.invalid_state("Icon can only change while open"));
        }
        self.params.app_icon = icon;
        Ok(())
    }

    pub fn update_label(&mut self, label: Option<String>) -> InstallerResult<()> {
        if self.state != SessionState::Open {
            return Err(self.invalid_state("Label can only change while open"));
        }
        self.params.app_label = label;
        Ok(())
    }

    /// Moves OPEN to SEALED. Sealing again is allowed so a failed durable
    /// write can be retried.
    pub fn seal(&mut self) -> InstallerResult<()> {
        match self.state {
            SessionState::Open | SessionState::Sealed => {
                self.state = SessionState::Sealed;
                Ok(())
            }
            _ => Err(self.invalid_state("Session cannot be sealed")),
        }
    }

    pub fn mark_sealed_durably(&mut self) {
        if self.state == SessionState::Sealed {
            self.sealed_durably = true;
        }
    }

    /// Moves a durably sealed session to ACTIVE ahead of an engine commit.
    pub fn begin_commit(&mut self) -> InstallerResult<()> {
        if self.state != SessionState::Sealed {
            return Err(self.invalid_state("Session must be sealed before commit"));
        }
        if !self.sealed_durably {
            return Err(self.invalid_state("Seal was not recorded durably; seal again"));
        }
        self.state = SessionState::Active;
        self.awaiting_user_action = false;
        Ok(())
    }

    /// Parks an ACTIVE session until a permissions decision arrives.
    pub fn await_user_action(&mut self) {
        if self.state == SessionState::Active {
            self.awaiting_user_action = true;
        }
    }

    pub fn set_permissions_result(&mut self, accepted: bool) -> PermissionsFollowup {
        self.permissions_accepted = accepted;
        if !self.awaiting_user_action || self.state != SessionState::Active {
            return PermissionsFollowup::Recorded;
        }
        self.awaiting_user_action = false;
        if accepted {
            PermissionsFollowup::Recommit
        } else {
            PermissionsFollowup::Fail
        }
    }

    /// Moves the session to FINISHED. Returns false if it already was.
    pub fn finish(&mut self, success: bool, message: Option<String>) -> bool {
        if self.state.is_finished() {
            return false;
        }
        self.state = SessionState::Finished { success };
        self.awaiting_user_action = false;
        self.finish_message = message;
        if success {
            self.internal_progress = 1.0;
            self.client_progress = 1.0;
        }
        true
    }

    /// Abandons the session. Returns false if it had already finished.
    ///
    /// A commit in flight cannot be abandoned unless it is parked waiting on
    /// the user.
    pub fn abandon(&mut self) -> InstallerResult<bool> {
        match self.state {
            SessionState::Open | SessionState::Sealed => {}
            SessionState::Active if self.awaiting_user_action => {}
            SessionState::Active => {
                return Err(self.invalid_state("Commit in progress"));
            }
            SessionState::Finished { .. } => return Ok(false),
        }
        Ok(self.finish(false, Some("Session was abandoned".to_string())))
    }
}
