//! Service definitions for installer ↔ daemon and daemon → observer RPC.

use crate::callbacks::SessionEvent;
use crate::engine::CommitOutcome;
use crate::errors::InstallerResult;
use crate::reconciler::ReconcileReport;
use crate::rpc::DaemonInfo;
use crate::session::{HistoricalSession, SessionId, SessionInfo, SessionParams, UserId};
use std::path::PathBuf;

/// Service exposed by the daemon to installers.
///
/// Handle operations (`set_client_progress`, `seal_session`, `commit_session`)
/// act on a session opened on the same connection. Closing the connection
/// closes every handle it holds.
#[tarpc::service]
pub trait InstallerService {
    /// Authenticate and bind the caller uid to this connection.
    /// Must be called first before any other RPC operations.
    async fn authenticate(token: String, uid: u32) -> InstallerResult<()>;

    async fn create_session(
        installer_package: String,
        user_id: UserId,
        params: SessionParams,
    ) -> InstallerResult<SessionId>;

    async fn open_session(session_id: SessionId) -> InstallerResult<()>;

    async fn close_session(session_id: SessionId) -> InstallerResult<()>;

    async fn set_client_progress(session_id: SessionId, progress: f32) -> InstallerResult<()>;

    /// Returns once the seal is on disk.
    async fn seal_session(session_id: SessionId) -> InstallerResult<()>;

    async fn commit_session(session_id: SessionId) -> InstallerResult<CommitOutcome>;

    async fn abandon_session(session_id: SessionId) -> InstallerResult<()>;

    async fn update_session_icon(session_id: SessionId, icon: Option<Vec<u8>>)
        -> InstallerResult<()>;

    async fn update_session_label(
        session_id: SessionId,
        label: Option<String>,
    ) -> InstallerResult<()>;

    async fn get_session_info(session_id: SessionId) -> InstallerResult<Option<SessionInfo>>;

    async fn get_all_sessions(user_id: UserId) -> InstallerResult<Vec<SessionInfo>>;

    async fn get_my_sessions(
        installer_package: String,
        user_id: UserId,
    ) -> InstallerResult<Vec<SessionInfo>>;

    async fn get_historical_sessions() -> InstallerResult<Vec<HistoricalSession>>;

    /// Privileged callers only.
    async fn set_permissions_result(session_id: SessionId, accepted: bool) -> InstallerResult<()>;

    async fn allocate_stage_dir(volume_uuid: Option<String>) -> InstallerResult<PathBuf>;

    async fn allocate_external_stage_cid() -> InstallerResult<String>;

    /// Sweeps orphaned stages on a volume that just became available.
    async fn volume_mounted(volume_uuid: Option<String>) -> InstallerResult<ReconcileReport>;

    async fn unregister_observer(observer_id: u64) -> InstallerResult<bool>;

    async fn dump() -> InstallerResult<String>;

    async fn daemon_info() -> InstallerResult<DaemonInfo>;

    /// Privileged callers only.
    async fn shutdown() -> InstallerResult<()>;
}

/// Callback service run by observers; the daemon calls into it.
#[tarpc::service]
pub trait ObserverCallback {
    /// User whose sessions this observer wants.
    async fn target_user() -> UserId;

    /// Called once with the id the observer was registered under.
    async fn registered(observer_id: u64);

    /// Delivers one event. Returning false unregisters the observer.
    async fn session_event(event: SessionEvent) -> bool;

    async fn ping() -> bool;
}
