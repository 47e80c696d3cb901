//! The authoritative table of install sessions.
//!
//! `SessionRegistry` owns every live session behind one coarse lock. Critical
//! sections only cover id allocation, table insertion and removal, and counter
//! updates. Stage creation, checkpoint writes and event delivery all happen
//! outside the lock, either inline after it is released or on the ordered
//! registry worker.
//!
//! Lock order is store, then tables. Nothing awaits while holding either.

mod dump;
pub mod handle;
mod tables;
mod worker;

pub use handle::SessionHandle;

use crate::allocator::SessionIdAllocator;
use crate::callbacks::{CallbackBus, ObserverId, SessionEvent, SessionEventKind, SessionObserver};
use crate::config::RegistryConfig;
use crate::engine::{InstallEngine, InstallPolicy, PolicyRequest};
use crate::errors::{InstallerError, InstallerResult};
use crate::persistence::PersistenceStore;
use crate::reconciler::{
    stage_container_name, stage_dir_name, ClaimedStages, ReconcileReport, StageClaims,
    StageReconciler,
};
use crate::session::{
    CallerIdentity, HistoricalSession, InstallFlags, InstallSession, PermissionsFollowup,
    SessionId, SessionInfo, SessionOutcome, SessionParams, SessionState, StageRef, UserId,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tables::{Reservation, Tables};
use tokio::sync::{mpsc, oneshot};
use worker::WorkItem;

pub(crate) struct Shared {
    config: RegistryConfig,
    stages: StageReconciler,
    tables: Mutex<Tables>,
    store: Mutex<PersistenceStore>,
    bus: CallbackBus,
    policy: Arc<dyn InstallPolicy>,
    engine: Arc<dyn InstallEngine>,
    worker_tx: mpsc::UnboundedSender<WorkItem>,
    checkpoint_pending: AtomicBool,
}

impl Shared {
    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_store(&self) -> MutexGuard<'_, PersistenceStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Filesystem location backing a stage reference.
    fn stage_path(&self, stage: &StageRef) -> Option<PathBuf> {
        match stage {
            StageRef::Directory(path) => Some(path.clone()),
            StageRef::Container(token) => self
                .stages
                .staging_root(None)
                .ok()
                .map(|root| root.join(token)),
        }
    }
}

impl StageClaims for Shared {
    fn claimed_stages(&self) -> ClaimedStages {
        self.lock_tables().claimed_stages()
    }
}

/// Collaborators the registry is booted with.
pub struct RegistryDeps {
    pub store: PersistenceStore,
    pub stages: StageReconciler,
    pub bus: CallbackBus,
    pub policy: Arc<dyn InstallPolicy>,
    pub engine: Arc<dyn InstallEngine>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

impl SessionRegistry {
    /// Loads persisted state and starts the registry worker.
    ///
    /// Sessions at or over the maximum age go straight to history without a
    /// "created" event. Must be called from within a tokio runtime.
    pub fn boot(config: RegistryConfig, deps: RegistryDeps) -> Self {
        let RegistryDeps {
            mut store,
            stages,
            bus,
            policy,
            engine,
        } = deps;
        let loaded = store.load(chrono::Utc::now());

        let mut tables = Tables::new(
            SessionIdAllocator::from_entropy(),
            config.historical_retention,
        );
        tables.allocated = loaded.allocated;
        tables.legacy = loaded.legacy_ids;
        let now = chrono::Utc::now();
        for session in &loaded.expired {
            tables.allocated.insert(session.id());
            tables.archive(session, SessionOutcome::Expired, now);
        }
        for session in loaded.active {
            tables.allocated.insert(session.id());
            tables.sessions.insert(session.id(), session);
        }
        let live: HashSet<SessionId> = tables.sessions.keys().copied().collect();
        let pruned = store.prune_icons(&live);
        let needs_rewrite = !loaded.expired.is_empty() || loaded.skipped > 0 || pruned > 0;

        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            stages,
            tables: Mutex::new(tables),
            store: Mutex::new(store),
            bus,
            policy,
            engine,
            worker_tx,
            checkpoint_pending: AtomicBool::new(false),
        });
        tokio::spawn(worker::run_registry_worker(
            Arc::downgrade(&shared),
            worker_rx,
        ));

        let registry = Self { shared };
        if needs_rewrite {
            registry.request_checkpoint();
        }
        registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub fn bus(&self) -> &CallbackBus {
        &self.shared.bus
    }

    fn notify(&self, session_id: SessionId, user_id: UserId, kind: SessionEventKind) {
        self.shared
            .bus
            .notify(SessionEvent::new(session_id, user_id, kind));
    }

    /// Schedules an async checkpoint. A request made while one is already
    /// queued is absorbed by it.
    fn request_checkpoint(&self) {
        if !self.shared.checkpoint_pending.swap(true, Ordering::SeqCst) {
            let _ = self.shared.worker_tx.send(WorkItem::Checkpoint);
        }
    }

    fn schedule_teardown(&self, session_id: SessionId, outcome: SessionOutcome) {
        let _ = self.shared.worker_tx.send(WorkItem::Teardown {
            session_id,
            outcome,
        });
    }

    fn is_owner_or_privileged(&self, session: &InstallSession, caller: CallerIdentity) -> bool {
        session.installer_uid() == caller.uid || self.shared.config.is_privileged(caller.uid)
    }

    fn sanitize_params(
        &self,
        caller: CallerIdentity,
        mut params: SessionParams,
    ) -> InstallerResult<SessionParams> {
        let config = &self.shared.config;
        let privileged = config.is_privileged(caller.uid);
        let flags = &mut params.install_flags;

        if config.is_adb(caller.uid) {
            flags.insert(InstallFlags::FROM_ADB);
        } else {
            flags.remove(InstallFlags::FROM_ADB);
            flags.remove(InstallFlags::ALL_USERS);
            flags.remove(InstallFlags::ALLOW_TEST);
            flags.insert(InstallFlags::REPLACE_EXISTING);
        }
        if !privileged {
            flags.remove(InstallFlags::VIRTUAL_PRELOAD);
        }
        if flags.contains(InstallFlags::GRANT_RUNTIME_PERMISSIONS) && !privileged {
            return Err(InstallerError::AuthorizationDenied {
                uid: caller.uid,
                session_id: None,
            });
        }
        if flags.contains(InstallFlags::FORWARD_LOCK) {
            return Err(InstallerError::InvalidRequest {
                message: "Forward-locked installs are not supported".to_string(),
            });
        }
        match (
            flags.contains(InstallFlags::INTERNAL),
            flags.contains(InstallFlags::EXTERNAL),
        ) {
            (true, true) => {
                return Err(InstallerError::InvalidRequest {
                    message: "Install location cannot be both internal and external".to_string(),
                })
            }
            (false, false) => flags.insert(InstallFlags::INTERNAL),
            _ => {}
        }
        if flags.contains(InstallFlags::EXTERNAL) && params.volume_uuid.is_some() {
            return Err(InstallerError::InvalidRequest {
                message: "External containers cannot target an adopted volume".to_string(),
            });
        }
        if params.size_bytes < -1 {
            return Err(InstallerError::InvalidRequest {
                message: format!("Invalid size estimate {}", params.size_bytes),
            });
        }
        self.check_icon_size(params.app_icon.as_deref())?;
        Ok(params)
    }

    fn check_icon_size(&self, icon: Option<&[u8]>) -> InstallerResult<()> {
        let limit = self.shared.config.max_icon_bytes;
        match icon {
            Some(icon) if icon.len() > limit => Err(InstallerError::InvalidRequest {
                message: format!("Icon is {} bytes, limit is {}", icon.len(), limit),
            }),
            _ => Ok(()),
        }
    }

    /// Creates a session and returns its id.
    ///
    /// Quota is checked before the policy gate and again under the lock when
    /// the id is allocated, counting creations still in flight. A refused
    /// request never consumes an id.
    pub async fn create_session(
        &self,
        caller: CallerIdentity,
        installer_package: String,
        user_id: UserId,
        params: SessionParams,
    ) -> InstallerResult<SessionId> {
        let params = self.sanitize_params(caller, params)?;
        let staging_root = self
            .shared
            .stages
            .staging_root(params.volume_uuid.as_deref())?
            .to_path_buf();

        self.shared
            .lock_tables()
            .check_quota(caller.uid, &self.shared.config)?;

        let request = PolicyRequest {
            caller,
            installer_package: installer_package.clone(),
            user_id,
            params: params.clone(),
        };
        if !self.shared.policy.allow_create(&request).await {
            tracing::info!(uid = caller.uid, installer = %installer_package, "Policy refused session creation");
            return Err(InstallerError::AuthorizationDenied {
                uid: caller.uid,
                session_id: None,
            });
        }

        let (session_id, stage, stage_path) = {
            let mut tables = self.shared.lock_tables();
            tables.check_quota(caller.uid, &self.shared.config)?;
            let session_id = tables.allocate_id()?;

            let (stage, stage_path) = if params.install_flags.contains(InstallFlags::EXTERNAL) {
                let token = stage_container_name(session_id);
                let path = staging_root.join(&token);
                (StageRef::Container(token), path)
            } else {
                let path = staging_root.join(stage_dir_name(session_id));
                (StageRef::Directory(path.clone()), path)
            };
            tables.reserved.insert(
                session_id,
                Reservation {
                    installer_uid: caller.uid,
                    stage: stage.clone(),
                },
            );
            (session_id, stage, stage_path)
        };

        let prepare_stage = stage.clone();
        let prepared = tokio::task::spawn_blocking(move || {
            worker::prepare_stage(&prepare_stage, &stage_path)
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|result| result);

        if let Err(e) = prepared {
            self.shared.lock_tables().reserved.remove(&session_id);
            tracing::warn!(session_id = %session_id, error = %e, "Failed to prepare stage");
            return Err(InstallerError::Io {
                message: format!("Failed to prepare stage {}: {}", stage, e),
            });
        }

        let session = InstallSession::new(
            session_id,
            user_id,
            caller.uid,
            installer_package,
            params,
            stage,
            chrono::Utc::now(),
        );
        {
            let mut tables = self.shared.lock_tables();
            tables.reserved.remove(&session_id);
            tables.sessions.insert(session_id, session);
        }

        tracing::info!(session_id = %session_id, uid = caller.uid, user_id, "Session created");
        self.notify(session_id, user_id, SessionEventKind::Created);
        self.request_checkpoint();
        Ok(session_id)
    }

    /// Opens a handle on an OPEN or SEALED session.
    pub fn open_session(
        &self,
        session_id: SessionId,
        caller: CallerIdentity,
    ) -> InstallerResult<SessionHandle> {
        let (user_id, became_active) = {
            let mut tables = self.shared.lock_tables();
            let session = tables
                .sessions
                .get_mut(&session_id)
                .ok_or(InstallerError::SessionNotFound {
                    session_id: session_id.get(),
                })?;
            if !self.is_owner_or_privileged(session, caller) {
                return Err(InstallerError::AuthorizationDenied {
                    uid: caller.uid,
                    session_id: Some(session_id.get()),
                });
            }
            if !matches!(session.state(), SessionState::Open | SessionState::Sealed) {
                return Err(InstallerError::InvalidState {
                    session_id: session_id.get(),
                    message: format!("Session cannot be opened in state {}", session.state()),
                });
            }
            (session.user_id(), session.open_handle())
        };
        if became_active {
            self.notify(
                session_id,
                user_id,
                SessionEventKind::ActiveChanged { active: true },
            );
        }
        Ok(SessionHandle::new(self.clone(), session_id))
    }

    /// Abandons a session on behalf of its owner or a privileged caller.
    pub fn abandon_session(
        &self,
        session_id: SessionId,
        caller: CallerIdentity,
    ) -> InstallerResult<()> {
        self.abandon_checked(session_id, Some(caller))
    }

    /// Shared by the registry entry point and session handles, which were
    /// authorized when they were opened.
    fn abandon_checked(
        &self,
        session_id: SessionId,
        caller: Option<CallerIdentity>,
    ) -> InstallerResult<()> {
        let user_id = {
            let mut tables = self.shared.lock_tables();
            let session = tables
                .sessions
                .get_mut(&session_id)
                .ok_or(InstallerError::SessionNotFound {
                    session_id: session_id.get(),
                })?;
            if let Some(caller) = caller {
                if !self.is_owner_or_privileged(session, caller) {
                    return Err(InstallerError::AuthorizationDenied {
                        uid: caller.uid,
                        session_id: Some(session_id.get()),
                    });
                }
            }
            if !session.abandon()? {
                return Ok(());
            }
            session.user_id()
        };
        tracing::info!(session_id = %session_id, "Session abandoned");
        self.notify(
            session_id,
            user_id,
            SessionEventKind::Finished { success: false },
        );
        self.schedule_teardown(session_id, SessionOutcome::Abandoned);
        Ok(())
    }

    fn update_badging(
        &self,
        session_id: SessionId,
        caller: CallerIdentity,
        apply: impl FnOnce(&mut InstallSession) -> InstallerResult<()>,
    ) -> InstallerResult<()> {
        let user_id = {
            let mut tables = self.shared.lock_tables();
            let session = tables
                .sessions
                .get_mut(&session_id)
                .ok_or(InstallerError::SessionNotFound {
                    session_id: session_id.get(),
                })?;
            if session.installer_uid() != caller.uid {
                return Err(InstallerError::AuthorizationDenied {
                    uid: caller.uid,
                    session_id: Some(session_id.get()),
                });
            }
            apply(session)?;
            session.user_id()
        };
        self.notify(session_id, user_id, SessionEventKind::BadgingChanged);
        self.request_checkpoint();
        Ok(())
    }

    /// Replaces the session icon. Owner only, OPEN sessions only.
    pub fn update_session_icon(
        &self,
        session_id: SessionId,
        caller: CallerIdentity,
        icon: Option<Vec<u8>>,
    ) -> InstallerResult<()> {
        self.check_icon_size(icon.as_deref())?;
        self.update_badging(session_id, caller, |session| session.update_icon(icon))
    }

    /// Replaces the session label. Owner only, OPEN sessions only.
    pub fn update_session_label(
        &self,
        session_id: SessionId,
        caller: CallerIdentity,
        label: Option<String>,
    ) -> InstallerResult<()> {
        self.update_badging(session_id, caller, |session| session.update_label(label))
    }

    /// Delivers the user's permissions decision. Privileged callers only.
    ///
    /// A session parked on user action is committed again or failed; any
    /// other session just records the decision. Unknown ids are ignored.
    pub fn set_permissions_result(
        &self,
        session_id: SessionId,
        caller: CallerIdentity,
        accepted: bool,
    ) -> InstallerResult<()> {
        if !self.shared.config.is_privileged(caller.uid) {
            return Err(InstallerError::AuthorizationDenied {
                uid: caller.uid,
                session_id: Some(session_id.get()),
            });
        }
        let followup = {
            let mut tables = self.shared.lock_tables();
            match tables.sessions.get_mut(&session_id) {
                Some(session) => session.set_permissions_result(accepted),
                None => return Ok(()),
            }
        };
        match followup {
            PermissionsFollowup::Recommit => {
                let registry = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = registry.run_commit(session_id).await {
                        tracing::warn!(session_id = %session_id, error = %e, "Commit after permissions failed");
                    }
                });
            }
            PermissionsFollowup::Fail => {
                self.finish_session(
                    session_id,
                    false,
                    Some("User rejected permissions".to_string()),
                );
            }
            PermissionsFollowup::Recorded => self.request_checkpoint(),
        }
        Ok(())
    }

    /// Moves a session to FINISHED, notifies, and queues its teardown.
    fn finish_session(&self, session_id: SessionId, success: bool, message: Option<String>) {
        let user_id = {
            let mut tables = self.shared.lock_tables();
            match tables.sessions.get_mut(&session_id) {
                Some(session) => {
                    if !session.finish(success, message.clone()) {
                        return;
                    }
                    session.user_id()
                }
                None => return,
            }
        };
        tracing::info!(session_id = %session_id, success, "Session finished");
        self.notify(session_id, user_id, SessionEventKind::Finished { success });
        let outcome = match (success, message) {
            (true, _) => SessionOutcome::Installed,
            (false, message) => SessionOutcome::Failed {
                message: message.unwrap_or_else(|| "Install failed".to_string()),
            },
        };
        self.schedule_teardown(session_id, outcome);
    }

    /// Snapshot of one session, icon included.
    pub fn get_session_info(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.shared
            .lock_tables()
            .sessions
            .get(&session_id)
            .map(|s| s.info(true))
    }

    /// Every live session targeting `user_id`.
    pub fn list_by_user(&self, user_id: UserId) -> Vec<SessionInfo> {
        self.shared
            .lock_tables()
            .sessions
            .values()
            .filter(|s| s.user_id() == user_id)
            .map(|s| s.info(false))
            .collect()
    }

    /// Live sessions created by `installer_package` for `user_id`.
    pub fn list_by_installer(&self, installer_package: &str, user_id: UserId) -> Vec<SessionInfo> {
        self.shared
            .lock_tables()
            .sessions
            .values()
            .filter(|s| s.user_id() == user_id && s.installer_package() == installer_package)
            .map(|s| s.info(false))
            .collect()
    }

    /// Retained summaries of finished sessions, oldest first.
    pub fn historical_sessions(&self) -> Vec<HistoricalSession> {
        self.shared
            .lock_tables()
            .historical
            .iter()
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.shared.lock_tables().sessions.len()
    }

    /// Size of the allocated id set.
    pub fn allocated_count(&self) -> usize {
        self.shared.lock_tables().allocated.len()
    }

    pub async fn register_observer(
        &self,
        observer: Arc<dyn SessionObserver>,
        user_id: UserId,
    ) -> ObserverId {
        self.shared.bus.register(observer, user_id).await
    }

    pub async fn unregister_observer(&self, id: ObserverId) -> bool {
        self.shared.bus.unregister(id).await
    }

    fn allocate_legacy_id(&self) -> InstallerResult<SessionId> {
        let id = {
            let mut tables = self.shared.lock_tables();
            let id = tables.allocate_id()?;
            tables.legacy.insert(id);
            id
        };
        self.request_checkpoint();
        Ok(id)
    }

    /// Mints a stage directory outside any session for pre-session install
    /// flows. The id is reserved forever; the directory is swept like any
    /// other orphan once unused.
    pub async fn allocate_stage_dir_legacy(
        &self,
        volume_uuid: Option<String>,
    ) -> InstallerResult<PathBuf> {
        let root = self
            .shared
            .stages
            .staging_root(volume_uuid.as_deref())?
            .to_path_buf();
        let id = self.allocate_legacy_id()?;
        let path = root.join(stage_dir_name(id));
        let stage = StageRef::Directory(path.clone());
        let prepare_path = path.clone();
        tokio::task::spawn_blocking(move || worker::prepare_stage(&stage, &prepare_path))
            .await
            .map_err(|e| InstallerError::Io {
                message: e.to_string(),
            })?
            .map_err(|e| InstallerError::Io {
                message: format!("Failed to prepare {}: {}", path.display(), e),
            })?;
        Ok(path)
    }

    /// Mints an external container token outside any session.
    pub fn allocate_external_stage_cid_legacy(&self) -> InstallerResult<String> {
        Ok(stage_container_name(self.allocate_legacy_id()?))
    }

    /// Sweeps one volume's staging root for orphaned stages.
    pub async fn reconcile_volume(
        &self,
        volume_uuid: Option<String>,
    ) -> InstallerResult<ReconcileReport> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            shared
                .stages
                .reconcile(volume_uuid.as_deref(), shared.as_ref())
        })
        .await
        .map_err(|e| InstallerError::Io {
            message: format!("Reconcile task failed: {}", e),
        })?
    }

    /// Sweeps every configured volume. Failures are logged and skipped.
    pub async fn reconcile_all(&self) -> Vec<ReconcileReport> {
        let mut reports = Vec::new();
        for volume in self.shared.stages.volumes() {
            match self.reconcile_volume(volume.clone()).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(volume = ?volume, error = %e, "Reconcile failed"),
            }
        }
        reports
    }

    /// Waits until all queued checkpoints, teardowns and events are processed.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.shared.worker_tx.send(WorkItem::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        self.shared.bus.flush().await;
    }

    /// Drains background work and writes a final checkpoint.
    pub async fn shutdown(&self) -> InstallerResult<()> {
        self.flush().await;
        worker::checkpoint(self.shared.clone()).await
    }
}

#[cfg(test)]
#[path = "tests/mod.rs"]
mod tests;
