//! RPC server implementation for the install session daemon.
//!
//! Implements the tarpc `InstallerService` trait and the observer listener.

use crate::build_info::{BUILD_SHA, BUILD_TIMESTAMP};
use crate::callbacks::{CallbackBus, ObserverId};
use crate::engine::CommitOutcome;
use crate::errors::{InstallerError, InstallerResult};
use crate::reconciler::ReconcileReport;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::rpc::observer::RemoteObserver;
use crate::rpc::service::{InstallerService, ObserverCallbackClient};
use crate::rpc::DaemonInfo;
use crate::session::{
    CallerIdentity, HistoricalSession, SessionId, SessionInfo, SessionParams, UserId,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::{broadcast, Mutex};

/// Per-connection state. Dropped with the connection, which closes any
/// handles still open on it.
#[derive(Default)]
struct ConnectionState {
    caller: Option<CallerIdentity>,
    handles: HashMap<SessionId, Arc<SessionHandle>>,
}

/// Server implementation for `InstallerService`. One clone per request.
#[derive(Clone)]
pub struct InstallerServer {
    registry: SessionRegistry,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    expected_token: String,
    connection: Arc<Mutex<ConnectionState>>,
}

impl InstallerServer {
    pub fn new(
        registry: SessionRegistry,
        shutdown_tx: broadcast::Sender<()>,
        shutting_down: Arc<AtomicBool>,
        expected_token: String,
    ) -> Self {
        Self {
            registry,
            shutdown_tx,
            shutting_down,
            expected_token,
            connection: Arc::new(Mutex::new(ConnectionState::default())),
        }
    }

    async fn caller(&self) -> InstallerResult<CallerIdentity> {
        self.connection
            .lock()
            .await
            .caller
            .ok_or(InstallerError::AuthenticationFailed)
    }

    async fn handle(&self, session_id: SessionId) -> InstallerResult<Arc<SessionHandle>> {
        let connection = self.connection.lock().await;
        if connection.caller.is_none() {
            return Err(InstallerError::AuthenticationFailed);
        }
        connection
            .handles
            .get(&session_id)
            .cloned()
            .ok_or(InstallerError::InvalidState {
                session_id: session_id.get(),
                message: "Session is not open on this connection".to_string(),
            })
    }

    fn require_privileged(&self, caller: CallerIdentity) -> InstallerResult<()> {
        if self.registry.config().is_privileged(caller.uid) {
            Ok(())
        } else {
            Err(InstallerError::AuthorizationDenied {
                uid: caller.uid,
                session_id: None,
            })
        }
    }
}

impl InstallerService for InstallerServer {
    async fn authenticate(
        self,
        _: tarpc::context::Context,
        token: String,
        uid: u32,
    ) -> InstallerResult<()> {
        if token != self.expected_token {
            tracing::warn!(uid, "Client authentication failed");
            return Err(InstallerError::AuthenticationFailed);
        }
        self.connection.lock().await.caller = Some(CallerIdentity::new(uid));
        tracing::debug!(uid, "Client authenticated");
        Ok(())
    }

    async fn create_session(
        self,
        _: tarpc::context::Context,
        installer_package: String,
        user_id: UserId,
        params: SessionParams,
    ) -> InstallerResult<SessionId> {
        let caller = self.caller().await?;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(InstallerError::ShuttingDown);
        }
        self.registry
            .create_session(caller, installer_package, user_id, params)
            .await
    }

    async fn open_session(
        self,
        _: tarpc::context::Context,
        session_id: SessionId,
    ) -> InstallerResult<()> {
        let caller = self.caller().await?;
        let mut connection = self.connection.lock().await;
        if connection.handles.contains_key(&session_id) {
            return Ok(());
        }
        let handle = self.registry.open_session(session_id, caller)?;
        connection.handles.insert(session_id, Arc::new(handle));
        Ok(())
    }

    async fn close_session(
        self,
        _: tarpc::context::Context,
        session_id: SessionId,
    ) -> InstallerResult<()> {
        self.caller().await?;
        // The handle closes once any call still using it returns.
        self.connection.lock().await.handles.remove(&session_id);
        Ok(())
    }

    async fn set_client_progress(
        self,
        _: tarpc::context::Context,
        session_id: SessionId,
        progress: f32,
    ) -> InstallerResult<()> {
        self.handle(session_id).await?.set_client_progress(progress)
    }

    async fn seal_session(
        self,
        _: tarpc::context::Context,
        session_id: SessionId,
    ) -> InstallerResult<()> {
        self.handle(session_id).await?.seal().await
    }

    async fn commit_session(
        self,
        _: tarpc::context::Context,
        session_id: SessionId,
    ) -> InstallerResult<CommitOutcome> {
        self.handle(session_id).await?.commit().await
    }

    async fn abandon_session(
        self,
        _: tarpc::context::Context,
        session_id: SessionId,
    ) -> InstallerResult<()> {
        let caller = self.caller().await?;
        self.registry.abandon_session(session_id, caller)
    }

    async fn update_session_icon(
        self,
        _: tarpc::context::Context,
        session_id: SessionId,
        icon: Option<Vec<u8>>,
    ) -> InstallerResult<()> {
        let caller = self.caller().await?;
        self.registry.update_session_icon(session_id, caller, icon)
    }

    async fn update_session_label(
        self,
        _: tarpc::context::Context,
        session_id: SessionId,
        label: Option<String>,
    ) -> InstallerResult<()> {
        let caller = self.caller().await?;
        self.registry.update_session_label(session_id, caller, label)
    }

    async fn get_session_info(
        self,
        _: tarpc::context::Context,
        session_id: SessionId,
    ) -> InstallerResult<Option<SessionInfo>> {
        self.caller().await?;
        Ok(self.registry.get_session_info(session_id))
    }

    async fn get_all_sessions(
        self,
        _: tarpc::context::Context,
        user_id: UserId,
    ) -> InstallerResult<Vec<SessionInfo>> {
        self.caller().await?;
        Ok(self.registry.list_by_user(user_id))
    }

    async fn get_my_sessions(
        self,
        _: tarpc::context::Context,
        installer_package: String,
        user_id: UserId,
    ) -> InstallerResult<Vec<SessionInfo>> {
        self.caller().await?;
        Ok(self.registry.list_by_installer(&installer_package, user_id))
    }

    async fn get_historical_sessions(
        self,
        _: tarpc::context::Context,
    ) -> InstallerResult<Vec<HistoricalSession>> {
        self.caller().await?;
        Ok(self.registry.historical_sessions())
    }

    async fn set_permissions_result(
        self,
        _: tarpc::context::Context,
        session_id: SessionId,
        accepted: bool,
    ) -> InstallerResult<()> {
        let caller = self.caller().await?;
        self.registry
            .set_permissions_result(session_id, caller, accepted)
    }

    async fn allocate_stage_dir(
        self,
        _: tarpc::context::Context,
        volume_uuid: Option<String>,
    ) -> InstallerResult<PathBuf> {
        self.caller().await?;
        self.registry.allocate_stage_dir_legacy(volume_uuid).await
    }

    async fn allocate_external_stage_cid(
        self,
        _: tarpc::context::Context,
    ) -> InstallerResult<String> {
        self.caller().await?;
        self.registry.allocate_external_stage_cid_legacy()
    }

    async fn volume_mounted(
        self,
        _: tarpc::context::Context,
        volume_uuid: Option<String>,
    ) -> InstallerResult<ReconcileReport> {
        let caller = self.caller().await?;
        self.require_privileged(caller)?;
        tracing::info!(volume = ?volume_uuid, "Volume mounted, reconciling stages");
        self.registry.reconcile_volume(volume_uuid).await
    }

    async fn unregister_observer(
        self,
        _: tarpc::context::Context,
        observer_id: u64,
    ) -> InstallerResult<bool> {
        self.caller().await?;
        Ok(self
            .registry
            .unregister_observer(ObserverId(observer_id))
            .await)
    }

    async fn dump(self, _: tarpc::context::Context) -> InstallerResult<String> {
        let caller = self.caller().await?;
        self.require_privileged(caller)?;
        Ok(self.registry.dump())
    }

    async fn daemon_info(self, _: tarpc::context::Context) -> InstallerResult<DaemonInfo> {
        self.caller().await?;
        Ok(DaemonInfo {
            build_sha: BUILD_SHA.to_string(),
            build_timestamp: BUILD_TIMESTAMP,
            pid: std::process::id(),
            active_sessions: self.registry.session_count(),
            allocated_ids: self.registry.allocated_count(),
            observers: self.registry.bus().observer_count().await,
        })
    }

    async fn shutdown(self, _: tarpc::context::Context) -> InstallerResult<()> {
        let caller = self.caller().await?;
        self.require_privileged(caller)?;
        tracing::info!(uid = caller.uid, "Shutdown requested");
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        Ok(())
    }
}

/// Run the installer RPC server until shutdown is signalled.
pub async fn run_installer_server(
    registry: SessionRegistry,
    shutdown_tx: broadcast::Sender<()>,
    auth_token: String,
    port: u16,
) -> anyhow::Result<()> {
    use tarpc::serde_transport::tcp;

    let addr = format!("127.0.0.1:{}", port);
    let mut listener = tcp::listen(&addr, Bincode::default).await?;
    tracing::info!(addr = %addr, "Installer RPC listening");

    let shutting_down = Arc::new(AtomicBool::new(false));
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let server = InstallerServer::new(
                            registry.clone(),
                            shutdown_tx.clone(),
                            shutting_down.clone(),
                            auth_token.clone(),
                        );
                        let channel = server::BaseChannel::with_defaults(transport);

                        tokio::spawn(async move {
                            channel.execute(server.serve()).for_each(|response| async {
                                tokio::spawn(response);
                            }).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

/// Run the observer listener until shutdown is signalled.
///
/// The port binds to 127.0.0.1 only and takes no token: any local process
/// can connect and watch any user's session events. Only event metadata is
/// exposed; every operation that changes a session goes through the
/// authenticated installer port.
pub async fn run_observer_listener(
    registry: SessionRegistry,
    shutdown_tx: broadcast::Sender<()>,
    subscriber_port: u16,
) -> anyhow::Result<()> {
    use tarpc::client;
    use tarpc::serde_transport::tcp;

    let addr = format!("127.0.0.1:{}", subscriber_port);
    let mut listener = tcp::listen(&addr, Bincode::default).await?;
    tracing::info!(addr = %addr, "Observer listener ready (localhost only)");

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let callback_client =
                            ObserverCallbackClient::new(client::Config::default(), transport).spawn();
                        let registry = registry.clone();
                        tokio::spawn(attach_observer(registry, callback_client));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Observer accept error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

async fn attach_observer(registry: SessionRegistry, client: ObserverCallbackClient) {
    let user_id = match client.target_user(tarpc::context::current()).await {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::warn!(error = %e, "Observer did not report a target user");
            return;
        }
    };

    let observer = Arc::new(RemoteObserver::new(client.clone()));
    let observer_id = registry.register_observer(observer, user_id).await;
    tracing::info!(observer_id = %observer_id, user_id, "Observer connected");

    if let Err(e) = client
        .registered(tarpc::context::current(), observer_id.0)
        .await
    {
        tracing::warn!(observer_id = %observer_id, error = %e, "Observer went away during registration");
        registry.unregister_observer(observer_id).await;
    }
}

/// How often connected observers are pinged.
pub const OBSERVER_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically pings observers and drops the ones that went away, so
/// registrations for users with no session activity do not pile up.
pub async fn run_observer_cleanup(
    bus: CallbackBus,
    shutdown_tx: broadcast::Sender<()>,
    period: Duration,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = bus.prune_unresponsive().await;
                if removed > 0 {
                    let remaining = bus.observer_count().await;
                    tracing::info!(
                        removed,
                        remaining,
                        "Cleanup removed dead observers"
                    );
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

/// Find an available TCP port.
pub async fn find_available_port() -> anyhow::Result<u16> {
    use tokio::net::TcpListener;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}
