//! RPC client used by the CLI and by tools talking to a running daemon.

use crate::paths;
use crate::reconciler::ReconcileReport;
use crate::rpc::service::InstallerServiceClient;
use crate::rpc::{DaemonInfo, PortFileContent};
use crate::session::{HistoricalSession, SessionId, SessionInfo, UserId};
use anyhow::{Context, Result};
use std::path::Path;
use tarpc::client;
use tarpc::tokio_serde::formats::Bincode;

/// Reads and parses a daemon port file.
pub fn read_port_file(path: &Path) -> Result<PortFileContent> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Daemon not running? Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Malformed port file {}", path.display()))
}

/// Authenticated connection to the installer port.
pub struct InstallerClient {
    client: InstallerServiceClient,
}

impl InstallerClient {
    /// Connects using the port file in the daemon home directory.
    pub async fn connect_default(uid: u32) -> Result<Self> {
        let port_info = read_port_file(&paths::sessiond_port_path()?)?;
        Self::connect(&port_info, uid).await
    }

    /// Connects to the installer port and authenticates as `uid`.
    pub async fn connect(port_info: &PortFileContent, uid: u32) -> Result<Self> {
        use tarpc::serde_transport::tcp;

        let addr = format!("127.0.0.1:{}", port_info.port);
        let transport = tcp::connect(&addr, Bincode::default)
            .await
            .with_context(|| format!("Failed to connect to daemon at {}", addr))?;
        let client = InstallerServiceClient::new(client::Config::default(), transport).spawn();

        client
            .authenticate(tarpc::context::current(), port_info.token.clone(), uid)
            .await?
            .context("Daemon rejected authentication")?;
        tracing::debug!(port = port_info.port, uid, "Connected to daemon");

        Ok(Self { client })
    }

    /// Raw service client for calls without a convenience wrapper.
    pub fn inner(&self) -> &InstallerServiceClient {
        &self.client
    }

    pub async fn list_sessions(&self, user_id: UserId) -> Result<Vec<SessionInfo>> {
        Ok(self
            .client
            .get_all_sessions(tarpc::context::current(), user_id)
            .await??)
    }

    pub async fn session_info(&self, session_id: SessionId) -> Result<Option<SessionInfo>> {
        Ok(self
            .client
            .get_session_info(tarpc::context::current(), session_id)
            .await??)
    }

    pub async fn historical_sessions(&self) -> Result<Vec<HistoricalSession>> {
        Ok(self
            .client
            .get_historical_sessions(tarpc::context::current())
            .await??)
    }

    pub async fn abandon(&self, session_id: SessionId) -> Result<()> {
        self.client
            .abandon_session(tarpc::context::current(), session_id)
            .await?
            .with_context(|| format!("Failed to abandon session {}", session_id))
    }

    pub async fn volume_mounted(&self, volume_uuid: Option<String>) -> Result<ReconcileReport> {
        Ok(self
            .client
            .volume_mounted(tarpc::context::current(), volume_uuid)
            .await??)
    }

    pub async fn dump(&self) -> Result<String> {
        Ok(self.client.dump(tarpc::context::current()).await??)
    }

    pub async fn daemon_info(&self) -> Result<DaemonInfo> {
        Ok(self.client.daemon_info(tarpc::context::current()).await??)
    }

    pub async fn shutdown(&self) -> Result<()> {
        Ok(self.client.shutdown(tarpc::context::current()).await??)
    }
}
