//! Integration tests for the tarpc RPC surface.
//!
//! These tests spin up real RPC servers over a real registry and connect real
//! clients. No mocks are used for the transport.

mod session_tests;

use crate::callbacks::CallbackBus;
use crate::config::RegistryConfig;
use crate::engine::AllowAllPolicy;
use crate::engine::CommandEngine;
use crate::persistence::PersistenceStore;
use crate::reconciler::StageReconciler;
use crate::registry::{RegistryDeps, SessionRegistry};
use crate::rpc::client::InstallerClient;
use crate::rpc::server::{run_installer_server, run_observer_listener};
use crate::rpc::PortFileContent;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const INSTALLER_UID: u32 = 10_001;
pub const SYSTEM_UID: u32 = 1000;

/// Find an available TCP port for testing.
pub fn find_test_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Test harness that manages a real RPC server for testing.
pub struct TestServer {
    pub dir: TempDir,
    pub registry: SessionRegistry,
    pub port_info: PortFileContent,
    pub shutdown_tx: broadcast::Sender<()>,
    _server_handle: tokio::task::JoinHandle<()>,
    _observer_handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a real RPC server for testing.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::default();
        let store =
            PersistenceStore::open(dir.path().join("state"), config.max_session_age()).unwrap();
        let stages = StageReconciler::new(dir.path().join("staging"), BTreeMap::new());
        // `true` exits 0, so every commit installs.
        let engine = CommandEngine::new(vec!["true".to_string()]);
        let registry = SessionRegistry::boot(
            config,
            RegistryDeps {
                store,
                stages,
                bus: CallbackBus::new(Duration::from_secs(1)),
                policy: Arc::new(AllowAllPolicy),
                engine: Arc::new(engine),
            },
        );

        let port_info = PortFileContent {
            port: find_test_port(),
            subscriber_port: find_test_port(),
            token: "test-auth-token-12345".to_string(),
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        let server_handle = {
            let registry = registry.clone();
            let shutdown_tx = shutdown_tx.clone();
            let token = port_info.token.clone();
            let port = port_info.port;
            tokio::spawn(async move {
                let _ = run_installer_server(registry, shutdown_tx, token, port).await;
            })
        };

        let observer_handle = {
            let registry = registry.clone();
            let shutdown_tx = shutdown_tx.clone();
            let port = port_info.subscriber_port;
            tokio::spawn(async move {
                let _ = run_observer_listener(registry, shutdown_tx, port).await;
            })
        };

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            dir,
            registry,
            port_info,
            shutdown_tx,
            _server_handle: server_handle,
            _observer_handle: observer_handle,
        }
    }

    pub async fn client(&self, uid: u32) -> InstallerClient {
        InstallerClient::connect(&self.port_info, uid).await.unwrap()
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
