//! Session lifecycle over RPC.

use super::{TestServer, INSTALLER_UID};
use crate::engine::CommitOutcome;
use crate::errors::InstallerError;
use crate::session::{SessionOutcome, SessionParams, SessionState};
use std::time::Duration;
use tarpc::context;

#[tokio::test]
async fn test_full_install_over_rpc() {
    let server = TestServer::start().await;
    let client = server.client(INSTALLER_UID).await;
    let rpc = client.inner();

    let params = SessionParams {
        app_package_name: Some("com.example.app".to_string()),
        size_bytes: 4096,
        ..Default::default()
    };
    let id = rpc
        .create_session(context::current(), "pkgA".to_string(), 0, params)
        .await
        .unwrap()
        .unwrap();

    rpc.open_session(context::current(), id).await.unwrap().unwrap();
    rpc.set_client_progress(context::current(), id, 0.5)
        .await
        .unwrap()
        .unwrap();
    rpc.seal_session(context::current(), id).await.unwrap().unwrap();

    let info = client.session_info(id).await.unwrap().unwrap();
    assert_eq!(info.state, SessionState::Sealed);
    assert!(info.active);
    assert_eq!(info.app_package_name.as_deref(), Some("com.example.app"));

    let outcome = rpc
        .commit_session(context::current(), id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Installed);

    server.registry.flush().await;
    let history = client.historical_sessions().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].session_id, id);
    assert_eq!(history[0].outcome, SessionOutcome::Installed);
    assert!(client.session_info(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_handle_calls_need_open_session() {
    let server = TestServer::start().await;
    let client = server.client(INSTALLER_UID).await;
    let rpc = client.inner();

    let id = rpc
        .create_session(context::current(), "pkgA".to_string(), 0, SessionParams::default())
        .await
        .unwrap()
        .unwrap();
    let result = rpc.seal_session(context::current(), id).await.unwrap();
    assert!(matches!(result, Err(InstallerError::InvalidState { .. })));

    rpc.open_session(context::current(), id).await.unwrap().unwrap();
    rpc.close_session(context::current(), id).await.unwrap().unwrap();
    let result = rpc.set_client_progress(context::current(), id, 0.1).await.unwrap();
    assert!(matches!(result, Err(InstallerError::InvalidState { .. })));
}

#[tokio::test]
async fn test_other_installer_cannot_open_or_abandon() {
    let server = TestServer::start().await;
    let owner = server.client(INSTALLER_UID).await;
    let stranger = server.client(INSTALLER_UID + 1).await;

    let id = owner
        .inner()
        .create_session(context::current(), "pkgA".to_string(), 0, SessionParams::default())
        .await
        .unwrap()
        .unwrap();

    let result = stranger.inner().open_session(context::current(), id).await.unwrap();
    assert!(matches!(result, Err(InstallerError::AuthorizationDenied { .. })));
    assert!(stranger.abandon(id).await.is_err());
    assert_eq!(
        owner.session_info(id).await.unwrap().unwrap().state,
        SessionState::Open
    );

    owner.abandon(id).await.unwrap();
    server.registry.flush().await;
    assert_eq!(
        owner.historical_sessions().await.unwrap()[0].outcome,
        SessionOutcome::Abandoned
    );
}

#[tokio::test]
async fn test_dropped_connection_closes_handles() {
    let server = TestServer::start().await;
    let lister = server.client(INSTALLER_UID).await;

    let id = {
        let client = server.client(INSTALLER_UID).await;
        let rpc = client.inner();
        let id = rpc
            .create_session(context::current(), "pkgA".to_string(), 0, SessionParams::default())
            .await
            .unwrap()
            .unwrap();
        rpc.open_session(context::current(), id).await.unwrap().unwrap();
        assert!(lister.session_info(id).await.unwrap().unwrap().active);
        id
    };

    let mut active = true;
    for _ in 0..50 {
        active = lister.session_info(id).await.unwrap().unwrap().active;
        if !active {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!active);
}

#[tokio::test]
async fn test_listing_by_installer() {
    let server = TestServer::start().await;
    let client = server.client(INSTALLER_UID).await;
    let rpc = client.inner();
    for package in ["pkgA", "pkgA", "pkgB"] {
        rpc.create_session(context::current(), package.to_string(), 0, SessionParams::default())
            .await
            .unwrap()
            .unwrap();
    }

    let mine = rpc
        .get_my_sessions(context::current(), "pkgA".to_string(), 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mine.len(), 2);
    assert_eq!(client.list_sessions(0).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_legacy_allocation_over_rpc() {
    let server = TestServer::start().await;
    let client = server.client(INSTALLER_UID).await;

    let dir = client
        .inner()
        .allocate_stage_dir(context::current(), None)
        .await
        .unwrap()
        .unwrap();
    assert!(dir.starts_with(server.dir.path().join("staging")));
    assert!(dir.is_dir());
    let cid = client
        .inner()
        .allocate_external_stage_cid(context::current())
        .await
        .unwrap()
        .unwrap();
    assert!(cid.ends_with(".tmp"));
    assert_eq!(server.registry.allocated_count(), 2);
}
