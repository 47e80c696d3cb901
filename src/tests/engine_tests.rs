//! Tests for the command-backed install engine.

use super::*;

fn request(stage_path: Option<PathBuf>) -> CommitRequest {
    CommitRequest {
        session_id: SessionId(31),
        user_id: 0,
        installer_package: "pkgA".to_string(),
        stage: StageRef::Directory(PathBuf::from("/staging/vmdl31.tmp")),
        stage_path,
        params: SessionParams::default(),
        permissions_granted: false,
    }
}

fn shell(script: &str) -> CommandEngine {
    CommandEngine::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
}

#[tokio::test]
async fn test_unconfigured_engine_fails() {
    let outcome = CommandEngine::new(Vec::new()).commit(request(None)).await;
    assert_eq!(
        outcome,
        CommitOutcome::Failed("No commit command configured".to_string())
    );
}

#[tokio::test]
async fn test_allow_all_policy_admits() {
    let request = PolicyRequest {
        caller: CallerIdentity::new(10_001),
        installer_package: "pkgA".to_string(),
        user_id: 0,
        params: SessionParams::default(),
    };
    assert!(AllowAllPolicy.allow_create(&request).await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_exit_codes_map_to_outcomes() {
    assert_eq!(shell("exit 0").commit(request(None)).await, CommitOutcome::Installed);
    assert_eq!(
        shell("exit 3").commit(request(None)).await,
        CommitOutcome::PendingUserAction
    );
    assert_eq!(
        shell("echo 'INSTALL_FAILED_INVALID_APK' >&2; exit 1")
            .commit(request(None))
            .await,
        CommitOutcome::Failed("INSTALL_FAILED_INVALID_APK".to_string())
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_stage_path_and_session_id_are_appended() {
    // With `sh -c`, the first appended argument becomes $0 and the next $1.
    let engine = shell(r#"[ "$0" = "/data/stage" ] && [ "$1" = "31" ]"#);
    let outcome = engine.commit(request(Some(PathBuf::from("/data/stage")))).await;
    assert_eq!(outcome, CommitOutcome::Installed);
}

#[cfg(unix)]
#[tokio::test]
async fn test_permissions_flag_is_exported() {
    let engine = shell(r#"[ "$INSTALL_SESSIOND_PERMISSIONS_GRANTED" = "1" ]"#);
    let mut granted = request(None);
    granted.permissions_granted = true;
    assert_eq!(engine.commit(granted).await, CommitOutcome::Installed);
    assert!(matches!(
        engine.commit(request(None)).await,
        CommitOutcome::Failed(_)
    ));
}

#[tokio::test]
async fn test_missing_program_fails_cleanly() {
    let engine = CommandEngine::new(vec!["/nonexistent/commit-tool".to_string()]);
    assert!(matches!(
        engine.commit(request(None)).await,
        CommitOutcome::Failed(message) if message.contains("/nonexistent/commit-tool")
    ));
}
