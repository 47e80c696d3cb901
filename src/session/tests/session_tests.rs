//! Tests for the session state machine and its persisted form.

use super::*;
use crate::errors::InstallerError;
use chrono::Utc;
use std::path::PathBuf;

fn open_session(id: i32) -> InstallSession {
    InstallSession::new(
        SessionId(id),
        0,
        10_001,
        "pkgA".to_string(),
        SessionParams {
            app_label: Some("Example".to_string()),
            size_bytes: 4096,
            ..Default::default()
        },
        StageRef::Directory(PathBuf::from(format!("/staging/vmdl{}.tmp", id))),
        Utc::now(),
    )
}

#[test]
fn test_progress_combines_client_and_internal() {
    let mut session = open_session(1);
    let reported = session.set_client_progress(0.5).unwrap().unwrap();
    assert!((reported - 0.4).abs() < 1e-6);

    session.finish(true, None);
    assert!((session.progress() - 1.0).abs() < 1e-6);
}

#[test]
fn test_small_progress_steps_are_coalesced() {
    let mut session = open_session(1);
    assert_eq!(session.set_client_progress(0.005).unwrap(), None);
    assert!(session.set_client_progress(0.02).unwrap().is_some());
    assert_eq!(session.set_client_progress(0.021).unwrap(), None);
}

#[test]
fn test_progress_is_clamped() {
    let mut session = open_session(1);
    session.set_client_progress(7.0).unwrap();
    assert!((session.progress() - 0.8).abs() < f32::EPSILON);
    assert!(session.set_client_progress(f32::NAN).is_err());
}

#[test]
fn test_open_count_edges() {
    let mut session = open_session(1);
    assert!(session.open_handle());
    assert!(!session.open_handle());
    assert!(!session.close_handle());
    assert!(session.close_handle());
    assert!(!session.close_handle());
    assert!(!session.is_active());
}

#[test]
fn test_badging_only_while_open() {
    let mut session = open_session(1);
    session.update_label(Some("Renamed".to_string())).unwrap();
    session.update_icon(Some(vec![1, 2, 3])).unwrap();
    session.seal().unwrap();

    let err = session.update_label(None).unwrap_err();
    assert!(matches!(err, InstallerError::InvalidState { session_id: 1, .. }));
    assert!(session.update_icon(None).is_err());
    assert_eq!(session.params().app_label.as_deref(), Some("Renamed"));
}

#[test]
fn test_commit_requires_durable_seal() {
    let mut session = open_session(1);
    assert!(session.begin_commit().is_err());

    session.seal().unwrap();
    assert!(session.begin_commit().is_err());

    session.mark_sealed_durably();
    session.begin_commit().unwrap();
    assert_eq!(session.state(), SessionState::Active);
}

#[test]
fn test_abandon_rules() {
    let mut session = open_session(1);
    assert!(session.abandon().unwrap());
    assert_eq!(session.state(), SessionState::Finished { success: false });
    assert!(!session.abandon().unwrap());

    let mut committing = open_session(2);
    committing.seal().unwrap();
    committing.mark_sealed_durably();
    committing.begin_commit().unwrap();
    assert!(committing.abandon().is_err());

    committing.await_user_action();
    assert!(committing.abandon().unwrap());
}

#[test]
fn test_permissions_result_followups() {
    let mut session = open_session(1);
    assert_eq!(session.set_permissions_result(true), PermissionsFollowup::Recorded);
    assert!(session.permissions_accepted());

    session.seal().unwrap();
    session.mark_sealed_durably();
    session.begin_commit().unwrap();
    session.await_user_action();
    assert_eq!(session.set_permissions_result(true), PermissionsFollowup::Recommit);
    assert!(!session.awaiting_user_action());

    session.await_user_action();
    assert_eq!(session.set_permissions_result(false), PermissionsFollowup::Fail);
}

#[test]
fn test_finish_is_one_shot() {
    let mut session = open_session(1);
    assert!(session.finish(true, None));
    assert!(!session.finish(false, Some("late".to_string())));
    assert_eq!(session.state(), SessionState::Finished { success: true });
    assert!(session.set_client_progress(0.5).is_err());
}

#[test]
fn test_info_omits_icon_unless_requested() {
    let mut session = open_session(3);
    session.update_icon(Some(vec![9; 16])).unwrap();
    assert!(session.info(false).app_icon.is_none());
    assert_eq!(session.info(true).app_icon, Some(vec![9; 16]));
}

#[test]
fn test_capture_skips_finished_sessions() {
    let mut session = open_session(4);
    assert!(PersistedSession::capture(&session, None).is_some());
    session.finish(false, None);
    assert!(PersistedSession::capture(&session, None).is_none());
}

#[test]
fn test_active_session_reloads_as_sealed() {
    let mut session = open_session(5);
    session.seal().unwrap();
    session.mark_sealed_durably();
    session.begin_commit().unwrap();
    session.set_client_progress(0.5).unwrap();

    let record = PersistedSession::capture(&session, None).unwrap();
    assert_eq!(record.state, SessionState::Active);

    let restored = record.into_session(None).unwrap();
    assert_eq!(restored.state(), SessionState::Sealed);
    assert!(restored.is_sealed_durably());
    assert!((restored.client_progress() - 0.5).abs() < f32::EPSILON);
    assert!(!restored.is_active());
}

#[test]
fn test_record_rejects_mismatched_stage() {
    let session = open_session(6);
    let mut record = PersistedSession::capture(&session, None).unwrap();
    record.stage = StageRef::Directory(PathBuf::from("/staging/vmdl7.tmp"));
    assert!(record.validate().is_err());

    record.stage = StageRef::Container("smdl6.tmp".to_string());
    assert!(record.validate().is_ok());
}

#[test]
fn test_record_rejects_out_of_range_id() {
    let session = open_session(8);
    let mut record = PersistedSession::capture(&session, None).unwrap();
    record.session_id = 0;
    assert!(record.into_session(None).is_err());
}

#[test]
fn test_install_flags_bit_ops() {
    let mut flags = InstallFlags::FROM_ADB | InstallFlags::ALLOW_TEST;
    assert!(flags.contains(InstallFlags::FROM_ADB));
    flags.remove(InstallFlags::FROM_ADB);
    assert!(!flags.contains(InstallFlags::FROM_ADB));
    flags.insert(InstallFlags::REPLACE_EXISTING);
    assert_eq!(flags, InstallFlags::ALLOW_TEST | InstallFlags::REPLACE_EXISTING);
}
