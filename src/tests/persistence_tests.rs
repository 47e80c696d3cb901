//! Tests for the persisted session document.

use super::*;
use crate::session::{SessionParams, SessionState, StageRef};
use chrono::Duration;
use tempfile::tempdir;

fn max_age() -> Duration {
    Duration::days(3)
}

fn session_at(id: i32, created_at: DateTime<Utc>) -> InstallSession {
    InstallSession::new(
        SessionId(id),
        0,
        10_001,
        "pkgA".to_string(),
        SessionParams {
            app_package_name: Some("com.example.app".to_string()),
            size_bytes: 1024,
            ..Default::default()
        },
        StageRef::Directory(PathBuf::from(format!("/staging/vmdl{}.tmp", id))),
        created_at,
    )
}

fn with_icon(mut session: InstallSession, icon: &[u8]) -> InstallSession {
    session.update_icon(Some(icon.to_vec())).unwrap();
    session
}

#[test]
fn test_missing_document_is_first_run() {
    let dir = tempdir().unwrap();
    let mut store = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();

    let loaded = store.load(Utc::now());
    assert!(loaded.active.is_empty());
    assert!(loaded.allocated.is_empty());
    assert_eq!(loaded.skipped, 0);
}

#[test]
fn test_save_and_load_preserves_sessions() {
    let dir = tempdir().unwrap();
    let now = Utc::now();
    let mut store = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();

    let mut sealed = session_at(20, now);
    sealed.seal().unwrap();
    sealed.mark_sealed_durably();
    let sessions = vec![session_at(10, now), sealed];
    let legacy: BTreeSet<SessionId> = [SessionId(99)].into_iter().collect();

    store.save(&sessions, &legacy).unwrap();
    assert!(store.document_path().exists());
    assert!(!dir.path().join("install_sessions.json.tmp").exists());

    let mut reopened = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();
    let loaded = reopened.load(now);

    let mut ids: Vec<i32> = loaded.active.iter().map(|s| s.id().get()).collect();
    ids.sort();
    assert_eq!(ids, vec![10, 20]);
    assert_eq!(loaded.legacy_ids, legacy);
    assert_eq!(loaded.allocated.len(), 3);

    let restored = loaded.active.iter().find(|s| s.id() == SessionId(20)).unwrap();
    assert_eq!(restored.state(), SessionState::Sealed);
    assert!(restored.is_sealed_durably());
    assert_eq!(
        restored.params().app_package_name.as_deref(),
        Some("com.example.app")
    );
}

#[test]
fn test_finished_sessions_are_not_written() {
    let dir = tempdir().unwrap();
    let now = Utc::now();
    let mut store = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();

    let mut done = session_at(5, now);
    done.finish(true, None);
    store.save(&[done, session_at(6, now)], &BTreeSet::new()).unwrap();

    let loaded = store.load(now);
    assert_eq!(loaded.active.len(), 1);
    assert_eq!(loaded.active[0].id(), SessionId(6));
}

#[test]
fn test_bad_entry_is_skipped_but_id_stays_allocated() {
    let dir = tempdir().unwrap();
    let now = Utc::now();
    let mut store = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();
    store.save(&[session_at(1, now)], &BTreeSet::new()).unwrap();

    let path = store.document_path();
    let mut document: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    document["sessions"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({ "session_id": 2, "user_id": "not-a-number" }));
    fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();

    let loaded = store.load(now);
    assert_eq!(loaded.active.len(), 1);
    assert_eq!(loaded.skipped, 1);
    assert!(loaded.allocated.contains(&SessionId(2)));
}

#[test]
fn test_corrupt_document_boots_empty() {
    let dir = tempdir().unwrap();
    let mut store = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();
    fs::write(store.document_path(), "{ this is not json").unwrap();

    let loaded = store.load(Utc::now());
    assert!(loaded.active.is_empty());
    assert!(loaded.allocated.is_empty());
}

#[test]
fn test_sessions_at_max_age_are_expired() {
    let dir = tempdir().unwrap();
    let now = Utc::now();
    let mut store = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();

    let exactly_max = session_at(1, now - max_age());
    let older = session_at(2, now - Duration::days(4));
    let fresh = session_at(3, now - Duration::days(2));
    store.save(&[exactly_max, older, fresh], &BTreeSet::new()).unwrap();

    let loaded = store.load(now);
    assert_eq!(loaded.active.len(), 1);
    assert_eq!(loaded.active[0].id(), SessionId(3));
    assert_eq!(loaded.expired.len(), 2);
    assert_eq!(loaded.allocated.len(), 3);
}

#[test]
fn test_icon_written_once_per_digest() {
    let dir = tempdir().unwrap();
    let now = Utc::now();
    let mut store = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();
    let icon_file = paths::icon_path(dir.path(), 7);

    let session = with_icon(session_at(7, now), b"png-bytes");
    store.save(std::slice::from_ref(&session), &BTreeSet::new()).unwrap();
    assert_eq!(fs::read(&icon_file).unwrap(), b"png-bytes");

    // An identical digest must not rewrite the file.
    fs::write(&icon_file, b"png-bytes").unwrap();
    let before = fs::metadata(&icon_file).unwrap().modified().unwrap();
    store.save(std::slice::from_ref(&session), &BTreeSet::new()).unwrap();
    let after = fs::metadata(&icon_file).unwrap().modified().unwrap();
    assert_eq!(before, after);

    let changed = with_icon(session_at(7, now), b"new-bytes");
    store.save(&[changed], &BTreeSet::new()).unwrap();
    assert_eq!(fs::read(&icon_file).unwrap(), b"new-bytes");
}

#[test]
fn test_icon_round_trips_and_is_removed_with_session() {
    let dir = tempdir().unwrap();
    let now = Utc::now();
    let mut store = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();

    store
        .save(&[with_icon(session_at(8, now), b"icon")], &BTreeSet::new())
        .unwrap();

    let mut reopened = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();
    let loaded = reopened.load(now);
    assert_eq!(loaded.active[0].params().app_icon.as_deref(), Some(&b"icon"[..]));

    reopened.save(&[], &BTreeSet::new()).unwrap();
    assert!(!paths::icon_path(dir.path(), 8).exists());
}

#[test]
fn test_tampered_icon_is_dropped() {
    let dir = tempdir().unwrap();
    let now = Utc::now();
    let mut store = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();
    store
        .save(&[with_icon(session_at(9, now), b"icon")], &BTreeSet::new())
        .unwrap();
    fs::write(paths::icon_path(dir.path(), 9), b"other").unwrap();

    let mut reopened = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();
    let loaded = reopened.load(now);
    assert_eq!(loaded.active.len(), 1);
    assert!(loaded.active[0].params().app_icon.is_none());
}

#[test]
fn test_prune_icons_keeps_live_sessions() {
    let dir = tempdir().unwrap();
    let mut store = PersistenceStore::open(dir.path().to_path_buf(), max_age()).unwrap();
    fs::write(paths::icon_path(dir.path(), 1), b"a").unwrap();
    fs::write(paths::icon_path(dir.path(), 2), b"b").unwrap();
    fs::write(paths::icons_dir(dir.path()).join("notes.txt"), b"c").unwrap();

    let live: HashSet<SessionId> = [SessionId(1)].into_iter().collect();
    assert_eq!(store.prune_icons(&live), 1);

    assert!(paths::icon_path(dir.path(), 1).exists());
    assert!(!paths::icon_path(dir.path(), 2).exists());
    assert!(paths::icons_dir(dir.path()).join("notes.txt").exists());
}

#[test]
fn test_icon_digest_is_sha256_hex() {
    assert_eq!(
        icon_digest(b""),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}
