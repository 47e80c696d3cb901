//! Value types shared by the registry, the store and the RPC surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Target user of a session.
pub type UserId = u32;

/// Installer session identifier, always in `1..=i32::MAX - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i32);

impl SessionId {
    pub fn get(self) -> i32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0 && self.0 < i32::MAX
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the process calling into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub uid: u32,
}

impl CallerIdentity {
    pub fn new(uid: u32) -> Self {
        Self { uid }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// Replace the whole app with the staged contents
    #[default]
    FullInstall,
    /// Keep existing splits that are not replaced by the staged contents
    InheritExisting,
}

/// Install flag bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct InstallFlags(pub u32);

impl InstallFlags {
    pub const FORWARD_LOCK: InstallFlags = InstallFlags(0x0000_0001);
    pub const REPLACE_EXISTING: InstallFlags = InstallFlags(0x0000_0002);
    pub const ALLOW_TEST: InstallFlags = InstallFlags(0x0000_0004);
    pub const EXTERNAL: InstallFlags = InstallFlags(0x0000_0008);
    pub const INTERNAL: InstallFlags = InstallFlags(0x0000_0010);
    pub const FROM_ADB: InstallFlags = InstallFlags(0x0000_0020);
    pub const ALL_USERS: InstallFlags = InstallFlags(0x0000_0040);
    pub const GRANT_RUNTIME_PERMISSIONS: InstallFlags = InstallFlags(0x0000_0100);
    pub const FORCE_VOLUME_UUID: InstallFlags = InstallFlags(0x0000_0200);
    pub const INSTANT_APP: InstallFlags = InstallFlags(0x0000_0800);
    pub const VIRTUAL_PRELOAD: InstallFlags = InstallFlags(0x0001_0000);

    pub fn empty() -> Self {
        InstallFlags(0)
    }

    pub fn contains(self, other: InstallFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: InstallFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: InstallFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for InstallFlags {
    type Output = InstallFlags;

    fn bitor(self, rhs: InstallFlags) -> InstallFlags {
        InstallFlags(self.0 | rhs.0)
    }
}

/// Parameters supplied by the installer when creating a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionParams {
    pub mode: InstallMode,
    pub install_flags: InstallFlags,
    /// Estimated size of the staged payload, `-1` when unknown.
    pub size_bytes: i64,
    pub app_package_name: Option<String>,
    pub app_label: Option<String>,
    pub app_icon: Option<Vec<u8>>,
    /// Target volume, `None` for internal storage.
    pub volume_uuid: Option<String>,
}

/// Where a session's payload is staged. Exactly one per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRef {
    Directory(PathBuf),
    Container(String),
}

impl std::fmt::Display for StageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageRef::Directory(path) => write!(f, "dir:{}", path.display()),
            StageRef::Container(token) => write!(f, "cid:{}", token),
        }
    }
}

/// Lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Sealed,
    Active,
    Finished { success: bool },
}

impl SessionState {
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Finished { .. })
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Open => write!(f, "OPEN"),
            SessionState::Sealed => write!(f, "SEALED"),
            SessionState::Active => write!(f, "ACTIVE"),
            SessionState::Finished { success: true } => write!(f, "FINISHED(success)"),
            SessionState::Finished { success: false } => write!(f, "FINISHED(failure)"),
        }
    }
}

/// Read-only snapshot of a live session handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub installer_uid: u32,
    pub installer_package: String,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub mode: InstallMode,
    pub size_bytes: i64,
    pub app_package_name: Option<String>,
    pub app_label: Option<String>,
    /// Only populated for single-session lookups.
    pub app_icon: Option<Vec<u8>>,
    pub volume_uuid: Option<String>,
    pub progress: f32,
    /// At least one handle is open on the session.
    pub active: bool,
}

/// How a session left the active table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Installed,
    Failed { message: String },
    Abandoned,
    /// Discarded on reload for being older than the maximum age
    Expired,
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOutcome::Installed => write!(f, "installed"),
            SessionOutcome::Failed { message } => write!(f, "failed ({})", message),
            SessionOutcome::Abandoned => write!(f, "abandoned"),
            SessionOutcome::Expired => write!(f, "expired"),
        }
    }
}

/// Summary kept after a session is torn down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSession {
    pub session_id: SessionId,
    pub installer_uid: u32,
    pub installer_package: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: SessionOutcome,
}
