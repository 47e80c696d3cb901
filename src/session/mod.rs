//! Session model: identifiers, parameters, lifecycle and persisted form.

pub mod install_session;
pub mod record;
pub mod types;

pub use install_session::{InstallSession, PermissionsFollowup};
pub use record::PersistedSession;
pub use types::{
    CallerIdentity, HistoricalSession, InstallFlags, InstallMode, SessionId, SessionInfo,
    SessionOutcome, SessionParams, SessionState, StageRef, UserId,
};

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
