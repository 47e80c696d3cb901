//! Seams to the collaborators the registry drives but does not implement.
//!
//! `InstallPolicy` is the yes/no gate consulted before a session is created.
//! `InstallEngine` validates and commits a sealed session's staged payload.

use crate::session::{CallerIdentity, SessionId, SessionParams, StageRef, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;

/// Exit code a commit command uses to ask for a user decision.
pub const EXIT_PENDING_USER_ACTION: i32 = 3;

/// What the policy gate sees for a create request.
#[derive(Debug, Clone)]
pub struct PolicyRequest {
    pub caller: CallerIdentity,
    pub installer_package: String,
    pub user_id: UserId,
    pub params: SessionParams,
}

#[async_trait]
pub trait InstallPolicy: Send + Sync {
    async fn allow_create(&self, request: &PolicyRequest) -> bool;
}

/// Policy that admits every request.
pub struct AllowAllPolicy;

#[async_trait]
impl InstallPolicy for AllowAllPolicy {
    async fn allow_create(&self, _request: &PolicyRequest) -> bool {
        true
    }
}

/// Work handed to the engine when a session commits.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub installer_package: String,
    pub stage: StageRef,
    /// Filesystem location of the stage, when it has one.
    pub stage_path: Option<PathBuf>,
    pub params: SessionParams,
    /// The user already accepted the permissions prompt.
    pub permissions_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    Installed,
    Failed(String),
    /// The engine needs a permissions decision before it can continue.
    PendingUserAction,
}

#[async_trait]
pub trait InstallEngine: Send + Sync {
    async fn commit(&self, request: CommitRequest) -> CommitOutcome;
}

/// Engine that shells out to a configured command.
///
/// The stage path (or container token) and the session id are appended to the
/// configured arguments. Exit 0 installs, exit 3 asks for user action, any
/// other status fails the session with the command's stderr.
pub struct CommandEngine {
    command: Vec<String>,
}

impl CommandEngine {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl InstallEngine for CommandEngine {
    async fn commit(&self, request: CommitRequest) -> CommitOutcome {
        let Some((program, args)) = self.command.split_first() else {
            return CommitOutcome::Failed("No commit command configured".to_string());
        };

        let stage_arg = match (&request.stage_path, &request.stage) {
            (Some(path), _) => path.display().to_string(),
            (None, StageRef::Container(token)) => token.clone(),
            (None, StageRef::Directory(path)) => path.display().to_string(),
        };

        let output = tokio::process::Command::new(program)
            .args(args)
            .arg(stage_arg)
            .arg(request.session_id.to_string())
            .env(
                "INSTALL_SESSIOND_PERMISSIONS_GRANTED",
                if request.permissions_granted { "1" } else { "0" },
            )
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => CommitOutcome::Installed,
            Ok(output) if output.status.code() == Some(EXIT_PENDING_USER_ACTION) => {
                CommitOutcome::PendingUserAction
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let message = if stderr.is_empty() {
                    format!("Commit command exited with {}", output.status)
                } else {
                    stderr
                };
                CommitOutcome::Failed(message)
            }
            Err(e) => {
                tracing::error!(program = %program, error = %e, "Failed to run commit command");
                CommitOutcome::Failed(format!("Failed to run {}: {}", program, e))
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
