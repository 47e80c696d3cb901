//! Error types surfaced by the session core.
//!
//! `InstallerError` crosses the RPC boundary, so it stays a plain serializable
//! enum rather than wrapping foreign error types.

use serde::{Deserialize, Serialize};

/// Which quota ceiling was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaKind {
    Active,
    Historical,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaKind::Active => write!(f, "active"),
            QuotaKind::Historical => write!(f, "historical"),
        }
    }
}

/// Errors returned by session registry operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstallerError {
    /// Caller is neither the owner nor privileged
    AuthorizationDenied { uid: u32, session_id: Option<i32> },
    /// Installer reached its active or historical ceiling
    QuotaExceeded {
        uid: u32,
        kind: QuotaKind,
        limit: usize,
    },
    /// Random probing failed to find a free id
    AllocationExhausted { attempts: u32 },
    /// No live session with this id
    SessionNotFound { session_id: i32 },
    /// Request parameters rejected during sanitization
    InvalidRequest { message: String },
    /// Operation not valid in the session's current state
    InvalidState { session_id: i32, message: String },
    /// Staging or other local I/O failed
    Io { message: String },
    /// Durable checkpoint failed where durability was required
    PersistenceWrite { message: String },
    /// Authentication failed (RPC only)
    AuthenticationFailed,
    /// Daemon is shutting down
    ShuttingDown,
}

impl std::fmt::Display for InstallerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallerError::AuthorizationDenied { uid, session_id } => match session_id {
                Some(id) => write!(f, "Caller {} does not own session {}", uid, id),
                None => write!(f, "Caller {} is not allowed to perform this operation", uid),
            },
            InstallerError::QuotaExceeded { uid, kind, limit } => {
                write!(f, "Too many {} sessions for uid {} (limit {})", kind, uid, limit)
            }
            InstallerError::AllocationExhausted { attempts } => {
                write!(f, "Failed to allocate session id after {} attempts", attempts)
            }
            InstallerError::SessionNotFound { session_id } => {
                write!(f, "Session not found: {}", session_id)
            }
            InstallerError::InvalidRequest { message } => write!(f, "Invalid request: {}", message),
            InstallerError::InvalidState {
                session_id,
                message,
            } => write!(f, "Session {}: {}", session_id, message),
            InstallerError::Io { message } => write!(f, "I/O failure: {}", message),
            InstallerError::PersistenceWrite { message } => {
                write!(f, "Failed to persist sessions: {}", message)
            }
            InstallerError::AuthenticationFailed => write!(f, "Authentication failed"),
            InstallerError::ShuttingDown => write!(f, "Daemon is shutting down"),
        }
    }
}

impl std::error::Error for InstallerError {}

/// Result type for registry operations.
pub type InstallerResult<T> = Result<T, InstallerError>;

/// Failures reading or writing the persisted session document.
#[derive(Debug)]
pub enum PersistenceError {
    /// The document exists but could not be read or parsed
    Read {
        path: std::path::PathBuf,
        message: String,
    },
    /// A checkpoint write failed
    Write {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    /// Serializing the snapshot failed
    Encode(serde_json::Error),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Read { path, message } => {
                write!(f, "Failed to read {}: {}", path.display(), message)
            }
            PersistenceError::Write { path, source } => {
                write!(f, "Failed to write {}: {}", path.display(), source)
            }
            PersistenceError::Encode(e) => write!(f, "Failed to encode sessions: {}", e),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistenceError::Read { .. } => None,
            PersistenceError::Write { source, .. } => Some(source),
            PersistenceError::Encode(e) => Some(e),
        }
    }
}

impl From<PersistenceError> for InstallerError {
    fn from(err: PersistenceError) -> Self {
        InstallerError::PersistenceWrite {
            message: err.to_string(),
        }
    }
}

/// An observer failed to accept an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Transport to the observer is gone
    Disconnected(String),
    /// Observer did not answer within the delivery timeout
    TimedOut,
    /// Observer answered with a failure
    Rejected(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Disconnected(reason) => write!(f, "Observer disconnected: {}", reason),
            DeliveryError::TimedOut => write!(f, "Observer delivery timed out"),
            DeliveryError::Rejected(reason) => write!(f, "Observer rejected event: {}", reason),
        }
    }
}

impl std::error::Error for DeliveryError {}
