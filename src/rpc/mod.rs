//! RPC surface for the install session daemon.
//!
//! Two localhost TCP listeners share one auth token:
//! - the installer port serves `InstallerService` to installers and tools
//! - the observer port accepts observers, and the daemon then calls into the
//!   `ObserverCallback` server each observer runs on its end

pub mod client;
pub mod observer;
pub mod server;
pub mod service;
pub mod subscription;

use serde::{Deserialize, Serialize};

/// Contents of the daemon port file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFileContent {
    pub port: u16,
    pub subscriber_port: u16,
    pub token: String,
}

/// Identity and load of a running daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub build_sha: String,
    pub build_timestamp: u64,
    pub pid: u32,
    pub active_sessions: usize,
    pub allocated_ids: usize,
    pub observers: usize,
}

#[cfg(test)]
#[path = "tests/mod.rs"]
mod tests;
