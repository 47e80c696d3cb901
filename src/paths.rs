//! Home-based storage paths for the install session daemon.
//!
//! Everything lives under `~/.install-sessiond/` unless `INSTALL_SESSIOND_HOME`
//! points elsewhere:
//! - `config.yaml` - Daemon configuration
//! - `state/` - Persisted session document and icon companion directory
//! - `staging/` - Default internal staging root
//! - `sessiond.{pid,sha,port,lock}` - Daemon process files

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// The name of the daemon home directory.
const SESSIOND_DIR: &str = ".install-sessiond";

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "INSTALL_SESSIOND_HOME";

/// File name of the persisted session document.
pub const SESSIONS_FILE: &str = "install_sessions.json";

/// Companion directory holding per-session icon blobs.
pub const ICONS_DIR: &str = "install_sessions";

/// Returns the daemon home directory, creating it if needed.
///
/// # Errors
///
/// Returns an error if:
/// - Home directory cannot be determined
/// - Directory creation fails
pub fn sessiond_home_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(HOME_ENV) {
        Some(custom) => PathBuf::from(custom),
        None => dirs::home_dir()
            .context("Could not determine home directory for daemon state")?
            .join(SESSIOND_DIR),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create daemon directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the default config path: `~/.install-sessiond/config.yaml`
pub fn default_config_path() -> Result<PathBuf> {
    Ok(sessiond_home_dir()?.join("config.yaml"))
}

/// Returns the default state directory: `~/.install-sessiond/state/`
pub fn default_state_dir() -> Result<PathBuf> {
    Ok(sessiond_home_dir()?.join("state"))
}

/// Returns the default internal staging root: `~/.install-sessiond/staging/`
pub fn default_staging_dir() -> Result<PathBuf> {
    Ok(sessiond_home_dir()?.join("staging"))
}

/// Path of the persisted session document inside a state directory.
pub fn sessions_file(state_dir: &Path) -> PathBuf {
    state_dir.join(SESSIONS_FILE)
}

/// Path of the icon companion directory inside a state directory.
pub fn icons_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(ICONS_DIR)
}

/// Path of the icon blob for a session.
pub fn icon_path(state_dir: &Path, session_id: i32) -> PathBuf {
    icons_dir(state_dir).join(format!("app_icon.{}.png", session_id))
}

/// Parses the session id out of an icon file name, if it is one.
pub fn parse_icon_file_name(name: &str) -> Option<i32> {
    name.strip_prefix("app_icon.")?
        .strip_suffix(".png")?
        .parse()
        .ok()
}

/// Lock file guarding a state directory against a second daemon.
pub fn state_lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join("sessiond.lock")
}

/// Returns the daemon PID file path: `~/.install-sessiond/sessiond.pid`
pub fn sessiond_pid_path() -> Result<PathBuf> {
    Ok(sessiond_home_dir()?.join("sessiond.pid"))
}

/// Returns the daemon build SHA file path: `~/.install-sessiond/sessiond.sha`
///
/// Used for version detection when the daemon is unresponsive.
pub fn sessiond_build_sha_path() -> Result<PathBuf> {
    Ok(sessiond_home_dir()?.join("sessiond.sha"))
}

/// Returns the daemon port file path: `~/.install-sessiond/sessiond.port`
///
/// Contains JSON with both port numbers and the authentication token.
pub fn sessiond_port_path() -> Result<PathBuf> {
    Ok(sessiond_home_dir()?.join("sessiond.port"))
}

/// Encodes bytes as lowercase hex string.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
#[path = "tests/paths_tests.rs"]
mod tests;
