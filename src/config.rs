use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Overrides `registry.max_session_age_secs` when set.
pub const MAX_AGE_ENV: &str = "INSTALL_SESSIOND_MAX_AGE_SECS";

/// Top-level daemon configuration, loaded from YAML.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Directory holding the session document and icon blobs.
    /// Defaults to `~/.install-sessiond/state`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub volumes: VolumesConfig,
    #[serde(default)]
    pub observers: ObserverConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Ceilings and identity rules enforced by the session registry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RegistryConfig {
    /// Active sessions allowed per installer uid. Default: 1024
    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,
    /// Historical sessions allowed per installer uid. Default: 1048576
    #[serde(default = "default_max_historical_sessions")]
    pub max_historical_sessions: usize,
    /// Persisted sessions at or over this age are discarded on load. Default: 3 days
    #[serde(default = "default_max_session_age_secs")]
    pub max_session_age_secs: u64,
    /// Historical summaries kept in memory for dumps and queries. Default: 512
    #[serde(default = "default_historical_retention")]
    pub historical_retention: usize,
    /// Uids treated as privileged (may act on any session).
    #[serde(default = "default_privileged_uids")]
    pub privileged_uids: Vec<u32>,
    /// Uids whose sessions are flagged as coming from a debug bridge.
    #[serde(default = "default_adb_uids")]
    pub adb_uids: Vec<u32>,
    /// Largest icon accepted on create or update, in bytes. Default: 1 MiB
    #[serde(default = "default_max_icon_bytes")]
    pub max_icon_bytes: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: default_max_active_sessions(),
            max_historical_sessions: default_max_historical_sessions(),
            max_session_age_secs: default_max_session_age_secs(),
            historical_retention: default_historical_retention(),
            privileged_uids: default_privileged_uids(),
            adb_uids: default_adb_uids(),
            max_icon_bytes: default_max_icon_bytes(),
        }
    }
}

impl RegistryConfig {
    pub fn is_privileged(&self, uid: u32) -> bool {
        self.privileged_uids.contains(&uid)
    }

    pub fn is_adb(&self, uid: u32) -> bool {
        self.adb_uids.contains(&uid)
    }

    pub fn max_session_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.max_session_age_secs).unwrap_or(i64::MAX))
    }
}

fn default_max_active_sessions() -> usize {
    1024
}

fn default_max_historical_sessions() -> usize {
    1_048_576
}

fn default_max_session_age_secs() -> u64 {
    3 * 24 * 60 * 60
}

fn default_historical_retention() -> usize {
    512
}

fn default_privileged_uids() -> Vec<u32> {
    vec![0, 1000]
}

fn default_adb_uids() -> Vec<u32> {
    vec![0, 2000]
}

fn default_max_icon_bytes() -> usize {
    1024 * 1024
}

/// Staging roots the reconciler sweeps.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct VolumesConfig {
    /// Internal staging root. Defaults to `~/.install-sessiond/staging`.
    #[serde(default)]
    pub internal: Option<PathBuf>,
    /// Adopted volumes keyed by uuid, each pointing at its staging root.
    #[serde(default)]
    pub adopted: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ObserverConfig {
    /// Upper bound on a single observer delivery. Default: 5000ms
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

fn default_delivery_timeout_ms() -> u64 {
    5000
}

/// External command that validates and commits a sealed session.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct EngineConfig {
    /// Program followed by its arguments. The stage path and session id are appended.
    #[serde(default)]
    pub commit_command: Vec<String>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var(MAX_AGE_ENV) {
            self.registry.max_session_age_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", MAX_AGE_ENV, raw))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.registry.max_active_sessions == 0 {
            anyhow::bail!("registry.max_active_sessions must be at least 1");
        }
        if self.registry.max_historical_sessions < self.registry.max_active_sessions {
            anyhow::bail!("registry.max_historical_sessions must not be below max_active_sessions");
        }
        if self.observers.delivery_timeout_ms == 0 {
            anyhow::bail!("observers.delivery_timeout_ms must be positive");
        }
        for (uuid, root) in &self.volumes.adopted {
            if uuid.is_empty() {
                anyhow::bail!("Adopted volume with root {} has an empty uuid", root.display());
            }
        }
        Ok(())
    }

    /// Resolved state directory.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::default_state_dir(),
        }
    }

    /// Resolved internal staging root.
    pub fn internal_staging_dir(&self) -> Result<PathBuf> {
        match &self.volumes.internal {
            Some(dir) => Ok(dir.clone()),
            None => paths::default_staging_dir(),
        }
    }

    pub fn delivery_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.observers.delivery_timeout_ms)
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
