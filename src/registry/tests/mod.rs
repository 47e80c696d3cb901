//! Shared fixtures for the registry tests.


use super::*;
use crate::callbacks::SessionEvent;
use crate::engine::{CommitOutcome, CommitRequest};
use crate::errors::DeliveryError;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

pub(super) const INSTALLER_UID: u32 = 10_001;
pub(super) const OTHER_UID: u32 = 10_002;
pub(super) const SYSTEM_UID: u32 = 1000;
pub(super) const ADOPTED_VOLUME: &str = "3f1c-8a2b";

#[derive(Default)]
pub(super) struct RecordingObserver {
    events: std::sync::Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    pub fn kinds(&self) -> Vec<SessionEventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }

    pub fn kinds_for(&self, id: SessionId) -> Vec<SessionEventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.session_id == id)
            .map(|e| e.kind.clone())
            .collect()
    }
}

#[async_trait]
impl SessionObserver for RecordingObserver {
    async fn on_session_event(&self, event: &SessionEvent) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Engine that replays queued outcomes and records what it was asked.
#[derive(Default)]
pub(super) struct ScriptedEngine {
    outcomes: std::sync::Mutex<VecDeque<CommitOutcome>>,
    requests: std::sync::Mutex<Vec<CommitRequest>>,
}

impl ScriptedEngine {
    pub fn push(&self, outcome: CommitOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn requests(&self) -> Vec<CommitRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstallEngine for ScriptedEngine {
    async fn commit(&self, request: CommitRequest) -> CommitOutcome {
        self.requests.lock().unwrap().push(request);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CommitOutcome::Installed)
    }
}

/// Engine that holds every commit until released.
#[derive(Default)]
pub(super) struct GatedEngine {
    gate: tokio::sync::Notify,
}

impl GatedEngine {
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl InstallEngine for GatedEngine {
    async fn commit(&self, _request: CommitRequest) -> CommitOutcome {
        self.gate.notified().await;
        CommitOutcome::Installed
    }
}

/// Policy that admits every request after yielding, so concurrent creates
/// interleave between the quota precheck and allocation.
pub(super) struct YieldingPolicy;

#[async_trait]
impl InstallPolicy for YieldingPolicy {
    async fn allow_create(&self, _request: &PolicyRequest) -> bool {
        tokio::time::sleep(Duration::from_millis(10)).await;
        true
    }
}

pub(super) struct DenyAllPolicy;

#[async_trait]
impl InstallPolicy for DenyAllPolicy {
    async fn allow_create(&self, _request: &PolicyRequest) -> bool {
        false
    }
}

pub(super) struct Harness {
    pub dir: TempDir,
    pub registry: SessionRegistry,
    pub engine: Arc<ScriptedEngine>,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(RegistryConfig::default()).await
    }

    pub async fn with_config(config: RegistryConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::boot_in(dir, config, Arc::new(crate::engine::AllowAllPolicy)).await
    }

    pub async fn boot_in(
        dir: TempDir,
        config: RegistryConfig,
        policy: Arc<dyn InstallPolicy>,
    ) -> Self {
        let engine = Arc::new(ScriptedEngine::default());
        let registry = boot_registry(dir.path(), config, policy, engine.clone());
        let observer = Arc::new(RecordingObserver::default());
        registry.register_observer(observer.clone(), 0).await;
        Self {
            dir,
            registry,
            engine,
            observer,
        }
    }

    /// Shuts the registry down and boots a fresh one over the same state.
    pub async fn restart(self, config: RegistryConfig) -> Self {
        self.registry.shutdown().await.unwrap();
        let Harness { dir, registry, .. } = self;
        drop(registry);
        Self::boot_in(dir, config, Arc::new(crate::engine::AllowAllPolicy)).await
    }

    pub fn staging_root(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    pub fn adopted_root(&self) -> PathBuf {
        self.dir.path().join("adopted")
    }

    pub async fn create(&self, uid: u32, package: &str) -> SessionId {
        self.registry
            .create_session(
                CallerIdentity::new(uid),
                package.to_string(),
                0,
                SessionParams::default(),
            )
            .await
            .unwrap()
    }

    pub fn stage_of(&self, id: SessionId) -> StageRef {
        self.registry
            .shared
            .lock_tables()
            .sessions
            .get(&id)
            .unwrap()
            .stage()
            .clone()
    }

    pub fn flags_of(&self, id: SessionId) -> InstallFlags {
        self.registry
            .shared
            .lock_tables()
            .sessions
            .get(&id)
            .unwrap()
            .params()
            .install_flags
    }

    /// Flushes until the history reaches `len` entries or a few seconds pass.
    pub async fn wait_for_history(&self, len: usize) -> Vec<HistoricalSession> {
        for _ in 0..100 {
            self.registry.flush().await;
            let history = self.registry.historical_sessions();
            if history.len() >= len {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.registry.historical_sessions()
    }
}

pub(super) fn boot_registry(
    state: &Path,
    config: RegistryConfig,
    policy: Arc<dyn InstallPolicy>,
    engine: Arc<dyn InstallEngine>,
) -> SessionRegistry {
    let store = PersistenceStore::open(state.join("state"), config.max_session_age()).unwrap();
    let adopted: BTreeMap<String, PathBuf> =
        [(ADOPTED_VOLUME.to_string(), state.join("adopted"))]
            .into_iter()
            .collect();
    let stages = StageReconciler::new(state.join("staging"), adopted);
    SessionRegistry::boot(
        config,
        RegistryDeps {
            store,
            stages,
            bus: CallbackBus::new(Duration::from_secs(1)),
            policy,
            engine,
        },
    )
}
