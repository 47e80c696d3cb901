//! State guarded by the registry's table lock.

use crate::allocator::SessionIdAllocator;
use crate::config::RegistryConfig;
use crate::errors::{InstallerError, InstallerResult, QuotaKind};
use crate::reconciler::ClaimedStages;
use crate::session::{HistoricalSession, InstallSession, SessionId, SessionOutcome, StageRef};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// A session whose id and stage are taken but which is not yet published.
#[derive(Debug, Clone)]
pub(crate) struct Reservation {
    pub installer_uid: u32,
    pub stage: StageRef,
}

pub(crate) struct Tables {
    pub allocator: SessionIdAllocator,
    /// Every id ever handed out: active, historical and legacy.
    pub allocated: HashSet<SessionId>,
    pub legacy: BTreeSet<SessionId>,
    pub sessions: BTreeMap<SessionId, InstallSession>,
    pub reserved: HashMap<SessionId, Reservation>,
    pub historical: VecDeque<HistoricalSession>,
    pub historical_by_installer: HashMap<u32, usize>,
    historical_retention: usize,
}

impl Tables {
    pub fn new(allocator: SessionIdAllocator, historical_retention: usize) -> Self {
        Self {
            allocator,
            allocated: HashSet::new(),
            legacy: BTreeSet::new(),
            sessions: BTreeMap::new(),
            reserved: HashMap::new(),
            historical: VecDeque::new(),
            historical_by_installer: HashMap::new(),
            historical_retention,
        }
    }

    /// Mints a fresh id and records it as allocated.
    pub fn allocate_id(&mut self) -> InstallerResult<SessionId> {
        self.allocator.allocate(&mut self.allocated)
    }

    /// Live plus in-flight sessions owned by `uid`.
    pub fn active_count(&self, uid: u32) -> usize {
        let live = self
            .sessions
            .values()
            .filter(|s| s.installer_uid() == uid)
            .count();
        let pending = self
            .reserved
            .values()
            .filter(|r| r.installer_uid == uid)
            .count();
        live + pending
    }

    pub fn historical_count(&self, uid: u32) -> usize {
        self.historical_by_installer.get(&uid).copied().unwrap_or(0)
    }

    pub fn check_quota(&self, uid: u32, config: &RegistryConfig) -> InstallerResult<()> {
        if self.active_count(uid) >= config.max_active_sessions {
            return Err(InstallerError::QuotaExceeded {
                uid,
                kind: QuotaKind::Active,
                limit: config.max_active_sessions,
            });
        }
        if self.historical_count(uid) >= config.max_historical_sessions {
            return Err(InstallerError::QuotaExceeded {
                uid,
                kind: QuotaKind::Historical,
                limit: config.max_historical_sessions,
            });
        }
        Ok(())
    }

    /// Records a session that left the active table.
    pub fn archive(
        &mut self,
        session: &InstallSession,
        outcome: SessionOutcome,
        finished_at: DateTime<Utc>,
    ) {
        *self
            .historical_by_installer
            .entry(session.installer_uid())
            .or_insert(0) += 1;
        self.historical.push_back(HistoricalSession {
            session_id: session.id(),
            installer_uid: session.installer_uid(),
            installer_package: session.installer_package().to_string(),
            user_id: session.user_id(),
            created_at: session.created_at(),
            finished_at,
            outcome,
        });
        while self.historical.len() > self.historical_retention {
            self.historical.pop_front();
        }
    }

    pub fn claimed_stages(&self) -> ClaimedStages {
        let mut claimed = ClaimedStages::default();
        let stages = self
            .sessions
            .values()
            .map(|s| s.stage())
            .chain(self.reserved.values().map(|r| &r.stage));
        for stage in stages {
            match stage {
                StageRef::Directory(path) => {
                    claimed.dirs.insert(path.clone());
                }
                StageRef::Container(token) => {
                    claimed.containers.insert(token.clone());
                }
            }
        }
        claimed
    }

    /// Copies of every session that still belongs in the persisted document.
    pub fn checkpoint_snapshot(&self) -> Vec<InstallSession> {
        self.sessions
            .values()
            .filter(|s| !s.state().is_finished())
            .cloned()
            .collect()
    }
}
