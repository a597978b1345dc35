//! Process-wide target/session registry
//!
//! One mutex guards the ordered list of targets and each target's ordered
//! list of sessions. Lock order is exit barrier, then this mutex, then a
//! session's own locks.

use crate::engine::AdapterId;
use crate::error::{LoopbackError, LoopbackResult};
use crate::session::SessionHandle;
use crate::target::TargetHandle;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A target and the sessions it owns, in insertion order
#[derive(Debug)]
pub(crate) struct TargetEntry {
    pub(crate) target: TargetHandle,
    pub(crate) sessions: Vec<SessionHandle>,
}

/// State behind the registry mutex
#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    targets: Vec<TargetEntry>,
}

#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

/// Snapshot of one target for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub name: String,
    pub sessions: Vec<SessionInfo>,
}

/// Snapshot of one session for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub number: u32,
    pub initiator_name: String,
    pub adapter: Option<AdapterId>,
    pub unregistering: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegistryState {
    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.targets.iter().position(|entry| entry.target.name() == name)
    }

    pub(crate) fn entry(&self, name: &str) -> LoopbackResult<&TargetEntry> {
        self.targets
            .iter()
            .find(|entry| entry.target.name() == name)
            .ok_or_else(|| LoopbackError::NotFound(format!("target {}", name)))
    }

    pub(crate) fn entry_at(&self, index: usize) -> &TargetEntry {
        &self.targets[index]
    }

    pub(crate) fn entry_at_mut(&mut self, index: usize) -> &mut TargetEntry {
        &mut self.targets[index]
    }

    pub(crate) fn target(&self, name: &str) -> LoopbackResult<TargetHandle> {
        self.entry(name).map(|entry| Arc::clone(&entry.target))
    }

    /// First session of `target` with the given initiator name
    pub(crate) fn session(&self, target: &str, initiator_name: &str) -> LoopbackResult<SessionHandle> {
        self.entry(target)?
            .sessions
            .iter()
            .find(|session| session.initiator_name() == initiator_name)
            .cloned()
            .ok_or_else(|| {
                LoopbackError::NotFound(format!("session {} (target {})", initiator_name, target))
            })
    }

    /// Make room for one more target without aborting on allocation failure
    pub(crate) fn reserve_target(&mut self) -> LoopbackResult<()> {
        self.targets.try_reserve(1).map_err(|e| {
            LoopbackError::ResourceExhausted(format!("target list: {}", e))
        })
    }

    pub(crate) fn push_target(&mut self, target: TargetHandle) {
        self.targets.push(TargetEntry {
            target,
            sessions: Vec::new(),
        });
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> TargetEntry {
        self.targets.remove(index)
    }

    /// Unlink a session from its target's list
    pub(crate) fn unlink_session(&mut self, session: &SessionHandle) -> bool {
        let Some(index) = self.position(session.target().name()) else {
            return false;
        };
        let sessions = &mut self.targets[index].sessions;
        let before = sessions.len();
        sessions.retain(|s| !Arc::ptr_eq(s, session));
        sessions.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<TargetInfo> {
        self.targets
            .iter()
            .map(|entry| TargetInfo {
                name: entry.target.name().to_string(),
                sessions: entry
                    .sessions
                    .iter()
                    .map(|session| SessionInfo {
                        number: session.number(),
                        initiator_name: session.initiator_name().to_string(),
                        adapter: session.adapter(),
                        unregistering: session.is_unregistering(),
                    })
                    .collect(),
            })
            .collect()
    }
}
