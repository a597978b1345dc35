//! Shared fixtures for the integration tests: an in-memory target engine and
//! initiator host that record everything the bridge asks of them.

#![allow(dead_code)]

use once_cell::sync::Lazy;
use scsi_loopback::{
    AdapterId, AdapterLimits, AenHandle, EngineCommand, EngineResponse, EngineTargetId,
    InitiatorHost, LoopbackConfig, LoopbackError, LoopbackResult, MgmtCompletion, MgmtFunction,
    ScsiLun, SessionHandle, TargetEngine,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Test Configuration
// ============================================================================

/// Base configuration: no default target, two AEN workers, bounded
/// management waits so a broken completion path fails instead of hanging
static TEST_CONFIG: Lazy<LoopbackConfig> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
    LoopbackConfig::from_toml_str(
        r#"
        add_default_target = false
        aen_workers = 2
        mgmt_wait_timeout_ms = 5000
        "#,
    )
    .expect("test configuration must parse")
});

pub fn test_config() -> LoopbackConfig {
    TEST_CONFIG.clone()
}

// ============================================================================
// Mock Target Engine
// ============================================================================

#[derive(Default)]
pub struct MockEngine {
    next_target: AtomicU64,
    pub targets: Mutex<Vec<(String, EngineTargetId)>>,
    pub unregistered_targets: Mutex<Vec<EngineTargetId>>,
    pub sessions: Mutex<Vec<u32>>,
    pub unregistered_sessions: Mutex<Vec<u32>>,
    pub acked: Mutex<Vec<AenHandle>>,
    pub commands: Mutex<Vec<EngineCommand>>,
    pub mgmt_calls: Mutex<Vec<MgmtFunction>>,
    pub held_mgmt: Mutex<Vec<MgmtCompletion>>,
    /// Complete commands inline with a GOOD response
    pub auto_complete: AtomicBool,
    /// Keep management completions instead of firing them
    pub hold_mgmt: AtomicBool,
    pub reject_mgmt: AtomicBool,
    pub reject_commands: AtomicBool,
    /// Accept commands and drop them without a response
    pub drop_commands: AtomicBool,
    pub fail_register_session: AtomicBool,
    pub no_luns: AtomicBool,
    pub max_commands: AtomicU32,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        let engine = MockEngine::default();
        engine.max_commands.store(64, Ordering::SeqCst);
        Arc::new(engine)
    }

    pub fn acked(&self) -> Vec<AenHandle> {
        self.acked.lock().unwrap().clone()
    }

    pub fn unregistered_sessions(&self) -> Vec<u32> {
        self.unregistered_sessions.lock().unwrap().clone()
    }

    /// Fire every held management completion
    pub fn release_mgmt(&self) {
        for done in self.held_mgmt.lock().unwrap().drain(..) {
            done.complete();
        }
    }
}

impl TargetEngine for MockEngine {
    fn register_target(&self, name: &str) -> LoopbackResult<EngineTargetId> {
        let mut targets = self.targets.lock().unwrap();
        if targets.iter().any(|(n, _)| n == name) {
            return Err(LoopbackError::DuplicateName(name.to_string()));
        }
        let id = EngineTargetId(self.next_target.fetch_add(1, Ordering::SeqCst) + 1);
        targets.push((name.to_string(), id));
        Ok(id)
    }

    fn unregister_target(&self, target: EngineTargetId) {
        self.targets.lock().unwrap().retain(|(_, id)| *id != target);
        self.unregistered_targets.lock().unwrap().push(target);
    }

    fn register_session(&self, _target: EngineTargetId, session: &SessionHandle) -> LoopbackResult<()> {
        if self.fail_register_session.load(Ordering::SeqCst) {
            return Err(LoopbackError::ResourceExhausted("engine session".to_string()));
        }
        self.sessions.lock().unwrap().push(session.number());
        Ok(())
    }

    fn unregister_session(&self, session: &SessionHandle) {
        self.sessions.lock().unwrap().retain(|n| *n != session.number());
        self.unregistered_sessions.lock().unwrap().push(session.number());
    }

    fn initiator_has_luns(&self, _target: EngineTargetId, _initiator_name: &str) -> bool {
        !self.no_luns.load(Ordering::SeqCst)
    }

    fn submit_command(&self, _session: &SessionHandle, command: EngineCommand) -> LoopbackResult<()> {
        if self.reject_commands.load(Ordering::SeqCst) {
            return Err(LoopbackError::SubmissionFailed("engine busy".to_string()));
        }
        if self.drop_commands.load(Ordering::SeqCst) {
            drop(command);
            return Ok(());
        }
        if self.auto_complete.load(Ordering::SeqCst) {
            let len = command.expected_in_len;
            command.complete(EngineResponse::good(vec![0x5A; len]));
        } else {
            self.commands.lock().unwrap().push(command);
        }
        Ok(())
    }

    fn submit_mgmt_fn(
        &self,
        _session: &SessionHandle,
        function: MgmtFunction,
        done: MgmtCompletion,
    ) -> LoopbackResult<()> {
        if self.reject_mgmt.load(Ordering::SeqCst) {
            return Err(LoopbackError::SubmissionFailed("mgmt queue full".to_string()));
        }
        self.mgmt_calls.lock().unwrap().push(function);
        if self.hold_mgmt.load(Ordering::SeqCst) {
            self.held_mgmt.lock().unwrap().push(done);
        } else {
            done.complete();
        }
        Ok(())
    }

    fn aen_done(&self, aen: AenHandle) {
        self.acked.lock().unwrap().push(aen);
    }

    fn max_lun_commands(&self, _session: &SessionHandle, _lun: ScsiLun) -> u32 {
        self.max_commands.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Mock Initiator Host
// ============================================================================

#[derive(Default)]
pub struct MockHost {
    next_adapter: AtomicU32,
    pub adapters: Mutex<Vec<AdapterId>>,
    pub removed: Mutex<Vec<AdapterId>>,
    pub scans: Mutex<Vec<AdapterId>>,
    pub limits: Mutex<Option<AdapterLimits>>,
    pub fail_add: AtomicBool,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(MockHost::default())
    }

    pub fn scans(&self) -> Vec<AdapterId> {
        self.scans.lock().unwrap().clone()
    }

    pub fn live_adapters(&self) -> Vec<AdapterId> {
        self.adapters.lock().unwrap().clone()
    }
}

impl InitiatorHost for MockHost {
    fn add_adapter(&self, _session: &SessionHandle, limits: &AdapterLimits) -> LoopbackResult<AdapterId> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(LoopbackError::ResourceExhausted("adapter".to_string()));
        }
        *self.limits.lock().unwrap() = Some(*limits);
        let id = AdapterId(self.next_adapter.fetch_add(1, Ordering::SeqCst));
        self.adapters.lock().unwrap().push(id);
        Ok(id)
    }

    fn remove_adapter(&self, adapter: AdapterId) {
        self.adapters.lock().unwrap().retain(|a| *a != adapter);
        self.removed.lock().unwrap().push(adapter);
    }

    fn scan_target(&self, adapter: AdapterId) {
        self.scans.lock().unwrap().push(adapter);
    }
}
