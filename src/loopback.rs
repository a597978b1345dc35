//! The bridge context
//!
//! [`Loopback`] owns the registry, the exit barrier, the AEN dispatcher,
//! the task manager and the command router, and implements the
//! administrative operations on top of them. The engine talks back to the
//! bridge through a [`LoopbackTransport`], which only holds a weak
//! reference so it never keeps a shut-down bridge alive.
//!
//! # Session removal
//!
//! Every removal path sets the session's `unregistering` latch first and
//! then claims the destructive removal with the registry locked, so removal
//! runs exactly once no matter how many paths race for it. Administrative
//! paths remove inline; engine-initiated closes hand the session to a
//! dedicated removal thread because the engine may call in with its own
//! locks held.

use crate::aen::EventDispatcher;
use crate::command::{CommandDone, CommandRouter, QueueDepthReason, ScsiCommand};
use crate::config::LoopbackConfig;
use crate::engine::{Aen, InitiatorHost, TargetEngine};
use crate::error::{LoopbackError, LoopbackResult};
use crate::exit::ExitBarrier;
use crate::registry::{Registry, RegistryState, TargetInfo};
use crate::session::{initiator_port_transport_id, InitiatorPortId, Session, SessionHandle};
use crate::target::{Target, TargetHandle, VersionAttribute, VersionKind};
use crate::task_mgmt::{StatsSnapshot, TaskManager, WaitOutcome};
use crate::VERSION;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};

struct Shared {
    config: LoopbackConfig,
    engine: Arc<dyn TargetEngine>,
    host: Arc<dyn InitiatorHost>,
    exit: ExitBarrier,
    registry: Registry,
    dispatcher: EventDispatcher,
    task_mgmt: TaskManager,
    router: CommandRouter,
    removals: Mutex<Option<Sender<SessionHandle>>>,
    removal_worker: Mutex<Option<JoinHandle<()>>>,
    next_session: AtomicU32,
}

/// Software loopback bridge between an initiator stack and a target engine
pub struct Loopback {
    shared: Arc<Shared>,
}

impl Loopback {
    /// Start the bridge
    ///
    /// Spawns the AEN workers and the session removal thread, then adds the
    /// default target with its default session if the configuration asks
    /// for it. Any failure shuts the partially started bridge down again.
    pub fn start(
        config: LoopbackConfig,
        engine: Arc<dyn TargetEngine>,
        host: Arc<dyn InitiatorHost>,
    ) -> LoopbackResult<Loopback> {
        config.validate()?;

        let dispatcher =
            EventDispatcher::start(config.aen_workers, Arc::clone(&engine), Arc::clone(&host))?;
        let task_mgmt = TaskManager::new(Arc::clone(&engine), config.mgmt_wait_timeout);
        let router = CommandRouter::new(Arc::clone(&engine), config.adapter);

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            config,
            engine,
            host,
            exit: ExitBarrier::new(),
            registry: Registry::new(),
            dispatcher,
            task_mgmt,
            router,
            removals: Mutex::new(Some(tx)),
            removal_worker: Mutex::new(None),
            next_session: AtomicU32::new(1),
        });

        let weak = Arc::downgrade(&shared);
        let worker = thread::Builder::new()
            .name("loopback-remove".to_string())
            .spawn(move || removal_loop(rx, weak));
        match worker {
            Ok(worker) => {
                *shared
                    .removal_worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(worker);
            }
            Err(e) => {
                shared.dispatcher.shutdown();
                return Err(LoopbackError::ResourceExhausted(format!(
                    "unable to spawn removal worker: {}",
                    e
                )));
            }
        }

        let loopback = Loopback { shared };

        if loopback.shared.config.add_default_target {
            let target = loopback.shared.config.default_target_name.clone();
            let session = loopback.shared.config.default_session_name.clone();
            // Dropping `loopback` on error shuts it down
            loopback.add_target_with_sessions(&target, &[session.as_str()])?;
        }

        log::info!("Loopback bridge {} started", VERSION);
        Ok(loopback)
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.shared.config
    }

    /// Callback handle for the target engine
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Version string reported through the driver's version attribute
    pub fn driver_version(&self) -> String {
        VERSION.to_string()
    }

    pub fn add_target(&self, name: &str) -> LoopbackResult<TargetHandle> {
        let _gate = self.shared.exit.enter()?;
        self.shared.add_target(name)
    }

    /// Add a target together with its initial sessions
    ///
    /// If any session cannot be added the target is removed again.
    pub fn add_target_with_sessions(
        &self,
        name: &str,
        initiators: &[&str],
    ) -> LoopbackResult<TargetHandle> {
        let _gate = self.shared.exit.enter()?;
        let target = self.shared.add_target(name)?;
        for initiator in initiators {
            if let Err(e) = self.shared.add_session(name, initiator) {
                log::error!("Unable to add session {} to target {}: {}", initiator, name, e);
                if let Err(remove_err) = self.shared.remove_target(name) {
                    log::error!("Unable to remove target {}: {}", name, remove_err);
                }
                return Err(e);
            }
        }
        Ok(target)
    }

    /// Remove a target after tearing down all of its sessions
    pub fn remove_target(&self, name: &str) -> LoopbackResult<()> {
        let _gate = self.shared.exit.enter()?;
        self.shared.remove_target(name)
    }

    pub fn add_session(&self, target: &str, initiator_name: &str) -> LoopbackResult<SessionHandle> {
        let _gate = self.shared.exit.enter()?;
        self.shared.add_session(target, initiator_name)
    }

    /// Remove the first session of `target` with the given initiator name
    pub fn remove_session(&self, target: &str, initiator_name: &str) -> LoopbackResult<()> {
        let _gate = self.shared.exit.enter()?;
        let mut state = self.shared.registry.lock();
        let session = state.session(target, initiator_name)?;
        self.shared.close_session_locked(&mut state, &session);
        Ok(())
    }

    /// Synchronously tear down a session by handle
    ///
    /// Idempotent: closing a session that is already gone is a no-op.
    pub fn close_session(&self, session: &SessionHandle) -> LoopbackResult<()> {
        let _gate = self.shared.exit.enter()?;
        let mut state = self.shared.registry.lock();
        self.shared.close_session_locked(&mut state, session);
        Ok(())
    }

    pub fn target(&self, name: &str) -> LoopbackResult<TargetHandle> {
        self.shared.registry.lock().target(name)
    }

    pub fn find_session(&self, target: &str, initiator_name: &str) -> LoopbackResult<SessionHandle> {
        self.shared.registry.lock().session(target, initiator_name)
    }

    /// Snapshot of every target and its sessions
    pub fn targets(&self) -> Vec<TargetInfo> {
        self.shared.registry.lock().snapshot()
    }

    pub fn version_descriptor(&self, target: &str, kind: VersionKind) -> LoopbackResult<VersionAttribute> {
        let _gate = self.shared.exit.enter()?;
        let target = self.shared.registry.lock().target(target)?;
        Ok(target.version(kind))
    }

    pub fn set_version_descriptor(&self, target: &str, kind: VersionKind, value: u16) -> LoopbackResult<()> {
        let _gate = self.shared.exit.enter()?;
        let target = self.shared.registry.lock().target(target)?;
        target.set_version(kind, value);
        Ok(())
    }

    pub fn transport_id(&self, target: &str, initiator_name: &str) -> LoopbackResult<Vec<u8>> {
        let _gate = self.shared.exit.enter()?;
        let session = self.shared.registry.lock().session(target, initiator_name)?;
        Ok(session.transport_id())
    }

    /// Override a session's TransportID; an empty value restores the default
    pub fn set_transport_id(&self, target: &str, initiator_name: &str, id: &[u8]) -> LoopbackResult<()> {
        let _gate = self.shared.exit.enter()?;
        let session = self.shared.registry.lock().session(target, initiator_name)?;
        session.set_transport_id(id);
        Ok(())
    }

    /// Submit a command on behalf of the initiator side
    pub fn submit(&self, session: &SessionHandle, command: ScsiCommand, done: CommandDone) -> LoopbackResult<()> {
        self.shared.router.submit(session, command, done)
    }

    pub fn abort(&self, session: &SessionHandle, tag: u64) -> LoopbackResult<WaitOutcome> {
        self.shared.task_mgmt.abort(session, tag)
    }

    pub fn reset_device(&self, session: &SessionHandle, lun: u64) -> LoopbackResult<WaitOutcome> {
        self.shared.task_mgmt.reset_device(session, lun)
    }

    pub fn reset_target(&self, session: &SessionHandle, lun: u64) -> LoopbackResult<WaitOutcome> {
        self.shared.task_mgmt.reset_target(session, lun)
    }

    /// Abort/reset counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.task_mgmt.stats()
    }

    pub fn max_queue_depth(&self, session: &SessionHandle, lun: u64) -> u32 {
        self.shared.router.max_queue_depth(session, lun)
    }

    pub fn configure_device(&self, session: &SessionHandle, lun: u64) -> u32 {
        self.shared.router.configure_device(session, lun)
    }

    pub fn queue_depth(&self, session: &SessionHandle, lun: u64) -> u32 {
        self.shared.router.queue_depth(session, lun)
    }

    pub fn change_queue_depth(
        &self,
        session: &SessionHandle,
        lun: u64,
        depth: u32,
        reason: QueueDepthReason,
    ) -> LoopbackResult<u32> {
        self.shared.router.change_queue_depth(session, lun, depth, reason)
    }

    /// Tear everything down
    ///
    /// Waits for administrative operations already in progress, removes
    /// every target and stops the worker threads. Later calls are no-ops.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.exit.is_closed()
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl Shared {
    fn add_target(&self, name: &str) -> LoopbackResult<TargetHandle> {
        let mut state = self.registry.lock();
        if state.position(name).is_some() {
            return Err(LoopbackError::DuplicateName(name.to_string()));
        }
        state.reserve_target()?;

        let engine_id = self.engine.register_target(name).map_err(|e| {
            log::error!("Unable to register target {}: {}", name, e);
            e
        })?;
        let target = Arc::new(Target::new(name, engine_id));
        state.push_target(Arc::clone(&target));

        log::info!("Target {} added", name);
        Ok(target)
    }

    fn remove_target(&self, name: &str) -> LoopbackResult<()> {
        let mut state = self.registry.lock();
        let index = state
            .position(name)
            .ok_or_else(|| LoopbackError::NotFound(format!("target {}", name)))?;
        self.remove_target_at(&mut state, index);
        Ok(())
    }

    fn remove_target_at(&self, state: &mut RegistryState, index: usize) {
        let sessions = state.entry_at(index).sessions.clone();
        for session in &sessions {
            self.close_session_locked(state, session);
        }

        let entry = state.remove_at(index);
        self.engine.unregister_target(entry.target.engine_id());
        log::info!("Target {} removed", entry.target.name());
    }

    fn add_session(&self, target: &str, initiator_name: &str) -> LoopbackResult<SessionHandle> {
        let mut state = self.registry.lock();
        let index = state
            .position(target)
            .ok_or_else(|| LoopbackError::NotFound(format!("target {}", target)))?;
        let target = Arc::clone(&state.entry_at(index).target);
        state
            .entry_at_mut(index)
            .sessions
            .try_reserve(1)
            .map_err(|e| LoopbackError::ResourceExhausted(format!("session list: {}", e)))?;

        let number = self.next_session.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(number, initiator_name, Arc::clone(&target)));

        self.engine
            .register_session(target.engine_id(), &session)
            .map_err(|e| {
                log::error!("Unable to register session {}: {}", initiator_name, e);
                e
            })?;

        let adapter = match self.host.add_adapter(&session, &self.config.adapter) {
            Ok(adapter) => adapter,
            Err(e) => {
                log::error!("Unable to add adapter for session {}: {}", initiator_name, e);
                session.mark_unregistering();
                self.engine.unregister_session(&session);
                return Err(e);
            }
        };
        session.attach_adapter(adapter);
        state.entry_at_mut(index).sessions.push(Arc::clone(&session));
        drop(state);

        log::info!(
            "Session {} ({}) added to target {} as {}",
            number,
            initiator_name,
            target.name(),
            adapter
        );

        if self.engine.initiator_has_luns(target.engine_id(), initiator_name) {
            if let Some(adapter) = session.adapter() {
                self.host.scan_target(adapter);
            }
        }
        Ok(session)
    }

    /// Mark and, if nobody did yet, remove a session inline
    fn close_session_locked(&self, state: &mut RegistryState, session: &SessionHandle) {
        session.mark_unregistering();
        if session.claim_removal() {
            self.remove_session_locked(state, session);
        }
    }

    /// Destructive removal; runs once per session, registry locked
    fn remove_session_locked(&self, state: &mut RegistryState, session: &SessionHandle) {
        log::info!(
            "Removing session {} ({}) from target {}",
            session.number(),
            session.initiator_name(),
            session.target().name()
        );

        self.dispatcher.cancel_and_drain(session);
        if !state.unlink_session(session) {
            log::debug!("Session {} was not linked", session.number());
        }
        if let Some(adapter) = session.detach_adapter() {
            self.host.remove_adapter(adapter);
        }
        self.engine.unregister_session(session);
    }

    /// Engine-initiated close: mark, then hand removal to the worker
    fn close_session_async(&self, session: &SessionHandle) {
        if !session.mark_unregistering() {
            log::debug!("Session {} already unregistering", session.number());
            return;
        }

        let removals = self.removals.lock().unwrap_or_else(PoisonError::into_inner);
        let queued = match removals.as_ref() {
            Some(tx) => tx.send(Arc::clone(session)).is_ok(),
            None => false,
        };
        if queued {
            log::debug!("Session {} scheduled for removal", session.number());
        } else {
            // Shutdown is removing everything
            log::debug!("Session {} left to shutdown", session.number());
        }
    }

    fn shutdown(&self) {
        let Some(_guard) = self.exit.close() else {
            return;
        };
        log::info!("Shutting down loopback bridge");

        {
            let mut state = self.registry.lock();
            while !state.is_empty() {
                self.remove_target_at(&mut state, 0);
            }
        }

        let tx = self
            .removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx);
        let worker = self
            .removal_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("Session removal worker panicked");
            }
        }

        self.dispatcher.shutdown();
        log::info!("Loopback bridge stopped");
    }
}

fn removal_loop(rx: Receiver<SessionHandle>, shared: Weak<Shared>) {
    while let Ok(session) = rx.recv() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut state = shared.registry.lock();
        if session.claim_removal() {
            shared.remove_session_locked(&mut state, &session);
        }
    }
}

/// Handle through which the target engine calls back into the bridge
#[derive(Clone)]
pub struct LoopbackTransport {
    shared: Weak<Shared>,
}

impl LoopbackTransport {
    /// Report an asynchronous event for a session
    ///
    /// On success the bridge owns the notification and acknowledges it
    /// through [`TargetEngine::aen_done`] exactly once. On error the
    /// engine keeps it.
    pub fn report_aen(&self, session: &SessionHandle, aen: Aen) -> LoopbackResult<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| LoopbackError::NotSupported("bridge stopped".to_string()))?;
        shared.dispatcher.report(session, aen)
    }

    /// Ask for a session to be closed
    ///
    /// Returns immediately; removal happens on the removal thread. Closing
    /// a session that is already closing is a no-op.
    pub fn close_session(&self, session: &SessionHandle) {
        match self.shared.upgrade() {
            Some(shared) => shared.close_session_async(session),
            None => {
                session.mark_unregistering();
            }
        }
    }

    /// Answer the engine's initiator TransportID query
    pub fn transport_id(&self, session: Option<&Session>) -> InitiatorPortId {
        initiator_port_transport_id(session)
    }
}
