//! Synchronous task management (abort, device reset, target reset)
//!
//! Each call submits a management function to the engine and blocks on a
//! completion signal the engine fires when the function has run. The signal
//! is shared between the waiter and the engine-held [`MgmtCompletion`], so a
//! waiter that gives up early never frees state the engine still writes to.

use crate::engine::{MgmtFunction, TargetEngine};
use crate::error::{LoopbackError, LoopbackResult};
use crate::scsi::ScsiLun;
use crate::session::SessionHandle;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Signal {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    fn fire(&self) {
        *self.fired.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }
}

/// How a management call's wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The engine fired the completion
    Completed,
    /// The wait gave up first; the function still runs to completion
    Interrupted,
}

/// Engine-side half of a management request
///
/// Firing consumes it. Dropping it unfired also fires it, so a waiter is
/// never left blocked on a completion the engine threw away.
#[derive(Debug)]
pub struct MgmtCompletion {
    signal: Arc<Signal>,
    fired: bool,
}

impl MgmtCompletion {
    pub fn complete(mut self) {
        self.fired = true;
        self.signal.fire();
    }
}

impl Drop for MgmtCompletion {
    fn drop(&mut self) {
        if !self.fired {
            log::debug!("Management completion dropped without firing");
            self.signal.fire();
        }
    }
}

/// Waiting half of a management request
#[derive(Debug)]
pub struct ManagementRequest {
    signal: Arc<Signal>,
}

impl ManagementRequest {
    pub fn new() -> (ManagementRequest, MgmtCompletion) {
        let signal = Arc::new(Signal::default());
        (
            ManagementRequest {
                signal: Arc::clone(&signal),
            },
            MgmtCompletion {
                signal,
                fired: false,
            },
        )
    }

    /// Block until the completion fires or `timeout` elapses
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut fired = self.signal.fired.lock().unwrap_or_else(PoisonError::into_inner);
        while !*fired {
            match deadline {
                None => {
                    fired = self
                        .signal
                        .cv
                        .wait(fired)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::Interrupted;
                    }
                    fired = self
                        .signal
                        .cv
                        .wait_timeout(fired, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        WaitOutcome::Completed
    }
}

/// Task management counters
#[derive(Debug, Default)]
pub struct Stats {
    aborts: AtomicU64,
    device_resets: AtomicU64,
    target_resets: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub aborts: u64,
    pub device_resets: u64,
    pub target_resets: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            aborts: self.aborts.load(Ordering::Relaxed),
            device_resets: self.device_resets.load(Ordering::Relaxed),
            target_resets: self.target_resets.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Aborts: {}, Device Resets: {}, Target Resets: {}",
            self.aborts, self.device_resets, self.target_resets
        )
    }
}

/// Submits management functions and waits for their completion
pub struct TaskManager {
    engine: Arc<dyn TargetEngine>,
    stats: Stats,
    wait_timeout: Option<Duration>,
}

impl TaskManager {
    pub fn new(engine: Arc<dyn TargetEngine>, wait_timeout: Option<Duration>) -> Self {
        TaskManager {
            engine,
            stats: Stats::default(),
            wait_timeout,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Abort the command carrying `tag`
    pub fn abort(&self, session: &SessionHandle, tag: u64) -> LoopbackResult<WaitOutcome> {
        let result = self.execute(session, MgmtFunction::AbortTask { tag });
        self.stats.aborts.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Reset one logical unit
    pub fn reset_device(&self, session: &SessionHandle, lun: u64) -> LoopbackResult<WaitOutcome> {
        let lun = ScsiLun::from_u64(lun);
        let result = self.execute(session, MgmtFunction::LunReset { lun });
        self.stats.device_resets.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Reset the whole target, addressed through one of its units
    pub fn reset_target(&self, session: &SessionHandle, lun: u64) -> LoopbackResult<WaitOutcome> {
        let lun = ScsiLun::from_u64(lun);
        let result = self.execute(session, MgmtFunction::TargetReset { lun });
        self.stats.target_resets.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn execute(&self, session: &SessionHandle, function: MgmtFunction) -> LoopbackResult<WaitOutcome> {
        if session.is_unregistering() {
            log::warn!("Session {}: refusing {:?}, unregistering", session.number(), function);
            return Err(LoopbackError::SessionUnavailable(session.number()));
        }

        let (request, completion) = ManagementRequest::new();
        self.engine
            .submit_mgmt_fn(session, function, completion)
            .map_err(|e| {
                log::error!("Session {}: {:?} rejected: {}", session.number(), function, e);
                e
            })?;

        let outcome = request.wait(self.wait_timeout);
        match outcome {
            WaitOutcome::Completed => {
                log::debug!("Session {}: {:?} completed", session.number(), function)
            }
            WaitOutcome::Interrupted => log::warn!(
                "Session {}: wait for {:?} interrupted, function still running",
                session.number(),
                function
            ),
        }
        Ok(outcome)
    }
}
