//! Exit barrier separating administrative operations from shutdown
//!
//! Administrative and attribute operations enter the barrier as readers and
//! never block on it: once shutdown holds (or waits for) the writer side they
//! fail with [`LoopbackError::ShuttingDown`]. Shutdown takes the writer side,
//! which waits for every reader already past the gate, and leaves the
//! barrier permanently closed.

use crate::error::{LoopbackError, LoopbackResult};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

#[derive(Debug, Default)]
pub struct ExitBarrier {
    /// `true` once shutdown has run
    closed: RwLock<bool>,
}

/// Held by an administrative operation for its whole duration
pub struct ExitReadGuard<'a> {
    _guard: RwLockReadGuard<'a, bool>,
}

/// Held by shutdown while it tears everything down
pub struct ExitWriteGuard<'a> {
    _guard: RwLockWriteGuard<'a, bool>,
}

impl ExitBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter as a reader without blocking
    pub fn enter(&self) -> LoopbackResult<ExitReadGuard<'_>> {
        let guard = match self.closed.try_read() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(LoopbackError::ShuttingDown),
            Err(TryLockError::Poisoned(poison)) => poison.into_inner(),
        };
        if *guard {
            return Err(LoopbackError::ShuttingDown);
        }
        Ok(ExitReadGuard { _guard: guard })
    }

    /// Take the writer side, waiting for in-flight readers to leave
    ///
    /// Returns `None` if the barrier was already closed by an earlier
    /// shutdown.
    pub fn close(&self) -> Option<ExitWriteGuard<'_>> {
        let mut guard = self.closed.write().unwrap_or_else(PoisonError::into_inner);
        if *guard {
            return None;
        }
        *guard = true;
        Some(ExitWriteGuard { _guard: guard })
    }

    pub fn is_closed(&self) -> bool {
        match self.closed.try_read() {
            Ok(guard) => *guard,
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(poison)) => *poison.into_inner(),
        }
    }
}
