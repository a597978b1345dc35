//! Collaborator interfaces on both sides of the bridge
//!
//! [`TargetEngine`] is the SCSI target-mode engine the bridge feeds commands
//! into. [`InitiatorHost`] is the initiator-side stack that sees one adapter
//! per session. Both are implemented outside this crate; the bridge only
//! holds them behind `Arc<dyn ...>`.
//!
//! Calls the engine makes back into the bridge (AEN reports, session close
//! requests) go through [`LoopbackTransport`](crate::LoopbackTransport);
//! command and management completions go through the [`EngineCommand`] and
//! [`MgmtCompletion`] objects handed to the engine.

use crate::command::EngineCommand;
use crate::config::AdapterLimits;
use crate::error::LoopbackResult;
use crate::scsi::ScsiLun;
use crate::session::SessionHandle;
use crate::task_mgmt::MgmtCompletion;
use std::fmt;

/// Engine-side identity of a registered target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineTargetId(pub u64);

/// Initiator-side identity of a session's adapter (its host number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterId(pub u32);

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host{}", self.0)
    }
}

/// Opaque engine notification handle, returned through
/// [`TargetEngine::aen_done`] once the notification has been consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AenHandle(pub u64);

/// Kind of an asynchronous event notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AenKind {
    /// SCSI event (e.g. "reported LUNs data has changed"); handled by rescanning
    Scsi,
    /// Anything else; refused with `NotSupported`
    Other(u32),
}

/// Asynchronous event notification reported by the engine for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aen {
    pub kind: AenKind,
    pub handle: AenHandle,
}

impl Aen {
    pub fn scsi(handle: AenHandle) -> Self {
        Aen {
            kind: AenKind::Scsi,
            handle,
        }
    }
}

/// Task management function submitted to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtFunction {
    AbortTask { tag: u64 },
    LunReset { lun: ScsiLun },
    TargetReset { lun: ScsiLun },
}

/// SCSI target-mode engine
pub trait TargetEngine: Send + Sync {
    /// Register a target; a clashing name fails with `DuplicateName`
    fn register_target(&self, name: &str) -> LoopbackResult<EngineTargetId>;

    fn unregister_target(&self, target: EngineTargetId);

    /// Register a session as a new initiator of `target`
    ///
    /// The engine may keep the handle for as long as it needs the session;
    /// it is released by [`unregister_session`](Self::unregister_session).
    fn register_session(&self, target: EngineTargetId, session: &SessionHandle) -> LoopbackResult<()>;

    /// Drop every engine reference to the session
    fn unregister_session(&self, session: &SessionHandle);

    /// Whether the initiator has any LUN mapped on the target
    fn initiator_has_luns(&self, _target: EngineTargetId, _initiator_name: &str) -> bool {
        true
    }

    /// Accept a command for asynchronous processing
    ///
    /// The engine finishes it by calling [`EngineCommand::complete`]
    /// exactly once. A rejected command must not be completed.
    fn submit_command(&self, session: &SessionHandle, command: EngineCommand) -> LoopbackResult<()>;

    /// Accept a task management function for asynchronous processing
    ///
    /// The engine fires `done` when the function has run, whether or not
    /// it found anything to act on.
    fn submit_mgmt_fn(
        &self,
        session: &SessionHandle,
        function: MgmtFunction,
        done: MgmtCompletion,
    ) -> LoopbackResult<()>;

    /// Acknowledge a notification previously accepted through
    /// [`LoopbackTransport::report_aen`](crate::LoopbackTransport::report_aen)
    fn aen_done(&self, aen: AenHandle);

    /// Maximum number of commands the engine queues for the unit
    fn max_lun_commands(&self, session: &SessionHandle, lun: ScsiLun) -> u32;
}

/// Initiator-side stack that enumerates and drives each session's adapter
pub trait InitiatorHost: Send + Sync {
    /// Expose a session as an adapter
    fn add_adapter(&self, session: &SessionHandle, limits: &AdapterLimits) -> LoopbackResult<AdapterId>;

    fn remove_adapter(&self, adapter: AdapterId);

    /// Rescan every logical unit behind the adapter
    ///
    /// Called from AEN workers that session teardown may be waiting on;
    /// must not call administrative operations of the bridge synchronously.
    fn scan_target(&self, adapter: AdapterId);
}
