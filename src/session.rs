//! Simulated initiator sessions
//!
//! A session is one initiator connection under a target. It is shared
//! between the registry, the target engine, the AEN dispatcher and any
//! in-flight command, so it lives behind an `Arc` ([`SessionHandle`]).
//!
//! # Teardown
//!
//! Teardown happens in two phases:
//!
//! 1. The `unregistering` latch is set under the AEN lock. From then on new
//!    AEN reports, commands and management functions are refused. Setting
//!    an already-set latch is a no-op.
//! 2. Removal (cancel AEN work, drain, unlink, remove the adapter,
//!    unregister from the engine) is claimed exactly once, always under the
//!    registry lock; see [`Loopback`](crate::Loopback).

use crate::engine::{AdapterId, AenHandle};
use crate::target::TargetHandle;
use byteorder::{BigEndian, ByteOrder};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// SCSI TransportID protocol identifier for SAS
pub const SAS_PROTOCOL_ID: u8 = 0x06;

/// Length of a SAS TransportID
pub const SAS_TRANSPORT_ID_LEN: usize = 24;

/// SAS address template; the session number is folded into bytes 3 and 4
const SAS_ADDRESS_BASE: u64 = 0x5FEE_DE40_0FAD_E050;

pub type SessionHandle = Arc<Session>;

/// Scheduling state of a session's AEN queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchState {
    /// Nothing queued for a worker
    #[default]
    Idle,
    /// Handed to the dispatcher, no worker has picked it up yet
    Scheduled,
    /// A worker is draining the queue
    Draining,
}

/// One pending notification
#[derive(Debug)]
pub(crate) struct AenItem {
    pub(crate) aen: AenHandle,
}

/// Everything guarded by the session's AEN lock
#[derive(Debug, Default)]
pub(crate) struct AenState {
    pub(crate) unregistering: bool,
    pub(crate) dispatch: DispatchState,
    pub(crate) pending: VecDeque<AenItem>,
    /// Cleared before the adapter is removed so no rescan targets it
    pub(crate) adapter: Option<AdapterId>,
}

/// Simulated initiator session
pub struct Session {
    number: u32,
    initiator_name: String,
    target: TargetHandle,
    aen: Mutex<AenState>,
    aen_idle: Condvar,
    transport_id: Mutex<Option<Vec<u8>>>,
    queue_depths: Mutex<HashMap<u64, u32>>,
    removal_claimed: AtomicBool,
}

impl Session {
    pub(crate) fn new(number: u32, initiator_name: &str, target: TargetHandle) -> Self {
        Session {
            number,
            initiator_name: initiator_name.to_string(),
            target,
            aen: Mutex::new(AenState::default()),
            aen_idle: Condvar::new(),
            transport_id: Mutex::new(None),
            queue_depths: Mutex::new(HashMap::new()),
            removal_claimed: AtomicBool::new(false),
        }
    }

    /// Process-wide sequence number, starting at 1
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn initiator_name(&self) -> &str {
        &self.initiator_name
    }

    /// Owning target
    pub fn target(&self) -> &TargetHandle {
        &self.target
    }

    /// Adapter the initiator stack knows this session by, until teardown
    pub fn adapter(&self) -> Option<AdapterId> {
        self.lock_aen().adapter
    }

    pub fn is_unregistering(&self) -> bool {
        self.lock_aen().unregistering
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.lock_aen().dispatch
    }

    /// Notifications queued but not yet consumed
    pub fn pending_aens(&self) -> usize {
        self.lock_aen().pending.len()
    }

    /// TransportID of the initiator port
    ///
    /// Returns the override when one is set, otherwise a SAS TransportID
    /// derived from the session number.
    pub fn transport_id(&self) -> Vec<u8> {
        let transport_id = self.transport_id.lock().unwrap_or_else(PoisonError::into_inner);
        match transport_id.as_ref() {
            Some(id) => id.clone(),
            None => sas_transport_id(self.number),
        }
    }

    /// Override the TransportID; an empty value restores the default
    pub fn set_transport_id(&self, id: &[u8]) {
        let mut transport_id = self.transport_id.lock().unwrap_or_else(PoisonError::into_inner);
        *transport_id = if id.is_empty() { None } else { Some(id.to_vec()) };
        log::debug!(
            "Session {}: transport id set to '{}'",
            self.number,
            hex::encode(id)
        );
    }

    pub fn has_transport_id_override(&self) -> bool {
        self.transport_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Queue depth recorded for a device, if it was ever configured
    pub fn queue_depth(&self, lun: u64) -> Option<u32> {
        self.queue_depths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&lun)
            .copied()
    }

    pub(crate) fn set_queue_depth(&self, lun: u64, depth: u32) {
        self.queue_depths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(lun, depth);
    }

    /// Lock the AEN state with poison recovery
    pub(crate) fn lock_aen(&self) -> MutexGuard<'_, AenState> {
        self.aen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until no worker is draining the queue
    pub(crate) fn wait_aen_idle<'a>(&self, mut state: MutexGuard<'a, AenState>) -> MutexGuard<'a, AenState> {
        while state.dispatch == DispatchState::Draining {
            state = self
                .aen_idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
    }

    pub(crate) fn notify_aen_idle(&self) {
        self.aen_idle.notify_all();
    }

    /// Set the `unregistering` latch
    ///
    /// Returns `true` if this call set it, `false` if it was already set.
    pub(crate) fn mark_unregistering(&self) -> bool {
        let mut state = self.lock_aen();
        let was_unregistering = state.unregistering;
        state.unregistering = true;
        !was_unregistering
    }

    /// Claim the destructive removal. Only called with the registry locked.
    pub(crate) fn claim_removal(&self) -> bool {
        !self.removal_claimed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn attach_adapter(&self, adapter: AdapterId) {
        self.lock_aen().adapter = Some(adapter);
    }

    pub(crate) fn detach_adapter(&self) -> Option<AdapterId> {
        self.lock_aen().adapter.take()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("number", &self.number)
            .field("initiator_name", &self.initiator_name)
            .field("target", &self.target.name())
            .finish_non_exhaustive()
    }
}

/// Default SAS TransportID for a session number
pub fn sas_transport_id(number: u32) -> Vec<u8> {
    let number = u64::from(number);
    let address = SAS_ADDRESS_BASE | ((number >> 4) & 0x0F) << 32 | (number & 0x0F) << 28;

    let mut id = vec![0u8; SAS_TRANSPORT_ID_LEN];
    id[0] = SAS_PROTOCOL_ID;
    BigEndian::write_u64(&mut id[4..12], address);

    log::debug!("Created tid '{}'", hex::encode(&id[4..12]));
    id
}

/// Engine query for an initiator port's TransportID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorPortId {
    /// Asked without a session: the protocol the bridge emulates
    Protocol(u8),
    TransportId(Vec<u8>),
}

/// Answer the engine's TransportID query
pub fn initiator_port_transport_id(session: Option<&Session>) -> InitiatorPortId {
    match session {
        None => InitiatorPortId::Protocol(SAS_PROTOCOL_ID),
        Some(session) => InitiatorPortId::TransportId(session.transport_id()),
    }
}
