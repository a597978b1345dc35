//! Command routing between the initiator side and the target engine
//!
//! [`CommandRouter::submit`] turns an initiator command into an
//! [`EngineCommand`], classifying its queue discipline and data direction,
//! and hands it to the engine. The engine finishes the command through
//! [`EngineCommand::complete`], which builds the initiator-visible
//! [`CommandResult`] and invokes the initiator's completion callback.

use crate::config::AdapterLimits;
use crate::engine::TargetEngine;
use crate::error::{LoopbackError, LoopbackResult};
use crate::scsi::{DataDirection, HostStatus, QueueType, ScsiLun, TagMessage, SENSE_BUFFER_SIZE};
use crate::session::SessionHandle;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Initiator-side completion callback, invoked at most once per command
pub type CommandDone = Box<dyn FnOnce(CommandResult) + Send>;

/// Data buffers attached to an initiator command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DataTransfer {
    #[default]
    None,
    /// Read: the initiator expects up to `len` bytes
    FromDevice { len: usize },
    /// Write: the initiator sends these bytes
    ToDevice(Vec<u8>),
    Bidirectional { data_out: Vec<u8>, in_len: usize },
}

impl DataTransfer {
    pub fn direction(&self) -> DataDirection {
        match self {
            DataTransfer::None => DataDirection::None,
            DataTransfer::FromDevice { .. } => DataDirection::Read,
            DataTransfer::ToDevice(_) => DataDirection::Write,
            DataTransfer::Bidirectional { .. } => DataDirection::Bidirectional,
        }
    }
}

/// Command as issued by the initiator side
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScsiCommand {
    pub lun: u64,
    pub cdb: Vec<u8>,
    pub tag: u64,
    pub tag_message: TagMessage,
    pub data: DataTransfer,
}

impl ScsiCommand {
    pub fn new(lun: u64, cdb: &[u8]) -> Self {
        ScsiCommand {
            lun,
            cdb: cdb.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: u64, tag_message: TagMessage) -> Self {
        self.tag = tag;
        self.tag_message = tag_message;
        self
    }

    pub fn with_data(mut self, data: DataTransfer) -> Self {
        self.data = data;
        self
    }
}

/// Result delivered to the initiator-side completion callback
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResult {
    pub host_status: HostStatus,
    /// SCSI status byte
    pub status: u8,
    /// Sense data, at most [`SENSE_BUFFER_SIZE`] bytes
    pub sense: Vec<u8>,
    pub data_in: Vec<u8>,
    /// Bytes of the expected IN transfer that were not delivered
    pub resid: usize,
}

/// What the engine reports when it finishes a command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineResponse {
    pub status: u8,
    pub sense: Vec<u8>,
    pub data_in: Vec<u8>,
    /// Bytes of the OUT transfer the engine did not consume
    pub out_resid: usize,
    /// The command was aborted while in flight
    pub aborted: bool,
}

impl EngineResponse {
    pub fn good(data_in: Vec<u8>) -> Self {
        EngineResponse {
            data_in,
            ..Default::default()
        }
    }

    pub fn check_condition(sense: Vec<u8>) -> Self {
        EngineResponse {
            status: crate::scsi::scsi_status::CHECK_CONDITION,
            sense,
            ..Default::default()
        }
    }

    pub fn aborted() -> Self {
        EngineResponse {
            aborted: true,
            ..Default::default()
        }
    }
}

/// Engine-side representation of a routed command
pub struct EngineCommand {
    pub lun: ScsiLun,
    pub cdb: Vec<u8>,
    pub tag: u64,
    pub queue_type: QueueType,
    pub direction: DataDirection,
    /// Length of the initiator's IN buffer
    pub expected_in_len: usize,
    pub data_out: Vec<u8>,
    session: u32,
    done: Option<CommandDone>,
    handoff: Arc<Mutex<Handoff>>,
}

/// Callback parked by a command dropped inside the engine's submit call
///
/// The router settles it once the call returns: an accepted command reports
/// an error, a rejected one never reaches the initiator.
#[derive(Default)]
struct Handoff {
    submitting: bool,
    parked: Option<CommandDone>,
}

impl EngineCommand {
    fn new(session: u32, command: ScsiCommand, done: CommandDone) -> Self {
        let direction = command.data.direction();
        let (data_out, expected_in_len) = match command.data {
            DataTransfer::None => (Vec::new(), 0),
            DataTransfer::FromDevice { len } => (Vec::new(), len),
            DataTransfer::ToDevice(data) => (data, 0),
            DataTransfer::Bidirectional { data_out, in_len } => (data_out, in_len),
        };

        EngineCommand {
            lun: ScsiLun::from_u64(command.lun),
            cdb: command.cdb,
            tag: command.tag,
            queue_type: QueueType::from(command.tag_message),
            direction,
            expected_in_len,
            data_out,
            session,
            done: Some(done),
            handoff: Arc::default(),
        }
    }

    fn begin_submission(&self) -> Arc<Mutex<Handoff>> {
        self.handoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .submitting = true;
        Arc::clone(&self.handoff)
    }

    /// Opcode (first CDB byte)
    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0)
    }

    /// Finish the command and notify the initiator
    pub fn complete(mut self, response: EngineResponse) {
        let result = self.build_result(response);
        if let Some(done) = self.done.take() {
            done(result);
        }
    }

    fn build_result(&self, response: EngineResponse) -> CommandResult {
        if response.aborted {
            log::debug!(
                "Session {}: command 0x{:02X} (tag {}) aborted",
                self.session,
                self.opcode(),
                self.tag
            );
            return CommandResult {
                host_status: HostStatus::DeliveryAborted,
                resid: self.expected_in_len,
                ..Default::default()
            };
        }

        if response.out_resid != 0 {
            log::error!(
                "Unable to return OUT residual {} (op {:02x})",
                response.out_resid,
                self.opcode()
            );
        }

        let mut sense = response.sense;
        sense.truncate(SENSE_BUFFER_SIZE);
        let mut data_in = response.data_in;
        data_in.truncate(self.expected_in_len);
        let resid = self.expected_in_len - data_in.len();

        CommandResult {
            host_status: HostStatus::Ok,
            status: response.status,
            sense,
            data_in,
            resid,
        }
    }
}

impl Drop for EngineCommand {
    fn drop(&mut self) {
        // Dropped by the engine without a response
        let Some(done) = self.done.take() else {
            return;
        };
        let mut handoff = self.handoff.lock().unwrap_or_else(PoisonError::into_inner);
        if handoff.submitting {
            handoff.parked = Some(done);
            return;
        }
        drop(handoff);
        log::warn!(
            "Session {}: command 0x{:02X} (tag {}) dropped without completion",
            self.session,
            self.opcode(),
            self.tag
        );
        done(dropped_result(self.expected_in_len));
    }
}

fn dropped_result(expected_in_len: usize) -> CommandResult {
    CommandResult {
        host_status: HostStatus::Error,
        resid: expected_in_len,
        ..Default::default()
    }
}

impl fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCommand")
            .field("lun", &self.lun)
            .field("cdb", &hex::encode(&self.cdb))
            .field("tag", &self.tag)
            .field("queue_type", &self.queue_type)
            .field("direction", &self.direction)
            .field("expected_in_len", &self.expected_in_len)
            .field("data_out_len", &self.data_out.len())
            .finish()
    }
}

/// Why the initiator side asks for a queue depth change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDepthReason {
    /// Explicit request; bounded by what the engine can queue
    Default,
    /// The device reported TASK SET FULL at this depth
    QueueFull,
    RampUp,
}

/// Routes initiator commands into the target engine
pub struct CommandRouter {
    engine: Arc<dyn TargetEngine>,
    limits: AdapterLimits,
}

impl CommandRouter {
    pub fn new(engine: Arc<dyn TargetEngine>, limits: AdapterLimits) -> Self {
        CommandRouter { engine, limits }
    }

    /// Hand a command to the engine
    ///
    /// On error the command never reaches the engine and `done` is not
    /// invoked; [`LoopbackError::host_status`] gives the status to report.
    pub fn submit(&self, session: &SessionHandle, command: ScsiCommand, done: CommandDone) -> LoopbackResult<()> {
        if session.is_unregistering() {
            log::debug!(
                "Session {} is unregistering, rejecting command for lun {}",
                session.number(),
                command.lun
            );
            return Err(LoopbackError::SessionUnavailable(session.number()));
        }

        if command.cdb.is_empty() {
            return Err(LoopbackError::InvalidArgument("empty CDB".to_string()));
        }
        if command.cdb.len() > self.limits.max_cmd_len {
            return Err(LoopbackError::InvalidArgument(format!(
                "CDB length {} exceeds {}",
                command.cdb.len(),
                self.limits.max_cmd_len
            )));
        }
        if command.lun >= u64::from(self.limits.max_lun) {
            return Err(LoopbackError::InvalidArgument(format!(
                "LUN {} out of range (max {})",
                command.lun, self.limits.max_lun
            )));
        }

        log::debug!("lun {}, cmd: 0x{:02X}", command.lun, command.cdb[0]);

        let command = EngineCommand::new(session.number(), command, done);
        let (opcode, expected_in_len) = (command.opcode(), command.expected_in_len);
        let handoff = command.begin_submission();
        let submitted = self.engine.submit_command(session, command);

        let parked = {
            let mut handoff = handoff.lock().unwrap_or_else(PoisonError::into_inner);
            handoff.submitting = false;
            handoff.parked.take()
        };
        match submitted {
            Ok(()) => {
                if let Some(done) = parked {
                    log::warn!(
                        "Session {}: command 0x{:02X} dropped by the engine during submission",
                        session.number(),
                        opcode
                    );
                    done(dropped_result(expected_in_len));
                }
                Ok(())
            }
            Err(e) => {
                log::error!("Session {}: engine rejected command: {}", session.number(), e);
                Err(e)
            }
        }
    }

    /// Deepest queue the engine supports for a device
    pub fn max_queue_depth(&self, session: &SessionHandle, lun: u64) -> u32 {
        self.engine.max_lun_commands(session, ScsiLun::from_u64(lun))
    }

    /// Configure a newly discovered device with the deepest supported queue
    pub fn configure_device(&self, session: &SessionHandle, lun: u64) -> u32 {
        let depth = self.max_queue_depth(session, lun);
        log::info!(
            "Configuring queue depth {} for lun {} (session {})",
            depth,
            lun,
            session.number()
        );
        session.set_queue_depth(lun, depth);
        depth
    }

    /// Current queue depth of a device
    ///
    /// Devices that were never configured run at `cmd_per_lun`.
    pub fn queue_depth(&self, session: &SessionHandle, lun: u64) -> u32 {
        session.queue_depth(lun).unwrap_or(self.limits.cmd_per_lun)
    }

    /// Adjust a device's queue depth, returning the depth now in effect
    pub fn change_queue_depth(
        &self,
        session: &SessionHandle,
        lun: u64,
        depth: u32,
        reason: QueueDepthReason,
    ) -> LoopbackResult<u32> {
        if depth == 0 {
            return Err(LoopbackError::InvalidArgument("queue depth 0".to_string()));
        }

        let current = self.queue_depth(session, lun);
        let new_depth = match reason {
            QueueDepthReason::Default => {
                let max = self.max_queue_depth(session, lun);
                if max < depth {
                    log::info!(
                        "Requested queue depth {} is too big (possible max {}, lun {})",
                        depth,
                        max,
                        lun
                    );
                    return Err(LoopbackError::InvalidArgument(format!(
                        "queue depth {} exceeds {}",
                        depth, max
                    )));
                }
                log::info!(
                    "Setting queue depth {} as default (lun {}, current {})",
                    depth,
                    lun,
                    current
                );
                depth
            }
            QueueDepthReason::QueueFull => {
                log::debug!("QUEUE FULL on lun {}, setting qdepth {} (cur {})", lun, depth, current);
                depth.min(current)
            }
            QueueDepthReason::RampUp => {
                log::debug!("Ramping up qdepth on lun {} to {} (cur {})", lun, depth, current);
                depth
            }
        };

        session.set_queue_depth(lun, new_depth);
        Ok(new_depth)
    }
}
