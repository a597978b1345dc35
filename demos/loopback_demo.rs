//! Loopback bridge example with an in-memory target engine
//!
//! This example wires a tiny RAM disk engine and a printing initiator host
//! to the bridge, runs a write and a read through it, raises an AEN and
//! issues a device reset.

use scsi_loopback::scsi::sense_key;
use scsi_loopback::{
    AdapterId, AdapterLimits, Aen, AenHandle, CommandResult, DataTransfer, EngineCommand,
    EngineResponse, EngineTargetId, InitiatorHost, Loopback, LoopbackConfig, LoopbackError,
    LoopbackResult, MgmtCompletion, MgmtFunction, ScsiCommand, ScsiLun, SenseData, SessionHandle,
    TargetEngine,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

const BLOCK_SIZE: usize = 512;

/// Single-LUN RAM disk engine
struct RamDiskEngine {
    data: Mutex<Vec<u8>>,
    next_target: AtomicU64,
}

impl RamDiskEngine {
    fn new(blocks: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; blocks * BLOCK_SIZE]),
            next_target: AtomicU64::new(1),
        }
    }

    fn execute(&self, cmd: &EngineCommand) -> EngineResponse {
        let illegal = || EngineResponse::check_condition(SenseData::new(sense_key::ILLEGAL_REQUEST, 0x20, 0).to_bytes());
        if cmd.lun != ScsiLun::from_u64(0) || cmd.cdb.len() < 10 {
            return illegal();
        }

        let lba = u32::from_be_bytes([cmd.cdb[2], cmd.cdb[3], cmd.cdb[4], cmd.cdb[5]]) as usize;
        let blocks = u16::from_be_bytes([cmd.cdb[7], cmd.cdb[8]]) as usize;
        let range = lba * BLOCK_SIZE..(lba + blocks) * BLOCK_SIZE;

        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if range.end > data.len() {
            return illegal();
        }
        match cmd.opcode() {
            0x28 => EngineResponse::good(data[range].to_vec()),
            0x2A => {
                let len = cmd.data_out.len().min(range.len());
                data[range.start..range.start + len].copy_from_slice(&cmd.data_out[..len]);
                EngineResponse::good(Vec::new())
            }
            _ => illegal(),
        }
    }
}

impl TargetEngine for RamDiskEngine {
    fn register_target(&self, name: &str) -> LoopbackResult<EngineTargetId> {
        println!("engine: register target {}", name);
        Ok(EngineTargetId(self.next_target.fetch_add(1, Ordering::SeqCst)))
    }

    fn unregister_target(&self, target: EngineTargetId) {
        println!("engine: unregister target {:?}", target);
    }

    fn register_session(&self, _target: EngineTargetId, session: &SessionHandle) -> LoopbackResult<()> {
        println!("engine: register session {} ({})", session.number(), session.initiator_name());
        Ok(())
    }

    fn unregister_session(&self, session: &SessionHandle) {
        println!("engine: unregister session {}", session.number());
    }

    fn submit_command(&self, _session: &SessionHandle, command: EngineCommand) -> LoopbackResult<()> {
        let response = self.execute(&command);
        command.complete(response);
        Ok(())
    }

    fn submit_mgmt_fn(
        &self,
        _session: &SessionHandle,
        function: MgmtFunction,
        done: MgmtCompletion,
    ) -> LoopbackResult<()> {
        println!("engine: {:?}", function);
        done.complete();
        Ok(())
    }

    fn aen_done(&self, aen: AenHandle) {
        println!("engine: AEN {:?} consumed", aen);
    }

    fn max_lun_commands(&self, _session: &SessionHandle, _lun: ScsiLun) -> u32 {
        32
    }
}

/// Initiator side that only reports what it is asked to do
struct PrintingHost {
    next_host: AtomicU32,
}

impl InitiatorHost for PrintingHost {
    fn add_adapter(&self, session: &SessionHandle, limits: &AdapterLimits) -> LoopbackResult<AdapterId> {
        let adapter = AdapterId(self.next_host.fetch_add(1, Ordering::SeqCst));
        println!(
            "host: {} for session {} (max_lun {}, max_cmd_len {})",
            adapter,
            session.number(),
            limits.max_lun,
            limits.max_cmd_len
        );
        Ok(adapter)
    }

    fn remove_adapter(&self, adapter: AdapterId) {
        println!("host: {} removed", adapter);
    }

    fn scan_target(&self, adapter: AdapterId) {
        println!("host: rescanning {}", adapter);
    }
}

fn run(bridge: &Loopback, session: &SessionHandle, command: ScsiCommand) -> Result<CommandResult, LoopbackError> {
    let (tx, rx) = mpsc::channel();
    bridge.submit(session, command, Box::new(move |result: CommandResult| {
        let _ = tx.send(result);
    }))?;
    rx.recv()
        .map_err(|_| LoopbackError::SubmissionFailed("command dropped".to_string()))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = LoopbackConfig::builder()
        .default_target_name("ramdisk")
        .default_session_name("demo_host")
        .build()?;
    let bridge = Loopback::start(
        config,
        Arc::new(RamDiskEngine::new(2048)),
        Arc::new(PrintingHost {
            next_host: AtomicU32::new(0),
        }),
    )?;
    println!("Loopback bridge {} started", bridge.driver_version());

    let session = bridge.find_session("ramdisk", "demo_host")?;
    println!("Transport ID: {}", hex::encode(session.transport_id()));
    println!("Queue depth: {}", bridge.configure_device(&session, 0));

    let pattern: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    let write = ScsiCommand::new(0, &[0x2A, 0, 0, 0, 0, 8, 0, 0, 1, 0])
        .with_data(DataTransfer::ToDevice(pattern.clone()));
    let result = run(&bridge, &session, write)?;
    println!("WRITE(10): status 0x{:02x}", result.status);

    let read = ScsiCommand::new(0, &[0x28, 0, 0, 0, 0, 8, 0, 0, 1, 0])
        .with_data(DataTransfer::FromDevice { len: BLOCK_SIZE });
    let result = run(&bridge, &session, read)?;
    println!(
        "READ(10): status 0x{:02x}, data matches: {}",
        result.status,
        result.data_in == pattern
    );

    bridge.transport().report_aen(&session, Aen::scsi(AenHandle(1)))?;
    bridge.reset_device(&session, 0)?;
    println!("{}", bridge.stats());

    bridge.shutdown();
    Ok(())
}
