//! Command routing, task management and queue depth tests

mod common;

use common::{test_config, MockEngine, MockHost};
use scsi_loopback::scsi::scsi_status;
use scsi_loopback::{
    CommandDone, CommandResult, DataDirection, DataTransfer, EngineResponse, HostStatus, Loopback,
    LoopbackError, MgmtFunction, QueueDepthReason, QueueType, ScsiCommand, ScsiLun, SessionHandle,
    TagMessage, WaitOutcome,
};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn setup() -> (Loopback, Arc<MockEngine>, SessionHandle) {
    let engine = MockEngine::new();
    let host = MockHost::new();
    let bridge = Loopback::start(test_config(), engine.clone(), host).expect("bridge starts");
    bridge.add_target("T").unwrap();
    let session = bridge.add_session("T", "H").unwrap();
    (bridge, engine, session)
}

fn channel_done() -> (CommandDone, Receiver<CommandResult>) {
    let (tx, rx) = mpsc::channel();
    let done: CommandDone = Box::new(move |result: CommandResult| {
        let _ = tx.send(result);
    });
    (done, rx)
}

const READ_10: [u8; 10] = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
const WRITE_10: [u8; 10] = [0x2A, 0, 0, 0, 0, 0, 0, 0, 1, 0];

// ============================================================================
// Command routing
// ============================================================================

#[test]
fn test_read_round_trip() {
    let (bridge, engine, session) = setup();
    engine.auto_complete.store(true, Ordering::SeqCst);

    let (done, rx) = channel_done();
    let command = ScsiCommand::new(0, &READ_10).with_data(DataTransfer::FromDevice { len: 512 });
    bridge.submit(&session, command, done).unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.host_status, HostStatus::Ok);
    assert_eq!(result.status, scsi_status::GOOD);
    assert_eq!(result.data_in, vec![0x5A; 512]);
    assert_eq!(result.resid, 0);
}

#[test]
fn test_command_classification_reaches_engine() {
    let (bridge, engine, session) = setup();

    let (done, _rx) = channel_done();
    let command = ScsiCommand::new(5, &WRITE_10)
        .with_tag(42, TagMessage::HeadOfQueue)
        .with_data(DataTransfer::ToDevice(vec![1; 512]));
    bridge.submit(&session, command, done).unwrap();

    let commands = engine.commands.lock().unwrap();
    assert_eq!(commands.len(), 1);
    let cmd = &commands[0];
    assert_eq!(cmd.lun, ScsiLun::from_u64(5));
    assert_eq!(cmd.tag, 42);
    assert_eq!(cmd.queue_type, QueueType::HeadOfQueue);
    assert_eq!(cmd.direction, DataDirection::Write);
    assert_eq!(cmd.data_out.len(), 512);
    assert_eq!(cmd.expected_in_len, 0);
}

#[test]
fn test_completion_from_engine_thread() {
    let (bridge, engine, session) = setup();

    let (done, rx) = channel_done();
    let command = ScsiCommand::new(0, &READ_10)
        .with_tag(1, TagMessage::Simple)
        .with_data(DataTransfer::FromDevice { len: 64 });
    bridge.submit(&session, command, done).unwrap();

    let cmd = engine.commands.lock().unwrap().pop().unwrap();
    thread::spawn(move || {
        let mut response = EngineResponse::good(vec![7; 16]);
        response.out_resid = 0;
        cmd.complete(response);
    })
    .join()
    .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.data_in.len(), 16);
    assert_eq!(result.resid, 48);
}

#[test]
fn test_aborted_command_result() {
    let (bridge, engine, session) = setup();

    let (done, rx) = channel_done();
    bridge
        .submit(&session, ScsiCommand::new(0, &READ_10), done)
        .unwrap();
    let cmd = engine.commands.lock().unwrap().pop().unwrap();
    cmd.complete(EngineResponse::aborted());

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.host_status, HostStatus::DeliveryAborted);
}

#[test]
fn test_command_rejected_on_closing_session() {
    let (bridge, engine, session) = setup();
    bridge.remove_session("T", "H").unwrap();

    let (done, rx) = channel_done();
    let err = bridge
        .submit(&session, ScsiCommand::new(0, &READ_10), done)
        .unwrap_err();
    assert!(matches!(err, LoopbackError::SessionUnavailable(1)));
    assert_eq!(err.host_status(), HostStatus::BadTarget);

    assert!(engine.commands.lock().unwrap().is_empty());
    // The completion callback is never invoked for a rejected command
    assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
}

#[test]
fn test_command_bounds() {
    let (bridge, engine, session) = setup();

    let (done, _rx) = channel_done();
    let long_cdb = vec![0u8; 261];
    assert!(matches!(
        bridge.submit(&session, ScsiCommand::new(0, &long_cdb), done),
        Err(LoopbackError::InvalidArgument(_))
    ));

    let (done, _rx) = channel_done();
    assert!(matches!(
        bridge.submit(&session, ScsiCommand::new(0, &[]), done),
        Err(LoopbackError::InvalidArgument(_))
    ));

    let (done, _rx) = channel_done();
    assert!(matches!(
        bridge.submit(&session, ScsiCommand::new(16384, &READ_10), done),
        Err(LoopbackError::InvalidArgument(_))
    ));

    assert!(engine.commands.lock().unwrap().is_empty());
}

#[test]
fn test_engine_rejection_is_busy() {
    let (bridge, engine, session) = setup();
    engine.reject_commands.store(true, Ordering::SeqCst);

    let (done, rx) = channel_done();
    let err = bridge
        .submit(&session, ScsiCommand::new(0, &READ_10), done)
        .unwrap_err();
    assert!(matches!(err, LoopbackError::SubmissionFailed(_)));
    assert_eq!(err.host_status(), HostStatus::Busy);

    // The error is the only outcome the initiator sees
    assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
}

#[test]
fn test_command_dropped_after_acceptance_reports_error() {
    let (bridge, engine, session) = setup();
    engine.drop_commands.store(true, Ordering::SeqCst);

    let (done, rx) = channel_done();
    let command = ScsiCommand::new(0, &READ_10).with_data(DataTransfer::FromDevice { len: 512 });
    bridge.submit(&session, command, done).unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.host_status, HostStatus::Error);
    assert_eq!(result.resid, 512);
    assert!(rx.try_recv().is_err());
}

// ============================================================================
// Task management
// ============================================================================

#[test]
fn test_task_management_counts_every_call() {
    let (bridge, engine, session) = setup();

    assert_eq!(bridge.abort(&session, 7).unwrap(), WaitOutcome::Completed);
    assert_eq!(bridge.reset_device(&session, 2).unwrap(), WaitOutcome::Completed);
    assert_eq!(bridge.reset_target(&session, 0).unwrap(), WaitOutcome::Completed);
    assert_eq!(bridge.abort(&session, 8).unwrap(), WaitOutcome::Completed);

    let stats = bridge.stats();
    assert_eq!(stats.aborts, 2);
    assert_eq!(stats.device_resets, 1);
    assert_eq!(stats.target_resets, 1);
    assert_eq!(stats.to_string(), "Aborts: 2, Device Resets: 1, Target Resets: 1");

    assert_eq!(
        *engine.mgmt_calls.lock().unwrap(),
        vec![
            MgmtFunction::AbortTask { tag: 7 },
            MgmtFunction::LunReset { lun: ScsiLun::from_u64(2) },
            MgmtFunction::TargetReset { lun: ScsiLun::from_u64(0) },
            MgmtFunction::AbortTask { tag: 8 },
        ]
    );
}

#[test]
fn test_abort_blocks_until_completion() {
    let (bridge, engine, session) = setup();
    engine.hold_mgmt.store(true, Ordering::SeqCst);

    thread::scope(|scope| {
        let waiter = scope.spawn(|| bridge.abort(&session, 1));
        while engine.held_mgmt.lock().unwrap().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!waiter.is_finished());
        engine.release_mgmt();
        assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::Completed);
    });
    assert_eq!(bridge.stats().aborts, 1);
}

#[test]
fn test_interrupted_wait_tolerates_late_completion() {
    let mut config = test_config();
    config.mgmt_wait_timeout = Some(Duration::from_millis(20));
    let engine = MockEngine::new();
    let bridge = Loopback::start(config, engine.clone(), MockHost::new()).unwrap();
    bridge.add_target("T").unwrap();
    let session = bridge.add_session("T", "H").unwrap();
    engine.hold_mgmt.store(true, Ordering::SeqCst);

    assert_eq!(bridge.reset_device(&session, 0).unwrap(), WaitOutcome::Interrupted);
    assert_eq!(bridge.stats().device_resets, 1);

    // The function still completes after the waiter gave up
    engine.release_mgmt();
}

#[test]
fn test_submission_error_still_counted() {
    let (bridge, engine, session) = setup();
    engine.reject_mgmt.store(true, Ordering::SeqCst);

    assert!(matches!(
        bridge.reset_target(&session, 0),
        Err(LoopbackError::SubmissionFailed(_))
    ));
    assert_eq!(bridge.stats().target_resets, 1);
}

#[test]
fn test_task_management_on_closing_session() {
    let (bridge, engine, session) = setup();
    bridge.remove_session("T", "H").unwrap();

    assert!(matches!(
        bridge.abort(&session, 1),
        Err(LoopbackError::SessionUnavailable(1))
    ));
    assert!(engine.mgmt_calls.lock().unwrap().is_empty());
    assert_eq!(bridge.stats().aborts, 1);
}

// ============================================================================
// Queue depth
// ============================================================================

#[test]
fn test_queue_depth() {
    let (bridge, engine, session) = setup();
    engine.max_commands.store(32, Ordering::SeqCst);

    assert_eq!(bridge.queue_depth(&session, 0), 3);
    assert_eq!(bridge.max_queue_depth(&session, 0), 32);
    assert_eq!(bridge.configure_device(&session, 0), 32);
    assert_eq!(bridge.queue_depth(&session, 0), 32);

    assert_eq!(
        bridge
            .change_queue_depth(&session, 0, 16, QueueDepthReason::Default)
            .unwrap(),
        16
    );
    assert!(matches!(
        bridge.change_queue_depth(&session, 0, 64, QueueDepthReason::Default),
        Err(LoopbackError::InvalidArgument(_))
    ));
    assert_eq!(bridge.queue_depth(&session, 0), 16);

    assert_eq!(
        bridge
            .change_queue_depth(&session, 0, 8, QueueDepthReason::QueueFull)
            .unwrap(),
        8
    );
    assert_eq!(
        bridge
            .change_queue_depth(&session, 0, 24, QueueDepthReason::RampUp)
            .unwrap(),
        24
    );
    assert!(matches!(
        bridge.change_queue_depth(&session, 0, 0, QueueDepthReason::RampUp),
        Err(LoopbackError::InvalidArgument(_))
    ));
}
