//! A software loopback bridge between a SCSI initiator stack and a SCSI
//! target engine
//!
//! The bridge exposes each simulated initiator session to the initiator side
//! as an adapter and to the target engine as an ordinary transport session,
//! so a target stack can be exercised without storage hardware or a wire
//! transport. Users implement [`TargetEngine`] and [`InitiatorHost`] for the
//! two sides and drive the bridge through [`Loopback`].
//!
//! # Example
//!
//! ```no_run
//! use scsi_loopback::{InitiatorHost, Loopback, LoopbackConfig, TargetEngine};
//! use std::sync::Arc;
//!
//! # fn run(engine: Arc<dyn TargetEngine>, host: Arc<dyn InitiatorHost>)
//! #     -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoopbackConfig::builder()
//!     .default_target_name("tgt0")
//!     .aen_workers(2)
//!     .build()?;
//! let bridge = Loopback::start(config, engine, host)?;
//!
//! let session = bridge.add_session("tgt0", "host1")?;
//! bridge.reset_device(&session, 0)?;
//! println!("{}", bridge.stats());
//!
//! bridge.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod aen;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod exit;
pub mod loopback;
pub mod registry;
pub mod scsi;
pub mod session;
pub mod target;
pub mod task_mgmt;

pub use command::{
    CommandDone, CommandResult, DataTransfer, EngineCommand, EngineResponse, QueueDepthReason,
    ScsiCommand,
};
pub use config::{AdapterLimits, LoopbackConfig, LoopbackConfigBuilder};
pub use engine::{
    AdapterId, Aen, AenHandle, AenKind, EngineTargetId, InitiatorHost, MgmtFunction, TargetEngine,
};
pub use error::{LoopbackError, LoopbackResult};
pub use loopback::{Loopback, LoopbackTransport};
pub use registry::{SessionInfo, TargetInfo};
pub use scsi::{DataDirection, HostStatus, QueueType, ScsiLun, SenseData, TagMessage};
pub use session::{DispatchState, InitiatorPortId, Session, SessionHandle};
pub use target::{Target, TargetHandle, VersionAttribute, VersionKind};
pub use task_mgmt::{MgmtCompletion, StatsSnapshot, WaitOutcome};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
