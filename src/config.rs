//! Bridge configuration
//!
//! Configuration can be assembled with [`LoopbackConfig::builder`] or parsed
//! from TOML:
//!
//! ```toml
//! add_default_target = true
//! default_target_name = "loopback_tgt"
//! default_session_name = "loopback_host"
//! aen_workers = 1
//! mgmt_wait_timeout_ms = 30000
//!
//! [adapter]
//! max_lun = 16384
//! max_cmd_len = 260
//! ```

use crate::error::{LoopbackError, LoopbackResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default target created on start when `add_default_target` is set
pub const DEFAULT_TARGET_NAME: &str = "loopback_tgt";

/// Default session created under the default target
pub const DEFAULT_SESSION_NAME: &str = "loopback_host";

/// Limits advertised by each session's adapter to the initiator stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdapterLimits {
    /// Target ids per adapter
    pub max_id: u32,
    /// Addressable logical units per target id
    pub max_lun: u32,
    /// Longest CDB accepted
    pub max_cmd_len: usize,
    /// Commands the adapter may have outstanding
    pub can_queue: u32,
    /// Per-device queue depth before a device is configured
    pub cmd_per_lun: u32,
}

impl Default for AdapterLimits {
    fn default() -> Self {
        AdapterLimits {
            max_id: 1,
            max_lun: 16384,
            max_cmd_len: 260,
            can_queue: 2048,
            // Low for the "drop back to untagged" case; raised in configure_device
            cmd_per_lun: 3,
        }
    }
}

/// Loopback bridge configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackConfig {
    pub add_default_target: bool,
    pub default_target_name: String,
    pub default_session_name: String,
    /// Background threads draining AEN queues
    pub aen_workers: usize,
    /// How long a task management call waits before giving up on the
    /// completion. `None` waits indefinitely.
    pub mgmt_wait_timeout: Option<Duration>,
    pub adapter: AdapterLimits,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            add_default_target: true,
            default_target_name: DEFAULT_TARGET_NAME.to_string(),
            default_session_name: DEFAULT_SESSION_NAME.to_string(),
            aen_workers: 1,
            mgmt_wait_timeout: None,
            adapter: AdapterLimits::default(),
        }
    }
}

/// TOML shape of [`LoopbackConfig`]
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConfigFile {
    add_default_target: bool,
    default_target_name: String,
    default_session_name: String,
    aen_workers: usize,
    mgmt_wait_timeout_ms: Option<u64>,
    adapter: AdapterLimits,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let defaults = LoopbackConfig::default();
        ConfigFile {
            add_default_target: defaults.add_default_target,
            default_target_name: defaults.default_target_name,
            default_session_name: defaults.default_session_name,
            aen_workers: defaults.aen_workers,
            mgmt_wait_timeout_ms: None,
            adapter: defaults.adapter,
        }
    }
}

impl LoopbackConfig {
    /// Create a new builder starting from the defaults
    pub fn builder() -> LoopbackConfigBuilder {
        LoopbackConfigBuilder::new()
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(contents: &str) -> LoopbackResult<Self> {
        let file: ConfigFile = toml::from_str(contents)?;
        let config = LoopbackConfig {
            add_default_target: file.add_default_target,
            default_target_name: file.default_target_name,
            default_session_name: file.default_session_name,
            aen_workers: file.aen_workers,
            mgmt_wait_timeout: file.mgmt_wait_timeout_ms.map(Duration::from_millis),
            adapter: file.adapter,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> LoopbackResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LoopbackError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        log::debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// Check the configuration for values the bridge cannot run with
    pub fn validate(&self) -> LoopbackResult<()> {
        if self.aen_workers == 0 {
            return Err(LoopbackError::InvalidArgument(
                "aen_workers must be at least 1".to_string(),
            ));
        }
        if self.add_default_target
            && (self.default_target_name.is_empty() || self.default_session_name.is_empty())
        {
            return Err(LoopbackError::InvalidArgument(
                "default target and session names must not be empty".to_string(),
            ));
        }
        let limits = &self.adapter;
        if limits.max_id == 0 || limits.max_lun == 0 || limits.max_cmd_len == 0 {
            return Err(LoopbackError::InvalidArgument(
                "adapter limits must be non-zero".to_string(),
            ));
        }
        if limits.can_queue == 0 || limits.cmd_per_lun == 0 {
            return Err(LoopbackError::InvalidArgument(
                "adapter queue limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for configuring the loopback bridge
pub struct LoopbackConfigBuilder {
    config: LoopbackConfig,
}

impl LoopbackConfigBuilder {
    fn new() -> Self {
        Self {
            config: LoopbackConfig::default(),
        }
    }

    /// Create (or not) the default target and session on start
    pub fn add_default_target(mut self, enabled: bool) -> Self {
        self.config.add_default_target = enabled;
        self
    }

    /// Set the name of the default target
    pub fn default_target_name(mut self, name: &str) -> Self {
        self.config.default_target_name = name.to_string();
        self
    }

    /// Set the initiator name of the default session
    pub fn default_session_name(mut self, name: &str) -> Self {
        self.config.default_session_name = name.to_string();
        self
    }

    /// Set the number of AEN worker threads (default: 1)
    pub fn aen_workers(mut self, workers: usize) -> Self {
        self.config.aen_workers = workers;
        self
    }

    /// Bound the wait of abort/reset calls
    pub fn mgmt_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.mgmt_wait_timeout = Some(timeout);
        self
    }

    /// Set the limits advertised by each adapter
    pub fn adapter_limits(mut self, limits: AdapterLimits) -> Self {
        self.config.adapter = limits;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> LoopbackResult<LoopbackConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
