//! Simulated target endpoints
//!
//! A target is registered with the engine under a unique name and carries
//! the two protocol version descriptors the engine reports in INQUIRY data.
//! Its sessions are owned by the [`Registry`](crate::registry::Registry).

use crate::engine::EngineTargetId;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// SAS version descriptor, reported when no SCSI transport version is set
pub const SAS_TRANSPORT_VERSION: u16 = 0x0BE0;

pub type TargetHandle = Arc<Target>;

/// Which version descriptor an attribute operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKind {
    ScsiTransport,
    PhysTransport,
}

/// A version descriptor together with the value it falls back to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VersionDescriptor {
    explicit: Option<u16>,
    fallback: u16,
}

impl VersionDescriptor {
    fn new(fallback: u16) -> Self {
        VersionDescriptor {
            explicit: None,
            fallback,
        }
    }

    fn attribute(&self) -> VersionAttribute {
        VersionAttribute {
            value: self.explicit.unwrap_or(self.fallback),
            explicit: self.explicit.is_some(),
        }
    }
}

/// Value of a version descriptor as read through the attribute surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionAttribute {
    pub value: u16,
    /// `false` when `value` is the built-in fallback
    pub explicit: bool,
}

impl fmt::Display for VersionAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.value)
    }
}

#[derive(Debug)]
struct Versions {
    scsi_transport: VersionDescriptor,
    phys_transport: VersionDescriptor,
}

impl Versions {
    fn get_mut(&mut self, kind: VersionKind) -> &mut VersionDescriptor {
        match kind {
            VersionKind::ScsiTransport => &mut self.scsi_transport,
            VersionKind::PhysTransport => &mut self.phys_transport,
        }
    }
}

/// Simulated target endpoint
#[derive(Debug)]
pub struct Target {
    name: String,
    engine_id: EngineTargetId,
    versions: Mutex<Versions>,
}

impl Target {
    pub(crate) fn new(name: &str, engine_id: EngineTargetId) -> Self {
        Target {
            name: name.to_string(),
            engine_id,
            versions: Mutex::new(Versions {
                scsi_transport: VersionDescriptor::new(SAS_TRANSPORT_VERSION),
                phys_transport: VersionDescriptor::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine_id(&self) -> EngineTargetId {
        self.engine_id
    }

    /// Read a version descriptor
    pub fn version(&self, kind: VersionKind) -> VersionAttribute {
        let mut versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        versions.get_mut(kind).attribute()
    }

    /// Set a version descriptor; zero clears it back to the fallback
    pub fn set_version(&self, kind: VersionKind, value: u16) {
        let mut versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        let descriptor = versions.get_mut(kind);
        descriptor.explicit = if value == 0 { None } else { Some(value) };
        log::debug!("Target {}: {:?} version set to 0x{:x}", self.name, kind, value);
    }

    /// SCSI transport version the engine should report
    pub fn scsi_transport_version(&self) -> u16 {
        self.version(VersionKind::ScsiTransport).value
    }

    /// Physical transport version the engine should report
    pub fn phys_transport_version(&self) -> u16 {
        self.version(VersionKind::PhysTransport).value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_fallbacks() {
        let target = Target::new("tgt", EngineTargetId(1));
        assert_eq!(target.scsi_transport_version(), SAS_TRANSPORT_VERSION);
        assert_eq!(target.phys_transport_version(), 0);
        assert!(!target.version(VersionKind::ScsiTransport).explicit);
        assert!(!target.version(VersionKind::PhysTransport).explicit);
    }

    #[test]
    fn test_set_version() {
        let target = Target::new("tgt", EngineTargetId(1));
        target.set_version(VersionKind::ScsiTransport, 0x0960);
        target.set_version(VersionKind::PhysTransport, 0x1234);

        let scsi = target.version(VersionKind::ScsiTransport);
        assert_eq!(scsi, VersionAttribute { value: 0x0960, explicit: true });
        assert_eq!(scsi.to_string(), "0x960");
        assert_eq!(target.phys_transport_version(), 0x1234);
    }

    #[test]
    fn test_zero_clears_version() {
        let target = Target::new("tgt", EngineTargetId(1));
        target.set_version(VersionKind::ScsiTransport, 0x0960);
        target.set_version(VersionKind::ScsiTransport, 0);
        assert_eq!(
            target.version(VersionKind::ScsiTransport),
            VersionAttribute { value: SAS_TRANSPORT_VERSION, explicit: false }
        );
    }
}
