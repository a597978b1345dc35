//! SCSI addressing, status and queueing vocabulary shared by both sides of the bridge
//!
//! The initiator side speaks in 64-bit LUNs, tag messages and buffer
//! directions; the target engine expects 8-byte SCSI LUNs, queue types and
//! data directions. This module holds both vocabularies and the mappings
//! between them.

use byteorder::{BigEndian, ByteOrder};

/// Size of the initiator-visible sense buffer. Engine sense data is
/// truncated to this length when a command completes.
pub const SENSE_BUFFER_SIZE: usize = 96;

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// 8-byte SCSI LUN in the engine's wire layout
///
/// Each 16-bit level of the integer LUN is stored big-endian, first level
/// first, matching the initiator stack's `int_to_scsilun` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScsiLun(pub [u8; 8]);

impl ScsiLun {
    /// Encode an integer LUN
    pub fn from_u64(lun: u64) -> Self {
        let mut bytes = [0u8; 8];
        for level in 0..4 {
            let chunk = (lun >> (16 * level)) as u16;
            BigEndian::write_u16(&mut bytes[level * 2..level * 2 + 2], chunk);
        }
        ScsiLun(bytes)
    }

    /// Decode back to the integer LUN
    pub fn to_u64(&self) -> u64 {
        (0..4).fold(0u64, |lun, level| {
            let chunk = BigEndian::read_u16(&self.0[level * 2..level * 2 + 2]) as u64;
            lun | (chunk << (16 * level))
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<u64> for ScsiLun {
    fn from(lun: u64) -> Self {
        ScsiLun::from_u64(lun)
    }
}

/// Tag message the initiator attached to a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagMessage {
    /// No tag; the device is not doing tagged queueing
    #[default]
    None,
    Simple,
    Ordered,
    HeadOfQueue,
}

/// Queue discipline handed to the target engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueType {
    #[default]
    Untagged,
    Simple,
    Ordered,
    HeadOfQueue,
}

impl From<TagMessage> for QueueType {
    fn from(tag: TagMessage) -> Self {
        match tag {
            TagMessage::Simple => QueueType::Simple,
            TagMessage::Ordered => QueueType::Ordered,
            TagMessage::HeadOfQueue => QueueType::HeadOfQueue,
            TagMessage::None => QueueType::Untagged,
        }
    }
}

/// Data direction of a command as seen by the target engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    #[default]
    None,
    /// Data flows from the device to the initiator
    Read,
    /// Data flows from the initiator to the device
    Write,
    Bidirectional,
}

/// Host-level (transport) status of a completed or rejected command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostStatus {
    #[default]
    Ok,
    /// The addressed session is going away
    BadTarget,
    /// The engine aborted the command while it was in flight
    DeliveryAborted,
    /// The engine could not accept the command right now
    Busy,
    Error,
}

/// SCSI sense data (fixed format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData { sense_key, asc, ascq }
    }

    /// Unit attention raised when the reported LUN inventory changed
    pub fn luns_changed() -> Self {
        SenseData::new(sense_key::UNIT_ATTENTION, 0x3F, 0x0E)
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        data[7] = 10;
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }

    /// Parse fixed or descriptor format sense data
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let response_code = bytes.first()? & 0x7F;
        match response_code {
            0x70 | 0x71 if bytes.len() >= 14 => {
                Some(SenseData::new(bytes[2] & 0x0F, bytes[12], bytes[13]))
            }
            0x72 | 0x73 if bytes.len() >= 4 => {
                Some(SenseData::new(bytes[1] & 0x0F, bytes[2], bytes[3]))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lun_encoding_single_level() {
        assert_eq!(ScsiLun::from_u64(0).0, [0u8; 8]);
        assert_eq!(ScsiLun::from_u64(1).0, [0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(ScsiLun::from_u64(0x4005).0, [0x40, 0x05, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_lun_encoding_multi_level() {
        let lun = ScsiLun::from_u64(0x0002_0001);
        assert_eq!(lun.0, [0, 1, 0, 2, 0, 0, 0, 0]);
        assert_eq!(lun.to_u64(), 0x0002_0001);
        assert_eq!(ScsiLun::from(16383u64).to_u64(), 16383);
    }

    #[test]
    fn test_queue_type_from_tag() {
        assert_eq!(QueueType::from(TagMessage::None), QueueType::Untagged);
        assert_eq!(QueueType::from(TagMessage::Simple), QueueType::Simple);
        assert_eq!(QueueType::from(TagMessage::Ordered), QueueType::Ordered);
        assert_eq!(QueueType::from(TagMessage::HeadOfQueue), QueueType::HeadOfQueue);
    }

    #[test]
    fn test_sense_data_serialization() {
        let bytes = SenseData::new(sense_key::ILLEGAL_REQUEST, 0x24, 0x00).to_bytes();
        assert_eq!(bytes.len(), 18);
        assert_eq!(bytes[0], 0x70);
        assert_eq!(bytes[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(bytes[12], 0x24);
    }

    #[test]
    fn test_sense_data_parse() {
        let sense = SenseData::luns_changed();
        assert_eq!(SenseData::parse(&sense.to_bytes()), Some(sense));
        assert_eq!(
            SenseData::parse(&[0x72, 0x06, 0x29, 0x00]),
            Some(SenseData::new(sense_key::UNIT_ATTENTION, 0x29, 0x00))
        );
        assert_eq!(SenseData::parse(&[]), None);
        assert_eq!(SenseData::parse(&[0x70, 0, 0]), None);
    }
}
