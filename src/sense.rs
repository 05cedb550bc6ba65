//! SCSI sense data and status codes
//!
//! Sense codes are the (key, asc, ascq) triples a target attaches to a
//! CHECK CONDITION status. This module carries the taxonomy used by the
//! emulated disk and CD-ROM personalities and the fixed/descriptor
//! serialization formats from SPC-3 section 4.5.

/// SCSI status codes
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
}

/// SCSI sense key codes
pub mod key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const ABORTED_COMMAND: u8 = 0x0b;
}

/// A (key, asc, ascq) sense triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseCode {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseCode {
    pub const fn new(key: u8, asc: u8, ascq: u8) -> Self {
        SenseCode { key, asc, ascq }
    }

    /// Serialize to the fixed format (18 bytes, response code 0x70)
    pub fn to_fixed(self) -> Vec<u8> {
        let mut buf = vec![0u8; 18];
        buf[0] = 0x70;
        buf[2] = self.key & 0x0f;
        buf[7] = 10; // additional sense length
        buf[12] = self.asc;
        buf[13] = self.ascq;
        buf
    }

    /// Serialize to the descriptor format (8 bytes, response code 0x72)
    pub fn to_descriptor(self) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        buf[0] = 0x72;
        buf[1] = self.key & 0x0f;
        buf[2] = self.asc;
        buf[3] = self.ascq;
        buf
    }
}

/// Serialize a sense code in the format the initiator asked for.
///
/// `fixed` selects the 18-byte fixed format; otherwise the 8-byte
/// descriptor format is produced.
pub fn build_sense(sense: SenseCode, fixed: bool) -> Vec<u8> {
    if fixed {
        sense.to_fixed()
    } else {
        sense.to_descriptor()
    }
}

/// No sense pending
pub const NO_SENSE: SenseCode = SenseCode::new(key::NO_SENSE, 0x00, 0x00);

/// LUN not ready, medium not present
pub const NO_MEDIUM: SenseCode = SenseCode::new(key::NOT_READY, 0x3a, 0x00);

/// LUN not ready, cause not reportable
pub const LUN_NOT_READY: SenseCode = SenseCode::new(key::NOT_READY, 0x04, 0x00);

/// LUN not ready, medium removal prevented
pub const NOT_READY_REMOVAL_PREVENTED: SenseCode = SenseCode::new(key::NOT_READY, 0x53, 0x02);

/// Hardware error, internal target failure
pub const TARGET_FAILURE: SenseCode = SenseCode::new(key::HARDWARE_ERROR, 0x44, 0x00);

/// Illegal request, invalid command operation code
pub const INVALID_OPCODE: SenseCode = SenseCode::new(key::ILLEGAL_REQUEST, 0x20, 0x00);

/// Illegal request, LBA out of range
pub const LBA_OUT_OF_RANGE: SenseCode = SenseCode::new(key::ILLEGAL_REQUEST, 0x21, 0x00);

/// Illegal request, invalid field in CDB
pub const INVALID_FIELD: SenseCode = SenseCode::new(key::ILLEGAL_REQUEST, 0x24, 0x00);

/// Illegal request, saving parameters not supported
pub const SAVING_PARAMS_NOT_SUPPORTED: SenseCode = SenseCode::new(key::ILLEGAL_REQUEST, 0x39, 0x00);

/// Illegal request, medium removal prevented
pub const ILLEGAL_REQ_REMOVAL_PREVENTED: SenseCode = SenseCode::new(key::ILLEGAL_REQUEST, 0x53, 0x02);

/// Aborted command, I/O process terminated
pub const IO_ERROR: SenseCode = SenseCode::new(key::ABORTED_COMMAND, 0x00, 0x06);

/// Unit attention, power on, reset or bus device reset occurred
pub const RESET: SenseCode = SenseCode::new(key::UNIT_ATTENTION, 0x29, 0x00);

/// Unit attention, no medium
pub const UNIT_ATTENTION_NO_MEDIUM: SenseCode = SenseCode::new(key::UNIT_ATTENTION, 0x3a, 0x00);

/// Unit attention, medium changed
pub const MEDIUM_CHANGED: SenseCode = SenseCode::new(key::UNIT_ATTENTION, 0x28, 0x00);

/// Not ready, incompatible medium format
pub const INCOMPATIBLE_FORMAT: SenseCode = SenseCode::new(key::NOT_READY, 0x30, 0x00);
