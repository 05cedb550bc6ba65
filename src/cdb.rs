//! Command Descriptor Block decoding
//!
//! A CDB's length, logical block address, declared transfer length and
//! transfer direction all follow from the opcode's command group (the top
//! three bits of byte 0), with a handful of per-opcode exceptions.

use byteorder::{BigEndian, ByteOrder};

/// SCSI command opcodes handled by the disk and CD-ROM personalities
pub mod opcode {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const READ_6: u8 = 0x08;
    pub const WRITE_6: u8 = 0x0a;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SELECT: u8 = 0x15;
    pub const RESERVE: u8 = 0x16;
    pub const RELEASE: u8 = 0x17;
    pub const MODE_SENSE: u8 = 0x1a;
    pub const START_STOP: u8 = 0x1b;
    pub const ALLOW_MEDIUM_REMOVAL: u8 = 0x1e;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
    pub const SEEK_10: u8 = 0x2b;
    pub const WRITE_VERIFY_10: u8 = 0x2e;
    pub const VERIFY_10: u8 = 0x2f;
    pub const SYNCHRONIZE_CACHE: u8 = 0x35;
    pub const WRITE_SAME_10: u8 = 0x41;
    pub const READ_TOC: u8 = 0x43;
    pub const GET_CONFIGURATION: u8 = 0x46;
    pub const GET_EVENT_STATUS_NOTIFICATION: u8 = 0x4a;
    pub const READ_DISC_INFORMATION: u8 = 0x51;
    pub const MODE_SELECT_10: u8 = 0x55;
    pub const RESERVE_10: u8 = 0x56;
    pub const RELEASE_10: u8 = 0x57;
    pub const MODE_SENSE_10: u8 = 0x5a;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8a;
    pub const WRITE_VERIFY_16: u8 = 0x8e;
    pub const VERIFY_16: u8 = 0x8f;
    pub const WRITE_SAME_16: u8 = 0x93;
    pub const SERVICE_ACTION_IN_16: u8 = 0x9e;
    pub const REPORT_LUNS: u8 = 0xa0;
    pub const READ_12: u8 = 0xa8;
    pub const WRITE_12: u8 = 0xaa;
    pub const READ_DVD_STRUCTURE: u8 = 0xad;
    pub const WRITE_VERIFY_12: u8 = 0xae;
    pub const VERIFY_12: u8 = 0xaf;
    pub const MECHANISM_STATUS: u8 = 0xbd;
}

/// READ CAPACITY(16) service action under SERVICE ACTION IN(16)
pub const SAI_READ_CAPACITY_16: u8 = 0x10;

/// Transfer direction declared by a decoded command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferMode {
    /// No data phase
    None,
    /// Device to initiator (reads, synthesized responses)
    FromDev,
    /// Initiator to device (writes, mode select)
    ToDev,
}

/// A decoded Command Descriptor Block
#[derive(Debug, Clone)]
pub struct Cdb {
    /// Raw CDB bytes, truncated to the command-group length
    pub buf: Vec<u8>,
    /// Logical block address in device blocks
    pub lba: u64,
    /// Declared transfer length in bytes
    pub xfer: usize,
    /// Transfer direction
    pub mode: XferMode,
}

fn cdb_group_length(op: u8) -> Option<usize> {
    match op >> 5 {
        0 => Some(6),
        1 | 2 => Some(10),
        4 => Some(16),
        5 => Some(12),
        _ => None,
    }
}

impl Cdb {
    pub fn opcode(&self) -> u8 {
        self.buf[0]
    }

    /// Decode a raw CDB for a device with the given logical block size.
    ///
    /// Unknown opcodes in a known command group still decode (the command
    /// dispatch rejects them with INVALID OPCODE); an unknown group yields
    /// a zero-transfer decode that takes the same rejection path.
    pub fn parse(raw: &[u8], blocksize: u32) -> Cdb {
        if raw.is_empty() {
            return Cdb {
                buf: vec![0],
                lba: 0,
                xfer: 0,
                mode: XferMode::None,
            };
        }

        let op = raw[0];
        let len = match cdb_group_length(op) {
            Some(l) if raw.len() >= l => l,
            _ => {
                return Cdb {
                    buf: raw.to_vec(),
                    lba: 0,
                    xfer: 0,
                    mode: XferMode::None,
                };
            }
        };
        let buf = raw[..len].to_vec();

        let lba = match op >> 5 {
            0 => (((buf[1] as u64) & 0x1f) << 16) | ((buf[2] as u64) << 8) | buf[3] as u64,
            1 | 2 | 5 => BigEndian::read_u32(&buf[2..6]) as u64,
            4 => BigEndian::read_u64(&buf[2..10]),
            _ => 0,
        };

        // Allocation / transfer length by group, then per-opcode fixups.
        let mut xfer: usize = match op >> 5 {
            0 => buf[4] as usize,
            1 | 2 => BigEndian::read_u16(&buf[7..9]) as usize,
            4 => BigEndian::read_u32(&buf[10..14]) as usize,
            5 => BigEndian::read_u32(&buf[6..10]) as usize,
            _ => 0,
        };

        match op {
            opcode::TEST_UNIT_READY
            | opcode::START_STOP
            | opcode::SEEK_10
            | opcode::ALLOW_MEDIUM_REMOVAL
            | opcode::RESERVE
            | opcode::RESERVE_10
            | opcode::RELEASE
            | opcode::RELEASE_10
            | opcode::SYNCHRONIZE_CACHE => {
                xfer = 0;
            }
            opcode::INQUIRY => {
                xfer = BigEndian::read_u16(&buf[3..5]) as usize;
            }
            opcode::READ_CAPACITY_10 => {
                xfer = 8;
            }
            opcode::READ_6 | opcode::WRITE_6 => {
                // A transfer length of zero means 256 blocks.
                if xfer == 0 {
                    xfer = 256;
                }
                xfer *= blocksize as usize;
            }
            opcode::READ_10
            | opcode::READ_12
            | opcode::READ_16
            | opcode::WRITE_10
            | opcode::WRITE_12
            | opcode::WRITE_16
            | opcode::WRITE_VERIFY_10
            | opcode::WRITE_VERIFY_12
            | opcode::WRITE_VERIFY_16
            | opcode::VERIFY_10
            | opcode::VERIFY_12
            | opcode::VERIFY_16 => {
                xfer *= blocksize as usize;
            }
            opcode::WRITE_SAME_10 | opcode::WRITE_SAME_16 => {
                // One block of pattern data accompanies the command.
                xfer = blocksize as usize;
            }
            opcode::READ_DVD_STRUCTURE | opcode::MECHANISM_STATUS => {
                xfer = BigEndian::read_u16(&buf[8..10]) as usize;
            }
            _ => {}
        }

        let mode = match op {
            opcode::WRITE_6
            | opcode::WRITE_10
            | opcode::WRITE_12
            | opcode::WRITE_16
            | opcode::WRITE_VERIFY_10
            | opcode::WRITE_VERIFY_12
            | opcode::WRITE_VERIFY_16
            | opcode::VERIFY_10
            | opcode::VERIFY_12
            | opcode::VERIFY_16
            | opcode::MODE_SELECT
            | opcode::MODE_SELECT_10
            | opcode::WRITE_SAME_10
            | opcode::WRITE_SAME_16 => XferMode::ToDev,
            _ if xfer > 0 => XferMode::FromDev,
            _ => XferMode::None,
        };

        Cdb {
            buf,
            lba,
            xfer,
            mode,
        }
    }

    /// Forced Unit Access: commit to media before command completion.
    ///
    /// VERIFY and WRITE AND VERIFY imply it; the 10/12/16-byte READ/WRITE
    /// variants carry it in byte 1 bit 3. READ(6)/WRITE(6) have no FUA.
    pub fn is_fua(&self) -> bool {
        match self.buf[0] {
            opcode::READ_10
            | opcode::READ_12
            | opcode::READ_16
            | opcode::WRITE_10
            | opcode::WRITE_12
            | opcode::WRITE_16 => (self.buf[1] & 8) != 0,
            opcode::VERIFY_10
            | opcode::VERIFY_12
            | opcode::VERIFY_16
            | opcode::WRITE_VERIFY_10
            | opcode::WRITE_VERIFY_12
            | opcode::WRITE_VERIFY_16 => true,
            _ => false,
        }
    }

    /// Transfer length in device blocks for the read/write/verify family.
    pub fn blocks(&self, blocksize: u32) -> u32 {
        (self.xfer / blocksize as usize) as u32
    }
}
