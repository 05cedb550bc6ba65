//! Synthesized responses for non-data-bearing and metadata commands
//!
//! Everything here assembles a response into the request's bounce buffer
//! and returns its length, or a sense code describing why the command
//! cannot be served. All multi-byte fields are big-endian. Offsets follow
//! SPC-3 for INQUIRY/MODE SENSE/READ CAPACITY and MMC-3 for the CD-ROM
//! command set.

use byteorder::{BigEndian, ByteOrder};

use crate::cdb::{opcode, Cdb, SAI_READ_CAPACITY_16};
use crate::device::{DeviceKind, ScsiDisk};
use crate::sense::{self, SenseCode};

/// Largest standard INQUIRY response we produce
pub const SCSI_MAX_INQUIRY_LEN: usize = 256;

/// Red-Book capacity ceiling (80 min) in 512-byte sectors; anything larger
/// is reported as a DVD profile.
const CD_MAX_SECTORS: u64 = 80 * 60 * 75 * 4;

const MMC_PROFILE_CD_ROM: u16 = 0x0008;
const MMC_PROFILE_DVD_ROM: u16 = 0x0010;

// GET EVENT STATUS NOTIFICATION media class and event codes
const GESN_MEDIA: u8 = 4;
const MS_TRAY_OPEN: u8 = 1;
const MS_MEDIA_PRESENT: u8 = 2;
const MEC_NO_CHANGE: u8 = 0;
const MEC_EJECT_REQUESTED: u8 = 1;
const MEC_NEW_MEDIA: u8 = 2;

/// MODE SENSE page codes
pub mod mode_page {
    pub const R_W_ERROR: u8 = 0x01;
    pub const HD_GEOMETRY: u8 = 0x04;
    pub const FLEXIBLE_DISK_GEOMETRY: u8 = 0x05;
    pub const CACHING: u8 = 0x08;
    pub const AUDIO_CTL: u8 = 0x0e;
    pub const CAPABILITIES: u8 = 0x2a;
    pub const ALL_PAGES: u8 = 0x3f;
}

fn peripheral_type(kind: DeviceKind) -> u8 {
    match kind {
        DeviceKind::Rom => 5,
        _ => 0,
    }
}

fn media_is_dvd(dev: &ScsiDisk) -> bool {
    dev.kind() == DeviceKind::Rom
        && dev.backend().borrow().is_inserted()
        && dev.backend().borrow().get_geometry() > CD_MAX_SECTORS
}

fn media_is_cd(dev: &ScsiDisk) -> bool {
    dev.kind() == DeviceKind::Rom
        && dev.backend().borrow().is_inserted()
        && dev.backend().borrow().get_geometry() <= CD_MAX_SECTORS
}

/// Dispatch one emulated command, writing the response into `outbuf`.
///
/// Returns the response length (already capped at the declared allocation
/// length) or the sense to fail with.
pub(crate) fn execute(
    dev: &ScsiDisk,
    cmd: &Cdb,
    tcq: bool,
    outbuf: &mut [u8],
) -> Result<usize, SenseCode> {
    let buflen = match cmd.opcode() {
        opcode::TEST_UNIT_READY => 0,
        opcode::INQUIRY => emulate_inquiry(dev, cmd, tcq, outbuf)?,
        opcode::MODE_SENSE | opcode::MODE_SENSE_10 => emulate_mode_sense(dev, cmd, outbuf)?,
        opcode::READ_TOC => emulate_read_toc(dev, cmd, outbuf)?,
        opcode::RESERVE | opcode::RELEASE => {
            if cmd.buf[1] & 1 != 0 {
                return Err(sense::INVALID_FIELD);
            }
            0
        }
        opcode::RESERVE_10 | opcode::RELEASE_10 => {
            if cmd.buf[1] & 3 != 0 {
                return Err(sense::INVALID_FIELD);
            }
            0
        }
        opcode::START_STOP => {
            emulate_start_stop(dev, cmd)?;
            0
        }
        opcode::ALLOW_MEDIUM_REMOVAL => {
            let locked = cmd.buf[4] & 1 != 0;
            dev.set_tray_locked(locked);
            dev.backend().borrow_mut().lock_medium(locked);
            0
        }
        opcode::READ_CAPACITY_10 => emulate_read_capacity_10(dev, cmd, outbuf)?,
        opcode::SERVICE_ACTION_IN_16 => {
            if cmd.buf[1] & 0x1f == SAI_READ_CAPACITY_16 {
                emulate_read_capacity_16(dev, cmd, outbuf)?
            } else {
                log::debug!("unsupported service action 0x{:02x}", cmd.buf[1] & 0x1f);
                return Err(sense::INVALID_FIELD);
            }
        }
        opcode::REQUEST_SENSE => {
            let fixed = cmd.buf[1] & 1 == 0;
            let payload = sense::build_sense(dev.pending_sense().unwrap_or(sense::NO_SENSE), fixed);
            outbuf[..payload.len()].copy_from_slice(&payload);
            payload.len()
        }
        opcode::MECHANISM_STATUS => {
            require_rom(dev)?;
            outbuf[..8].fill(0);
            outbuf[5] = 1; // one CD-ROM changer slot
            8
        }
        opcode::GET_CONFIGURATION => emulate_get_configuration(dev, outbuf)?,
        opcode::GET_EVENT_STATUS_NOTIFICATION => emulate_event_status(dev, cmd, outbuf)?,
        opcode::READ_DISC_INFORMATION => emulate_read_disc_information(dev, cmd, outbuf)?,
        opcode::READ_DVD_STRUCTURE => emulate_read_dvd_structure(dev, cmd, outbuf)?,
        _ => return Err(sense::INVALID_OPCODE),
    };
    Ok(buflen.min(cmd.xfer))
}

fn require_rom(dev: &ScsiDisk) -> Result<(), SenseCode> {
    if dev.kind() != DeviceKind::Rom {
        return Err(sense::INVALID_OPCODE);
    }
    Ok(())
}

fn copy_padded(dst: &mut [u8], src: &str) {
    dst.fill(b' ');
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

fn emulate_inquiry(
    dev: &ScsiDisk,
    cmd: &Cdb,
    tcq: bool,
    outbuf: &mut [u8],
) -> Result<usize, SenseCode> {
    if cmd.buf[1] & 0x1 != 0 {
        return emulate_inquiry_vpd(dev, cmd, outbuf);
    }

    // Standard INQUIRY data; a nonzero page code without EVPD is invalid.
    if cmd.buf[2] != 0 {
        return Err(sense::INVALID_FIELD);
    }

    let buflen = cmd.xfer.min(SCSI_MAX_INQUIRY_LEN);
    outbuf[..buflen].fill(0);
    if buflen < 36 {
        log::debug!("inquiry allocation length {} below standard 36", buflen);
    }

    let slice = &mut outbuf[..36.max(buflen)];
    slice[0] = peripheral_type(dev.kind()) & 0x1f;
    slice[1] = if dev.is_removable() { 0x80 } else { 0 };
    copy_padded(&mut slice[8..16], "QEMU");
    match dev.kind() {
        DeviceKind::Rom => copy_padded(&mut slice[16..32], "QEMU CD-ROM"),
        _ => copy_padded(&mut slice[16..32], "QEMU HARDDISK"),
    }
    slice[32..36].fill(0);
    let rev = dev.version();
    let n = rev.len().min(4);
    slice[32..32 + n].copy_from_slice(&rev.as_bytes()[..n]);

    // SPC-3 conformance so guests ask for READ CAPACITY(16) and the
    // block-limits VPD page; not all of SPC-3 is implemented.
    slice[2] = 5;
    slice[3] = 2; // response data format 2

    if buflen > 36 {
        slice[4] = (buflen - 5) as u8;
    } else {
        // Additional length is not adjusted for short allocation lengths.
        slice[4] = 36 - 5;
    }

    // Sync data transfer, plus command queuing when the bus supports it.
    slice[7] = 0x10 | if tcq { 0x02 } else { 0 };
    Ok(buflen)
}

fn emulate_inquiry_vpd(dev: &ScsiDisk, cmd: &Cdb, outbuf: &mut [u8]) -> Result<usize, SenseCode> {
    let page_code = cmd.buf[2];
    outbuf[0] = peripheral_type(dev.kind()) & 0x1f;
    outbuf[1] = page_code;
    outbuf[2] = 0x00;
    outbuf[3] = 0x00;
    let start = 4;
    let mut buflen = start;

    match page_code {
        0x00 => {
            // Supported page codes, mandatory
            outbuf[buflen] = 0x00;
            buflen += 1;
            if dev.serial().is_some() {
                outbuf[buflen] = 0x80;
                buflen += 1;
            }
            outbuf[buflen] = 0x83;
            buflen += 1;
            if dev.kind() == DeviceKind::Disk {
                outbuf[buflen] = 0xb0;
                buflen += 1;
                outbuf[buflen] = 0xb2;
                buflen += 1;
            }
        }
        0x80 => {
            // Unit serial number, only present when configured
            let serial = dev.serial().ok_or(sense::INVALID_FIELD)?;
            let l = serial.len().min(20);
            outbuf[buflen..buflen + l].copy_from_slice(&serial.as_bytes()[..l]);
            buflen += l;
        }
        0x83 => {
            // Device identification: an ASCII designator, then the NAA
            // binary designator when a WWN is assigned.
            let name;
            let (id, max_len) = match dev.serial() {
                Some(s) => (s, 20),
                None => {
                    name = dev.backend().borrow().device_name();
                    (name.as_str(), 255 - 8)
                }
            };
            let id_len = id.len().min(max_len);

            outbuf[buflen] = 0x2; // ASCII
            outbuf[buflen + 1] = 0; // not officially assigned
            outbuf[buflen + 2] = 0;
            outbuf[buflen + 3] = id_len as u8;
            buflen += 4;
            outbuf[buflen..buflen + id_len].copy_from_slice(&id.as_bytes()[..id_len]);
            buflen += id_len;

            if dev.wwn() != 0 {
                outbuf[buflen] = 0x1; // binary
                outbuf[buflen + 1] = 0x3; // NAA
                outbuf[buflen + 2] = 0;
                outbuf[buflen + 3] = 8;
                buflen += 4;
                BigEndian::write_u64(&mut outbuf[buflen..buflen + 8], dev.wwn());
                buflen += 8;
            }
        }
        0xb0 => {
            // Block limits; not defined for CD-ROM
            if dev.kind() == DeviceKind::Rom {
                return Err(sense::INVALID_FIELD);
            }
            let blocksize = dev.blocksize();
            let unmap_sectors = dev.discard_granularity() / blocksize;
            let min_io_size = dev.min_io_size() / blocksize;
            let opt_io_size = dev.opt_io_size() / blocksize;

            buflen = 0x40;
            outbuf[4..buflen].fill(0);

            // optimal transfer length granularity
            BigEndian::write_u16(&mut outbuf[6..8], min_io_size as u16);
            // optimal transfer length
            BigEndian::write_u32(&mut outbuf[12..16], opt_io_size);
            // optimal unmap granularity
            BigEndian::write_u32(&mut outbuf[28..32], unmap_sectors);
        }
        0xb2 => {
            // Thin provisioning
            buflen = 8;
            outbuf[4] = 0;
            outbuf[5] = 0x60; // WRITE SAME(10/16) with UNMAP supported
            outbuf[6] = if dev.discard_granularity() > 0 { 2 } else { 1 };
            outbuf[7] = 0;
        }
        _ => {
            log::debug!("unsupported VPD page 0x{:02x}", page_code);
            return Err(sense::INVALID_FIELD);
        }
    }

    debug_assert!(buflen - start <= 255);
    outbuf[start - 1] = (buflen - start) as u8;
    Ok(buflen)
}

/// Append one mode page at `p`, honoring the page-control field.
/// Returns `None` when the page is not valid for the personality.
fn mode_sense_page(dev: &ScsiDisk, page: u8, p: &mut [u8], page_control: u8) -> Option<usize> {
    let kind = dev.kind();
    let valid = match page {
        mode_page::HD_GEOMETRY | mode_page::FLEXIBLE_DISK_GEOMETRY => kind == DeviceKind::Disk,
        mode_page::CACHING | mode_page::R_W_ERROR => {
            kind == DeviceKind::Disk || kind == DeviceKind::Rom
        }
        mode_page::AUDIO_CTL | mode_page::CAPABILITIES => kind == DeviceKind::Rom,
        _ => false,
    };
    if !valid {
        return None;
    }

    let (cyls, heads, secs) = dev.geometry_hints();
    p[0] = page;

    // Changeable-values requests get the page header over a zeroed body:
    // MODE SELECT cannot change anything here.
    match page {
        mode_page::HD_GEOMETRY => {
            p[1] = 0x16;
            if page_control == 1 {
                return Some(p[1] as usize + 2);
            }
            p[2] = (cyls >> 16) as u8;
            p[3] = (cyls >> 8) as u8;
            p[4] = cyls as u8;
            p[5] = heads as u8;
            // Write precompensation start cylinder, disabled
            p[6] = (cyls >> 16) as u8;
            p[7] = (cyls >> 8) as u8;
            p[8] = cyls as u8;
            // Reduced current start cylinder, disabled
            p[9] = (cyls >> 16) as u8;
            p[10] = (cyls >> 8) as u8;
            p[11] = cyls as u8;
            // Device step rate [ns], 200ns
            p[12] = 0;
            p[13] = 200;
            // Landing zone cylinder
            p[14] = 0xff;
            p[15] = 0xff;
            p[16] = 0xff;
            // Medium rotation rate [rpm], 5400 rpm
            BigEndian::write_u16(&mut p[20..22], 5400);
        }
        mode_page::FLEXIBLE_DISK_GEOMETRY => {
            p[1] = 0x1e;
            if page_control == 1 {
                return Some(p[1] as usize + 2);
            }
            // Transfer rate [kbit/s], 5 Mbit/s
            BigEndian::write_u16(&mut p[2..4], 5000);
            p[4] = heads as u8;
            p[5] = secs as u8;
            p[6] = (dev.blocksize() >> 8) as u8;
            p[8] = (cyls >> 8) as u8;
            p[9] = cyls as u8;
            // Write precompensation start cylinder, disabled
            p[10] = (cyls >> 8) as u8;
            p[11] = cyls as u8;
            // Reduced current start cylinder, disabled
            p[12] = (cyls >> 8) as u8;
            p[13] = cyls as u8;
            // Device step rate [100us], 100us
            p[14] = 0;
            p[15] = 1;
            // Device step pulse width [us], 1us
            p[16] = 1;
            // Device head settle delay [100us], 100us
            p[17] = 0;
            p[18] = 1;
            // Motor on delay [0.1s], 0.1s
            p[19] = 1;
            // Motor off delay [0.1s], 0.1s
            p[20] = 1;
            // Medium rotation rate [rpm], 5400 rpm
            BigEndian::write_u16(&mut p[28..30], 5400);
        }
        mode_page::CACHING => {
            p[1] = 0x12;
            if page_control == 1 {
                return Some(p[1] as usize + 2);
            }
            if dev.backend().borrow().enable_write_cache() {
                p[2] = 4; // WCE
            }
        }
        mode_page::R_W_ERROR => {
            p[1] = 10;
            if page_control == 1 {
                return Some(p[1] as usize + 2);
            }
            p[2] = 0x80; // automatic write reallocation enabled
            if dev.kind() == DeviceKind::Rom {
                p[3] = 0x20; // read retry count
            }
        }
        mode_page::AUDIO_CTL => {
            p[1] = 14;
        }
        mode_page::CAPABILITIES => {
            p[1] = 0x14;
            if page_control == 1 {
                return Some(p[1] as usize + 2);
            }
            p[2] = 0x3b; // CD-R and CD-RW read
            p[3] = 0; // writing not supported
            p[4] = 0x7f; // audio, composite, digital out, mode 2 form 1&2, multi session
            p[5] = 0xff; // CD-DA, DA accurate, RW supported and corrected, C2, ISRC, UPC, bar code
            p[6] = 0x2d | if dev.is_medium_locked() { 2 } else { 0 };
            // locking supported, jumper present, eject, tray
            p[7] = 0; // no volume and mute control, no changer
            BigEndian::write_u16(&mut p[8..10], 50 * 176); // 50x read speed
            BigEndian::write_u16(&mut p[10..12], 2); // two volume levels
            BigEndian::write_u16(&mut p[12..14], 2048); // 2M buffer
            BigEndian::write_u16(&mut p[14..16], 16 * 176); // 16x read speed current
            BigEndian::write_u16(&mut p[18..20], 16 * 176); // 16x write speed
            BigEndian::write_u16(&mut p[20..22], 16 * 176); // 16x write speed current
        }
        _ => unreachable!(),
    }

    Some(p[1] as usize + 2)
}

fn emulate_mode_sense(dev: &ScsiDisk, cmd: &Cdb, outbuf: &mut [u8]) -> Result<usize, SenseCode> {
    let six = cmd.opcode() == opcode::MODE_SENSE;
    let mut dbd = cmd.buf[1] & 0x8 != 0;
    let page = cmd.buf[2] & 0x3f;
    let page_control = (cmd.buf[2] & 0xc0) >> 6;
    log::debug!(
        "mode sense({}) page 0x{:02x} pc {} xfer {}",
        if six { 6 } else { 10 },
        page,
        page_control,
        cmd.xfer
    );

    let dev_specific_param = if dev.kind() == DeviceKind::Disk {
        let mut param = if dev.dpofua() { 0x10 } else { 0 };
        if dev.backend().borrow().is_read_only() {
            param |= 0x80;
        }
        param
    } else {
        // MMC prescribes no block descriptors and no device-specific
        // parameter for CD/DVD drives.
        dbd = true;
        0x00
    };

    let mut off;
    if six {
        outbuf[..4].fill(0);
        outbuf[2] = dev_specific_param;
        off = 4;
    } else {
        outbuf[..8].fill(0);
        outbuf[3] = dev_specific_param;
        off = 8;
    }

    let mut nb_sectors = dev.backend().borrow().get_geometry();
    if !dbd && nb_sectors > 0 {
        if six {
            outbuf[3] = 8; // block descriptor length
        } else {
            outbuf[7] = 8;
        }
        nb_sectors /= (dev.blocksize() / 512) as u64;
        if nb_sectors > 0xffffff {
            nb_sectors = 0;
        }
        let p = &mut outbuf[off..off + 8];
        p.fill(0);
        p[1] = (nb_sectors >> 16) as u8;
        p[2] = (nb_sectors >> 8) as u8;
        p[3] = nb_sectors as u8;
        // bytes 5-7 are the sector size
        p[6] = (dev.blocksize() >> 8) as u8;
        off += 8;
    }

    if page_control == 3 {
        return Err(sense::SAVING_PARAMS_NOT_SUPPORTED);
    }

    if page == mode_page::ALL_PAGES {
        for pg in 0..=0x3e {
            if let Some(n) = mode_sense_page(dev, pg, &mut outbuf[off..], page_control) {
                off += n;
            }
        }
    } else {
        match mode_sense_page(dev, page, &mut outbuf[off..], page_control) {
            Some(n) => off += n,
            None => return Err(sense::INVALID_FIELD),
        }
    }

    // The mode data length field does not include itself.
    let buflen = off;
    if six {
        outbuf[0] = (buflen - 1) as u8;
    } else {
        BigEndian::write_u16(&mut outbuf[0..2], (buflen - 2) as u16);
    }
    Ok(buflen.min(cmd.xfer))
}

fn lba_to_msf(out: &mut [u8], lba: u64) {
    let lba = lba + 150; // 2-second pregap
    out[0] = ((lba / 75) / 60) as u8;
    out[1] = ((lba / 75) % 60) as u8;
    out[2] = (lba % 75) as u8;
}

/// Single-track table of contents (READ TOC format 0).
fn cdrom_read_toc(nb_sectors: u64, msf: bool, start_track: u8, out: &mut [u8]) -> Option<usize> {
    if start_track > 1 && start_track != 0xaa {
        return None;
    }
    let mut q = 2;
    out[q] = 1; // first track
    out[q + 1] = 1; // last track
    q += 2;
    if start_track <= 1 {
        out[q] = 0; // reserved
        out[q + 1] = 0x14; // ADR, control
        out[q + 2] = 1; // track number
        out[q + 3] = 0; // reserved
        q += 4;
        if msf {
            out[q] = 0;
            lba_to_msf(&mut out[q + 1..q + 4], 0);
        } else {
            BigEndian::write_u32(&mut out[q..q + 4], 0);
        }
        q += 4;
    }
    // lead-out track
    out[q] = 0;
    out[q + 1] = 0x16;
    out[q + 2] = 0xaa;
    out[q + 3] = 0;
    q += 4;
    if msf {
        out[q] = 0;
        lba_to_msf(&mut out[q + 1..q + 4], nb_sectors);
    } else {
        BigEndian::write_u32(&mut out[q..q + 4], nb_sectors as u32);
    }
    q += 4;
    BigEndian::write_u16(&mut out[0..2], (q - 2) as u16);
    Some(q)
}

/// Raw session table of contents (READ TOC format 2): lead-in points
/// A0/A1 naming the first and last track, then the A2 lead-out.
fn cdrom_read_toc_raw(nb_sectors: u64, msf: bool, out: &mut [u8]) -> usize {
    let mut q = 2;
    out[q] = 1; // first session
    out[q + 1] = 1; // last session
    q += 2;

    for point in [0xa0u8, 0xa1] {
        out[q] = 1; // session number
        out[q + 1] = 0x14; // data track
        out[q + 2] = 0; // track number
        out[q + 3] = point;
        out[q + 4] = 0; // min
        out[q + 5] = 0; // sec
        out[q + 6] = 0; // frame
        out[q + 7] = 0;
        out[q + 8] = 1; // first/last track number
        out[q + 9] = 0;
        out[q + 10] = 0;
        q += 11;
    }

    out[q] = 1; // session number
    out[q + 1] = 0x14; // data track
    out[q + 2] = 0; // track number
    out[q + 3] = 0xa2; // lead-out
    out[q + 4] = 0; // min
    out[q + 5] = 0; // sec
    out[q + 6] = 0; // frame
    q += 7;
    if msf {
        out[q] = 0;
        lba_to_msf(&mut out[q + 1..q + 4], nb_sectors);
    } else {
        BigEndian::write_u32(&mut out[q..q + 4], nb_sectors as u32);
    }
    q += 4;

    BigEndian::write_u16(&mut out[0..2], (q - 2) as u16);
    q
}

fn emulate_read_toc(dev: &ScsiDisk, cmd: &Cdb, outbuf: &mut [u8]) -> Result<usize, SenseCode> {
    require_rom(dev)?;
    let msf = cmd.buf[1] & 2 != 0;
    let format = cmd.buf[2] & 0xf;
    let start_track = cmd.buf[6];
    let nb_sectors = dev.backend().borrow().get_geometry() / (dev.blocksize() / 512) as u64;
    log::debug!("read TOC track {} format {} msf {}", start_track, format, msf);

    match format {
        0 => cdrom_read_toc(nb_sectors, msf, start_track, outbuf).ok_or(sense::INVALID_FIELD),
        1 => {
            // multi session: only a single session defined
            outbuf[..12].fill(0);
            outbuf[1] = 0x0a;
            outbuf[2] = 0x01;
            outbuf[3] = 0x01;
            Ok(12)
        }
        2 => Ok(cdrom_read_toc_raw(nb_sectors, msf, outbuf)),
        _ => Err(sense::INVALID_FIELD),
    }
}

fn emulate_start_stop(dev: &ScsiDisk, cmd: &Cdb) -> Result<(), SenseCode> {
    let start = cmd.buf[4] & 1 != 0;
    let loej = cmd.buf[4] & 2 != 0; // load on start, eject on stop

    if dev.kind() == DeviceKind::Rom && loej {
        if !start && !dev.is_tray_open() && dev.is_medium_locked() {
            return Err(if dev.backend().borrow().is_inserted() {
                sense::ILLEGAL_REQ_REMOVAL_PREVENTED
            } else {
                sense::NOT_READY_REMOVAL_PREVENTED
            });
        }
        if dev.is_tray_open() != !start {
            dev.backend().borrow_mut().eject(!start);
            dev.set_tray_open(!start);
        }
    }
    Ok(())
}

fn emulate_read_capacity_10(
    dev: &ScsiDisk,
    cmd: &Cdb,
    outbuf: &mut [u8],
) -> Result<usize, SenseCode> {
    outbuf[..8].fill(0);
    let mut nb_sectors = dev.backend().borrow().get_geometry();
    if nb_sectors == 0 {
        return Err(sense::LUN_NOT_READY);
    }
    // PMI clear requires a zero LBA field
    if cmd.buf[8] & 1 == 0 && cmd.lba != 0 {
        return Err(sense::INVALID_FIELD);
    }
    nb_sectors /= (dev.blocksize() / 512) as u64;
    // Returned value is the address of the last block.
    nb_sectors -= 1;
    // Remember the new size for read/write range checking.
    dev.set_max_lba(nb_sectors);
    // Clip to 2TB instead of returning the capacity modulo 2TB.
    let last = nb_sectors.min(u32::MAX as u64) as u32;
    BigEndian::write_u32(&mut outbuf[0..4], last);
    BigEndian::write_u32(&mut outbuf[4..8], dev.blocksize());
    Ok(8)
}

fn emulate_read_capacity_16(
    dev: &ScsiDisk,
    cmd: &Cdb,
    outbuf: &mut [u8],
) -> Result<usize, SenseCode> {
    log::debug!("SAI READ CAPACITY(16)");
    let zero_len = cmd.xfer.min(outbuf.len());
    outbuf[..zero_len].fill(0);
    let mut nb_sectors = dev.backend().borrow().get_geometry();
    if nb_sectors == 0 {
        return Err(sense::LUN_NOT_READY);
    }
    if cmd.buf[14] & 1 == 0 && cmd.lba != 0 {
        return Err(sense::INVALID_FIELD);
    }
    nb_sectors /= (dev.blocksize() / 512) as u64;
    nb_sectors -= 1;
    dev.set_max_lba(nb_sectors);
    BigEndian::write_u64(&mut outbuf[0..8], nb_sectors);
    BigEndian::write_u32(&mut outbuf[8..12], dev.blocksize());
    outbuf[13] = dev.physical_block_exp();

    // TPE bit when the backing store supports discard
    if dev.discard_granularity() > 0 {
        outbuf[14] = 0x80;
    }

    // Protection, exponent and lowest-LBA fields left blank.
    Ok(cmd.xfer)
}

fn emulate_read_disc_information(
    dev: &ScsiDisk,
    cmd: &Cdb,
    outbuf: &mut [u8],
) -> Result<usize, SenseCode> {
    require_rom(dev)?;
    // Data types 1 and 2 are only defined for Blu-Ray.
    let data_type = cmd.buf[1] & 7;
    if data_type != 0 {
        return Err(sense::INVALID_FIELD);
    }

    outbuf[..34].fill(0);
    outbuf[1] = 32;
    outbuf[2] = 0xe; // last session complete, disc finalized
    outbuf[3] = 1; // first track on disc
    outbuf[4] = 1; // number of sessions
    outbuf[5] = 1; // first track of last session
    outbuf[6] = 1; // last track of last session
    outbuf[7] = 0x20; // unrestricted use
    outbuf[8] = 0x00; // CD-ROM or DVD-ROM
    // remaining fields not meaningful for CD-ROM or DVD-ROM
    Ok(34)
}

/// Response sizes by READ DVD STRUCTURE format; zero means unsupported.
const RDS_CAPS_SIZE: [usize; 5] = [2048 + 4, 4 + 4, 0, 188 + 4, 2048 + 4];

fn emulate_read_dvd_structure(
    dev: &ScsiDisk,
    cmd: &Cdb,
    outbuf: &mut [u8],
) -> Result<usize, SenseCode> {
    require_rom(dev)?;
    let media = cmd.buf[1];
    let layer = cmd.buf[6];
    let format = cmd.buf[7];

    if media != 0 {
        return Err(sense::INVALID_FIELD);
    }

    let mut size = 0;
    if format != 0xff {
        if dev.is_tray_open() || !dev.backend().borrow().is_inserted() {
            return Err(sense::NO_MEDIUM);
        }
        if media_is_cd(dev) {
            return Err(sense::INCOMPATIBLE_FORMAT);
        }
        if format as usize >= RDS_CAPS_SIZE.len() {
            return Err(sense::INVALID_FIELD);
        }
        size = RDS_CAPS_SIZE[format as usize];
        outbuf[..size].fill(0);
    }

    match format {
        0x00 => {
            // Physical format information
            if layer != 0 {
                return Err(sense::INVALID_FIELD);
            }
            let nb_sectors = dev.backend().borrow().get_geometry();

            outbuf[4] = 1; // DVD-ROM, part version 1
            outbuf[5] = 0xf; // 120mm disc, minimum rate unspecified
            outbuf[6] = 1; // one layer, read-only
            outbuf[7] = 0; // default densities

            let end = ((nb_sectors >> 2) - 1) as u32;
            BigEndian::write_u32(&mut outbuf[12..16], end); // end sector
            BigEndian::write_u32(&mut outbuf[16..20], end); // layer 0 end sector
        }
        0x01 => {} // DVD copyright information, all zeros
        0x03 => return Err(sense::INVALID_FIELD), // no BCA information
        0x04 => {} // DVD disc manufacturing information, all zeros
        0xff => {
            // List capabilities: {format, readable, max size} per entry
            size = 4;
            for (i, caps) in RDS_CAPS_SIZE.iter().enumerate() {
                if *caps == 0 {
                    continue;
                }
                outbuf[size] = i as u8;
                outbuf[size + 1] = 0x40; // not writable, readable
                BigEndian::write_u16(&mut outbuf[size + 2..size + 4], *caps as u16);
                size += 4;
            }
        }
        _ => return Err(sense::INVALID_FIELD),
    }

    // Size of the buffer, not including the 2-byte size field
    BigEndian::write_u16(&mut outbuf[0..2], (size - 2) as u16);
    Ok(size)
}

fn event_status_media(dev: &ScsiDisk, outbuf: &mut [u8]) -> usize {
    let media_status = if dev.is_tray_open() {
        MS_TRAY_OPEN
    } else if dev.backend().borrow().is_inserted() {
        MS_MEDIA_PRESENT
    } else {
        0
    };

    let mut event_code = MEC_NO_CHANGE;
    if media_status != MS_TRAY_OPEN {
        let (media_event, eject_request) = dev.media_event_flags();
        if media_event {
            event_code = MEC_NEW_MEDIA;
            dev.clear_media_event();
        } else if eject_request {
            event_code = MEC_EJECT_REQUESTED;
            dev.clear_eject_request();
        }
    }

    outbuf[0] = event_code;
    outbuf[1] = media_status;
    outbuf[2] = 0;
    outbuf[3] = 0;
    4
}

fn emulate_event_status(dev: &ScsiDisk, cmd: &Cdb, outbuf: &mut [u8]) -> Result<usize, SenseCode> {
    require_rom(dev)?;
    if cmd.buf[1] & 1 == 0 {
        // asynchronous operation not supported
        return Err(sense::INVALID_FIELD);
    }

    let notification_class_request = cmd.buf[4];
    let mut size = 4;
    outbuf[0] = 0;
    outbuf[1] = 0;
    outbuf[3] = 1 << GESN_MEDIA; // supported events
    if notification_class_request & (1 << GESN_MEDIA) != 0 {
        outbuf[2] = GESN_MEDIA;
        size += event_status_media(dev, &mut outbuf[4..]);
    } else {
        outbuf[2] = 0x80; // no event available
    }
    BigEndian::write_u16(&mut outbuf[0..2], (size - 4) as u16);
    Ok(size)
}

fn emulate_get_configuration(dev: &ScsiDisk, outbuf: &mut [u8]) -> Result<usize, SenseCode> {
    require_rom(dev)?;
    let current = if media_is_dvd(dev) {
        MMC_PROFILE_DVD_ROM
    } else {
        MMC_PROFILE_CD_ROM
    };

    outbuf[..40].fill(0);
    BigEndian::write_u32(&mut outbuf[0..4], 36); // bytes after the data length field
    BigEndian::write_u16(&mut outbuf[6..8], current);
    // Feature 0: profile list
    outbuf[10] = 0x03; // persistent, current
    outbuf[11] = 8; // two profiles
    BigEndian::write_u16(&mut outbuf[12..14], MMC_PROFILE_DVD_ROM);
    outbuf[14] = (current == MMC_PROFILE_DVD_ROM) as u8;
    BigEndian::write_u16(&mut outbuf[16..18], MMC_PROFILE_CD_ROM);
    outbuf[18] = (current == MMC_PROFILE_CD_ROM) as u8;
    // Feature 1: core feature
    BigEndian::write_u16(&mut outbuf[20..22], 1);
    outbuf[22] = 0x08 | 0x03; // version 2, persistent, current
    outbuf[23] = 8;
    BigEndian::write_u32(&mut outbuf[24..28], 1); // SCSI interface
    outbuf[28] = 1; // DBE, mandatory
    // Feature 3: removable media
    BigEndian::write_u16(&mut outbuf[32..34], 3);
    outbuf[34] = 0x08 | 0x03; // version 2, persistent, current
    outbuf[35] = 4;
    outbuf[36] = 0x39; // tray, load=1, eject=1, unlocked at powerup, lock=1
    Ok(40)
}
