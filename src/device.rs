//! Emulated SCSI device state and device-model registry
//!
//! A [`ScsiDisk`] carries everything that outlives a single command: the
//! personality (disk or CD-ROM), feature flags, identity strings, tray and
//! media-change state, the latched unit attention and the last LBA learned
//! at READ CAPACITY time. Requests reference the device through an `Rc`;
//! all mutable fields are `Cell`s because the event loop is the only
//! thread that ever touches them.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::{Rc, Weak};

use byteorder::{ReadBytesExt, WriteBytesExt};
use once_cell::sync::Lazy;

use crate::block::BlockBackend;
use crate::error::{ScsiError, ScsiResult};
use crate::request::ScsiRequest;
use crate::sense::{self, SenseCode};

/// Device personality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Direct-access block device ("hard disk")
    Disk,
    /// Removable read-only optical device ("CD-ROM")
    Rom,
    /// Passthrough to a kernel SCSI generic endpoint. Recognized at the
    /// dispatch boundary only; request allocation reports it unsupported.
    Block,
}

/// Configuration accepted by every device model
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Revision string; the first 4 characters are reported by INQUIRY
    pub ver: Option<String>,
    /// Unit serial number; at most 20 characters are reported
    pub serial: Option<String>,
    /// World Wide Name; zero means unassigned
    pub wwn: u64,
    pub removable: bool,
    pub dpofua: bool,
    /// Logical block size in bytes (disk models only; CD-ROM is 2048)
    pub logical_block_size: u32,
    /// Physical block size in bytes; zero means equal to logical
    pub physical_block_size: u32,
    pub cyls: u32,
    pub heads: u32,
    pub secs: u32,
    /// Minimum I/O size hint in bytes
    pub min_io_size: u32,
    /// Optimal I/O size hint in bytes
    pub opt_io_size: u32,
    /// Discard granularity in bytes; zero disables UNMAP
    pub discard_granularity: u32,
    /// Legacy hint for the `scsi-disk` model: treat the drive as a CD
    pub media_cd: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            ver: None,
            serial: None,
            wwn: 0,
            removable: false,
            dpofua: false,
            logical_block_size: 512,
            physical_block_size: 0,
            cyls: 0,
            heads: 0,
            secs: 0,
            min_io_size: 0,
            opt_io_size: 0,
            discard_granularity: 0,
            media_cd: false,
        }
    }
}

/// Emulated SCSI disk or CD-ROM device
pub struct ScsiDisk {
    self_ref: Weak<ScsiDisk>,
    kind: DeviceKind,
    backend: Rc<RefCell<dyn BlockBackend>>,
    blocksize: u32,
    physical_block_size: u32,
    version: String,
    serial: Option<String>,
    wwn: u64,
    removable: bool,
    dpofua: bool,
    cyls: u32,
    heads: u32,
    secs: u32,
    min_io_size: u32,
    opt_io_size: u32,
    discard_granularity: u32,

    max_lba: Cell<u64>,
    unit_attention: Cell<Option<SenseCode>>,
    /// Last reported sense, served by REQUEST SENSE
    sense: Cell<Option<SenseCode>>,
    tray_open: Cell<bool>,
    tray_locked: Cell<bool>,
    media_changed: Cell<bool>,
    media_event: Cell<bool>,
    eject_request: Cell<bool>,

    requests: RefCell<Vec<Rc<ScsiRequest>>>,
}

impl std::fmt::Debug for ScsiDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScsiDisk")
            .field("kind", &self.kind)
            .field("blocksize", &self.blocksize)
            .finish_non_exhaustive()
    }
}

impl ScsiDisk {
    /// Create a device of the given personality over a block backend.
    ///
    /// Fails when a non-removable device has no medium, when the block
    /// size is not supported, or when the geometry hints are out of range.
    pub fn new(
        kind: DeviceKind,
        backend: Rc<RefCell<dyn BlockBackend>>,
        opts: DeviceOptions,
    ) -> ScsiResult<Rc<ScsiDisk>> {
        let blocksize = match kind {
            DeviceKind::Rom => 2048,
            _ => opts.logical_block_size,
        };
        if !matches!(blocksize, 512 | 1024 | 2048 | 4096) {
            return Err(ScsiError::Config(format!(
                "unsupported logical block size {}",
                blocksize
            )));
        }
        let physical_block_size = if opts.physical_block_size == 0 {
            blocksize
        } else {
            opts.physical_block_size
        };
        if physical_block_size % blocksize != 0
            || !(physical_block_size / blocksize).is_power_of_two()
        {
            return Err(ScsiError::Config(format!(
                "physical block size {} is not a power-of-two multiple of {}",
                physical_block_size, blocksize
            )));
        }

        let removable = opts.removable || kind == DeviceKind::Rom;
        if !removable && !backend.borrow().is_inserted() {
            return Err(ScsiError::Config(
                "Device needs media, but drive is empty".to_string(),
            ));
        }

        let (cyls, heads, secs) =
            validate_geometry(&*backend.borrow(), opts.cyls, opts.heads, opts.secs)?;

        let version = opts
            .ver
            .unwrap_or_else(|| crate::VERSION.to_string());

        backend.borrow_mut().set_buffer_alignment(blocksize);

        let dev = Rc::new_cyclic(|self_ref| ScsiDisk {
            self_ref: self_ref.clone(),
            kind,
            backend,
            blocksize,
            physical_block_size,
            version,
            serial: opts.serial,
            wwn: opts.wwn,
            removable,
            dpofua: opts.dpofua,
            cyls,
            heads,
            secs,
            min_io_size: opts.min_io_size,
            opt_io_size: opts.opt_io_size,
            discard_granularity: opts.discard_granularity,
            max_lba: Cell::new(0),
            unit_attention: Cell::new(None),
            sense: Cell::new(None),
            tray_open: Cell::new(false),
            tray_locked: Cell::new(false),
            media_changed: Cell::new(false),
            media_event: Cell::new(false),
            eject_request: Cell::new(false),
            requests: RefCell::new(Vec::new()),
        });
        dev.reset();
        Ok(dev)
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn backend(&self) -> Rc<RefCell<dyn BlockBackend>> {
        Rc::clone(&self.backend)
    }

    /// Logical block size in bytes (512 or 2048 in practice)
    pub fn blocksize(&self) -> u32 {
        self.blocksize
    }

    /// log2 of physical blocks per logical block, for READ CAPACITY(16)
    pub fn physical_block_exp(&self) -> u8 {
        (self.physical_block_size / self.blocksize).trailing_zeros() as u8
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn wwn(&self) -> u64 {
        self.wwn
    }

    pub fn is_removable(&self) -> bool {
        self.removable
    }

    pub fn dpofua(&self) -> bool {
        self.dpofua
    }

    pub fn geometry_hints(&self) -> (u32, u32, u32) {
        (self.cyls, self.heads, self.secs)
    }

    pub fn min_io_size(&self) -> u32 {
        self.min_io_size
    }

    pub fn opt_io_size(&self) -> u32 {
        self.opt_io_size
    }

    pub fn discard_granularity(&self) -> u32 {
        self.discard_granularity
    }

    pub fn max_lba(&self) -> u64 {
        self.max_lba.get()
    }

    pub(crate) fn set_max_lba(&self, lba: u64) {
        self.max_lba.set(lba);
    }

    pub fn is_tray_open(&self) -> bool {
        self.tray_open.get()
    }

    pub fn is_medium_locked(&self) -> bool {
        self.tray_locked.get()
    }

    pub fn set_tray_open(&self, open: bool) {
        self.tray_open.set(open);
    }

    pub fn set_tray_locked(&self, locked: bool) {
        self.tray_locked.set(locked);
    }

    pub(crate) fn media_event_flags(&self) -> (bool, bool) {
        (self.media_event.get(), self.eject_request.get())
    }

    pub(crate) fn clear_media_event(&self) {
        self.media_event.set(false);
    }

    pub(crate) fn clear_eject_request(&self) {
        self.eject_request.set(false);
    }

    pub fn pending_sense(&self) -> Option<SenseCode> {
        self.sense.get()
    }

    pub(crate) fn set_pending_sense(&self, sense: Option<SenseCode>) {
        self.sense.set(sense);
    }

    pub fn pending_unit_attention(&self) -> Option<SenseCode> {
        self.unit_attention.get()
    }

    /// Latch a unit attention to be reported on the next eligible command.
    pub fn set_unit_attention(&self, sense: SenseCode) {
        self.unit_attention.set(Some(sense));
    }

    /// Transport hook: fetch and clear the pending unit attention for a
    /// command with the given opcode.
    ///
    /// INQUIRY, REQUEST SENSE and REPORT LUNS are served normally even
    /// with an attention pending; any other command consumes it and must
    /// be completed by the transport with CHECK CONDITION carrying the
    /// returned sense.
    pub fn take_unit_attention(&self, op: u8) -> Option<SenseCode> {
        use crate::cdb::opcode;
        let ua = self.unit_attention.get()?;
        if matches!(
            op,
            opcode::INQUIRY | opcode::REQUEST_SENSE | opcode::REPORT_LUNS
        ) {
            return None;
        }
        self.unit_attention.set(None);
        self.unit_attention_reported();
        Some(ua)
    }

    /// Called after a pending unit attention has been delivered. A medium
    /// change is reported in two steps: first the attention latched by the
    /// change callback, then MEDIUM CHANGED on the following command.
    pub fn unit_attention_reported(&self) {
        if self.media_changed.get() {
            self.media_changed.set(false);
            self.unit_attention.set(Some(sense::MEDIUM_CHANGED));
        }
    }

    /// Backend callback: a medium was inserted (`load`) or removed.
    pub fn change_media_cb(&self, load: bool) {
        // Guests detect a medium change as an eject followed by a load, so
        // report an empty tray first and latch the attention sequence.
        self.media_changed.set(load);
        self.tray_open.set(!load);
        self.unit_attention
            .set(Some(sense::UNIT_ATTENTION_NO_MEDIUM));
        self.media_event.set(true);
        self.eject_request.set(false);
    }

    /// Backend callback: the host asked for the medium to be ejected.
    pub fn eject_request_cb(&self, force: bool) {
        self.eject_request.set(true);
        if force {
            self.tray_locked.set(false);
        }
    }

    /// Allocate a request for a CDB arriving from the host adapter.
    ///
    /// The passthrough personality is recognized here but its execution
    /// path belongs to the host's SCSI generic layer, not to the
    /// emulator core.
    pub fn new_request(
        &self,
        bus: &Rc<RefCell<dyn crate::request::ScsiBus>>,
        tag: u32,
        lun: u32,
        cdb: &[u8],
        hba_private: Option<Rc<dyn std::any::Any>>,
    ) -> ScsiResult<Rc<ScsiRequest>> {
        if self.kind == DeviceKind::Block {
            return Err(ScsiError::UnsupportedModel(
                "scsi-block passthrough requests are not executed by the emulator core"
                    .to_string(),
            ));
        }
        let dev = self.self_ref.upgrade().expect("device still referenced");
        ScsiRequest::new(&dev, bus, tag, lun, cdb, hba_private)
    }

    pub(crate) fn enqueue_request(&self, req: &Rc<ScsiRequest>) {
        self.requests.borrow_mut().push(Rc::clone(req));
    }

    pub(crate) fn dequeue_request(&self, req: &ScsiRequest) {
        self.requests
            .borrow_mut()
            .retain(|r| !std::ptr::eq(r.as_ref(), req));
    }

    /// Cancel every outstanding request and post the given sense as a
    /// unit attention (a non-attention sense clears any pending one).
    pub fn purge_requests(&self, sense: SenseCode) {
        let requests = std::mem::take(&mut *self.requests.borrow_mut());
        for req in &requests {
            req.cancel_io();
            req.notify_cancelled();
        }
        self.unit_attention
            .set((sense.key == crate::sense::key::UNIT_ATTENTION).then_some(sense));
    }

    /// Device reset: abort everything in flight and relearn the geometry.
    pub fn reset(&self) {
        self.purge_requests(sense::RESET);

        let mut nb_sectors = self.backend.borrow().get_geometry() / (self.blocksize as u64 / 512);
        if nb_sectors > 0 {
            nb_sectors -= 1;
        }
        self.max_lba.set(nb_sectors);
    }

    /// Device teardown: abort everything in flight without raising sense.
    pub fn destroy(&self) {
        self.purge_requests(sense::NO_SENSE);
    }

    /// Serialize the migratable device state.
    ///
    /// Layout: the parent-device section (unit attention and pending sense
    /// as flagged triples), then the booleans `media_changed`,
    /// `media_event`, `eject_request`, `tray_open`, `tray_locked`.
    pub fn save_state<W: Write>(&self, w: &mut W) -> ScsiResult<()> {
        write_sense_opt(w, self.unit_attention.get())?;
        write_sense_opt(w, self.sense.get())?;
        for flag in [
            self.media_changed.get(),
            self.media_event.get(),
            self.eject_request.get(),
            self.tray_open.get(),
            self.tray_locked.get(),
        ] {
            w.write_u8(flag as u8)?;
        }
        Ok(())
    }

    /// Restore state produced by [`save_state`](Self::save_state).
    pub fn load_state<R: Read>(&self, r: &mut R) -> ScsiResult<()> {
        self.unit_attention.set(read_sense_opt(r)?);
        self.sense.set(read_sense_opt(r)?);
        self.media_changed.set(read_bool(r)?);
        self.media_event.set(read_bool(r)?);
        self.eject_request.set(read_bool(r)?);
        self.tray_open.set(read_bool(r)?);
        self.tray_locked.set(read_bool(r)?);
        Ok(())
    }
}

fn write_sense_opt<W: Write>(w: &mut W, sense: Option<SenseCode>) -> ScsiResult<()> {
    match sense {
        Some(s) => {
            w.write_u8(1)?;
            w.write_u8(s.key)?;
            w.write_u8(s.asc)?;
            w.write_u8(s.ascq)?;
        }
        None => w.write_u8(0)?,
    }
    Ok(())
}

fn read_sense_opt<R: Read>(r: &mut R) -> ScsiResult<Option<SenseCode>> {
    match r.read_u8()? {
        0 => Ok(None),
        1 => {
            let key = r.read_u8()?;
            let asc = r.read_u8()?;
            let ascq = r.read_u8()?;
            Ok(Some(SenseCode::new(key, asc, ascq)))
        }
        n => Err(ScsiError::Migration(format!("bad sense flag {}", n))),
    }
}

fn read_bool<R: Read>(r: &mut R) -> ScsiResult<bool> {
    Ok(r.read_u8()? != 0)
}

/// Validate the CHS hints, guessing a translation when none is given.
fn validate_geometry(
    backend: &dyn BlockBackend,
    cyls: u32,
    heads: u32,
    secs: u32,
) -> ScsiResult<(u32, u32, u32)> {
    if cyls > 65535 || heads > 255 || secs > 255 {
        return Err(ScsiError::Config(format!(
            "geometry hints out of range: cyls={} heads={} secs={}",
            cyls, heads, secs
        )));
    }
    if cyls == 0 && heads == 0 && secs == 0 {
        let nb_sectors = backend.get_geometry();
        let heads = 16;
        let secs = 63;
        let cyls = (nb_sectors / (heads * secs)).clamp(1, 65535) as u32;
        return Ok((cyls, heads as u32, secs as u32));
    }
    Ok((cyls, heads, secs))
}

/// A registered device model
pub struct DeviceModel {
    pub name: &'static str,
    pub description: &'static str,
    create: fn(Rc<RefCell<dyn BlockBackend>>, DeviceOptions) -> ScsiResult<Rc<ScsiDisk>>,
}

fn create_hd(
    backend: Rc<RefCell<dyn BlockBackend>>,
    opts: DeviceOptions,
) -> ScsiResult<Rc<ScsiDisk>> {
    ScsiDisk::new(DeviceKind::Disk, backend, opts)
}

fn create_cd(
    backend: Rc<RefCell<dyn BlockBackend>>,
    mut opts: DeviceOptions,
) -> ScsiResult<Rc<ScsiDisk>> {
    opts.removable = true;
    ScsiDisk::new(DeviceKind::Rom, backend, opts)
}

fn create_block(
    backend: Rc<RefCell<dyn BlockBackend>>,
    opts: DeviceOptions,
) -> ScsiResult<Rc<ScsiDisk>> {
    ScsiDisk::new(DeviceKind::Block, backend, opts)
}

fn create_legacy(
    backend: Rc<RefCell<dyn BlockBackend>>,
    opts: DeviceOptions,
) -> ScsiResult<Rc<ScsiDisk>> {
    if opts.media_cd {
        create_cd(backend, opts)
    } else {
        create_hd(backend, opts)
    }
}

static DEVICE_MODELS: Lazy<Vec<DeviceModel>> = Lazy::new(|| {
    vec![
        DeviceModel {
            name: "scsi-hd",
            description: "virtual SCSI disk",
            create: create_hd,
        },
        DeviceModel {
            name: "scsi-cd",
            description: "virtual SCSI CD-ROM",
            create: create_cd,
        },
        DeviceModel {
            name: "scsi-block",
            description: "SCSI block device passthrough",
            create: create_block,
        },
        DeviceModel {
            name: "scsi-disk",
            description: "virtual SCSI disk or CD-ROM (legacy)",
            create: create_legacy,
        },
    ]
});

/// All registered device models.
pub fn device_models() -> &'static [DeviceModel] {
    &DEVICE_MODELS
}

/// Instantiate a device by registered model name.
pub fn create_device(
    model: &str,
    backend: Rc<RefCell<dyn BlockBackend>>,
    opts: DeviceOptions,
) -> ScsiResult<Rc<ScsiDisk>> {
    let entry = DEVICE_MODELS
        .iter()
        .find(|m| m.name == model)
        .ok_or_else(|| ScsiError::UnsupportedModel(model.to_string()))?;
    log::info!("creating {} ({})", entry.name, entry.description);
    (entry.create)(backend, opts)
}
