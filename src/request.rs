//! Per-command request object and data-path state machine
//!
//! One [`ScsiRequest`] exists per outstanding CDB. Data-bearing commands
//! run a chunked transfer loop against the block backend, either through a
//! caller-supplied scatter/gather list or through a core-owned bounce
//! buffer; everything else is synthesized in one shot by the `emulate`
//! module.
//!
//! Lifetime discipline: the request is shared-ownership (`Rc`). Every
//! async submission captures one clone of the `Rc` in its completion
//! closure, so a request cannot be freed while a completion can still
//! reach it. Cancellation marks `io_canceled` and hands the outstanding
//! handle back to the backend; a late completion sees the flag, skips the
//! status path and drops its clone.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::{Rc, Weak};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::block::{
    AcctCookie, AcctType, AioBuf, AioHandle, AioResult, BlockBackend, BlockError, ErrorAction,
    ReportedAction, SgList, SharedBuf,
};
use crate::cdb::{opcode, Cdb, XferMode};
use crate::device::ScsiDisk;
use crate::emulate;
use crate::error::{ScsiError, ScsiResult};
use crate::sense::{self, status, SenseCode};

/// Chunk size for bounce-buffered transfers, in bytes
pub const SCSI_DMA_BUF_SIZE: usize = 131072;

/// Sentinel: a synthesized payload is pending delivery in one shot
const PENDING_EMULATED: u32 = u32::MAX;

/// Notification surface of the host bus adapter.
///
/// Implementations must not re-enter the request synchronously from these
/// callbacks; continue it (`read_data`/`write_data`) from the event loop
/// after the current callback unwinds.
pub trait ScsiBus {
    /// For reads: `len` bytes are ready in the request buffer. For writes:
    /// the core wants the next `len` bytes placed in the request buffer.
    fn transfer_data(&mut self, req: &Rc<ScsiRequest>, len: usize);

    /// The request finished with the given status byte.
    fn complete(&mut self, req: &Rc<ScsiRequest>, status: u8);

    /// The request was cancelled before completing.
    fn request_cancelled(&mut self, _req: &Rc<ScsiRequest>) {}

    /// Halt the VM after an I/O error under a stop policy.
    fn stop_vm(&mut self) {}

    /// Whether the bus supports tagged command queuing.
    fn tcq(&self) -> bool {
        false
    }
}

/// One outstanding SCSI command
pub struct ScsiRequest {
    self_ref: Weak<ScsiRequest>,
    dev: Rc<ScsiDisk>,
    bus: Rc<RefCell<dyn ScsiBus>>,
    backend: Rc<RefCell<dyn BlockBackend>>,
    tag: u32,
    lun: u32,
    cmd: Cdb,
    hba_private: Option<Rc<dyn Any>>,

    // Both sector and sector_count are in 512-byte units.
    sector: Cell<u64>,
    sector_count: Cell<u32>,
    buf: SharedBuf,
    buflen: Cell<usize>,
    iov_len: Cell<usize>,
    sg: RefCell<Option<Rc<SgList>>>,
    started: Cell<bool>,
    aiocb: Cell<Option<AioHandle>>,
    acct: Cell<Option<AcctCookie>>,
    io_canceled: Cell<bool>,
    retry: Cell<bool>,
    status: Cell<Option<u8>>,
    sense: Cell<Option<SenseCode>>,
}

impl std::fmt::Debug for ScsiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScsiRequest")
            .field("tag", &self.tag)
            .field("lun", &self.lun)
            .finish_non_exhaustive()
    }
}

impl ScsiRequest {
    pub(crate) fn new(
        dev: &Rc<ScsiDisk>,
        bus: &Rc<RefCell<dyn ScsiBus>>,
        tag: u32,
        lun: u32,
        cdb: &[u8],
        hba_private: Option<Rc<dyn Any>>,
    ) -> ScsiResult<Rc<ScsiRequest>> {
        if cdb.is_empty() {
            return Err(ScsiError::Request("empty CDB".to_string()));
        }
        let cmd = Cdb::parse(cdb, dev.blocksize());
        let req = Rc::new_cyclic(|self_ref| ScsiRequest {
            self_ref: self_ref.clone(),
            dev: Rc::clone(dev),
            bus: Rc::clone(bus),
            backend: dev.backend(),
            tag,
            lun,
            cmd,
            hba_private,
            sector: Cell::new(0),
            sector_count: Cell::new(0),
            buf: Rc::new(RefCell::new(Vec::new())),
            buflen: Cell::new(0),
            iov_len: Cell::new(0),
            sg: RefCell::new(None),
            started: Cell::new(false),
            aiocb: Cell::new(None),
            acct: Cell::new(None),
            io_canceled: Cell::new(false),
            retry: Cell::new(false),
            status: Cell::new(None),
            sense: Cell::new(None),
        });
        dev.enqueue_request(&req);
        Ok(req)
    }

    /// A strong reference to this request, for async submission closures
    /// and bus notifications. Infallible while `&self` is alive.
    fn rc(&self) -> Rc<ScsiRequest> {
        self.self_ref.upgrade().expect("request still referenced")
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn lun(&self) -> u32 {
        self.lun
    }

    pub fn device(&self) -> &Rc<ScsiDisk> {
        &self.dev
    }

    pub fn cmd(&self) -> &Cdb {
        &self.cmd
    }

    pub fn hba_private(&self) -> Option<Rc<dyn Any>> {
        self.hba_private.clone()
    }

    /// The bounce buffer; shared with the backend during transfers.
    pub fn buf(&self) -> SharedBuf {
        Rc::clone(&self.buf)
    }

    /// Attach a caller-owned scatter/gather list for zero-copy DMA.
    pub fn set_sg(&self, sg: Option<Rc<SgList>>) {
        *self.sg.borrow_mut() = sg;
    }

    pub fn status(&self) -> Option<u8> {
        self.status.get()
    }

    pub fn sense(&self) -> Option<SenseCode> {
        self.sense.get()
    }

    /// Serialize the request's sense in fixed or descriptor format.
    pub fn sense_bytes(&self, fixed: bool) -> Vec<u8> {
        sense::build_sense(self.sense.get().unwrap_or(sense::NO_SENSE), fixed)
    }

    pub fn sector(&self) -> u64 {
        self.sector.get()
    }

    pub fn sector_count(&self) -> u32 {
        self.sector_count.get()
    }

    pub fn is_retry(&self) -> bool {
        self.retry.get()
    }

    pub fn is_io_canceled(&self) -> bool {
        self.io_canceled.get()
    }

    /// Size the bounce buffer for the next chunk and return the chunk's
    /// length in 512-byte sectors.
    fn init_iovec(&self, size: usize) -> u32 {
        {
            let mut buf = self.buf.borrow_mut();
            if buf.is_empty() {
                let len = size.min(self.sector_count.get() as usize * 512);
                buf.resize(len, 0);
                self.buflen.set(len);
            }
        }
        let iov = (self.sector_count.get() as usize * 512).min(self.buflen.get());
        self.iov_len.set(iov);
        (iov / 512) as u32
    }

    fn transfer_data(&self, len: usize) {
        self.bus.borrow_mut().transfer_data(&self.rc(), len);
    }

    /// Complete the request and report the status byte to the bus.
    pub(crate) fn complete(&self, status_byte: u8) {
        debug_assert!(self.status.get().is_none());
        self.status.set(Some(status_byte));
        // The device-level sense mirrors the last completion; GOOD clears
        // it, which is what serves REQUEST SENSE its one-shot semantics.
        self.dev.set_pending_sense(self.sense.get());
        self.dev.dequeue_request(self);
        self.bus.borrow_mut().complete(&self.rc(), status_byte);
    }

    /// Store sense and complete with CHECK CONDITION.
    pub(crate) fn check_condition(&self, sense: SenseCode) {
        log::debug!(
            "command complete tag=0x{:x} sense={}/{}/{}",
            self.tag,
            sense.key,
            sense.asc,
            sense.ascq
        );
        self.sense.set(Some(sense));
        self.complete(status::CHECK_CONDITION);
    }

    pub(crate) fn notify_cancelled(&self) {
        self.bus.borrow_mut().request_cancelled(&self.rc());
    }

    /// Cancel the outstanding transfer, if any.
    ///
    /// The underlying async operation may still deliver its completion;
    /// the `io_canceled` flag makes it a no-op beyond dropping its
    /// reference. Accounting is closed out here because the backend may
    /// drop the completion callback without invoking it.
    pub fn cancel_io(&self) {
        log::debug!("cancel tag=0x{:x}", self.tag);
        self.io_canceled.set(true);
        if let Some(handle) = self.aiocb.take() {
            self.backend.borrow_mut().aio_cancel(handle);
            if let Some(cookie) = self.acct.take() {
                self.backend.borrow_mut().acct_done(cookie);
            }
        }
    }

    /// Replay a request marked for retry after the VM resumes.
    pub fn restart(&self) {
        if !self.retry.take() {
            return;
        }
        match self.cmd.mode {
            XferMode::FromDev => self.read_data(),
            XferMode::ToDev => self.write_data(),
            XferMode::None => {
                self.send_command();
            }
        }
    }

    /// Execute the decoded command.
    ///
    /// Returns the length of the data the command expects to move:
    /// positive for transfers from the device, negative for transfers to
    /// the device, zero when no data phase follows.
    pub fn send_command(&self) -> i32 {
        let op = self.cmd.opcode();
        log::debug!(
            "command: lun={} tag=0x{:x} opcode=0x{:02x}",
            self.lun,
            self.tag,
            op
        );

        // Medium-ready gate. A short list of commands must keep working
        // with the tray open or no medium present.
        match op {
            opcode::INQUIRY
            | opcode::MODE_SENSE
            | opcode::MODE_SENSE_10
            | opcode::RESERVE
            | opcode::RESERVE_10
            | opcode::RELEASE
            | opcode::RELEASE_10
            | opcode::START_STOP
            | opcode::ALLOW_MEDIUM_REMOVAL
            | opcode::GET_CONFIGURATION
            | opcode::GET_EVENT_STATUS_NOTIFICATION
            | opcode::MECHANISM_STATUS
            | opcode::REQUEST_SENSE => {}
            _ => {
                if self.dev.is_tray_open() || !self.backend.borrow().is_inserted() {
                    self.check_condition(sense::NO_MEDIUM);
                    return 0;
                }
            }
        }

        match op {
            opcode::TEST_UNIT_READY
            | opcode::INQUIRY
            | opcode::MODE_SENSE
            | opcode::MODE_SENSE_10
            | opcode::RESERVE
            | opcode::RESERVE_10
            | opcode::RELEASE
            | opcode::RELEASE_10
            | opcode::START_STOP
            | opcode::ALLOW_MEDIUM_REMOVAL
            | opcode::READ_CAPACITY_10
            | opcode::READ_TOC
            | opcode::READ_DISC_INFORMATION
            | opcode::READ_DVD_STRUCTURE
            | opcode::GET_CONFIGURATION
            | opcode::GET_EVENT_STATUS_NOTIFICATION
            | opcode::MECHANISM_STATUS
            | opcode::SERVICE_ACTION_IN_16
            | opcode::REQUEST_SENSE => {
                // Response buffers are capped; the transport never sees
                // more than the allocation length anyway.
                if self.cmd.xfer > 65536 {
                    self.check_condition(sense::INVALID_FIELD);
                    return 0;
                }
                {
                    let mut buf = self.buf.borrow_mut();
                    if buf.is_empty() {
                        let len = self.cmd.xfer.max(4096);
                        buf.resize(len, 0);
                        self.buflen.set(len);
                    }
                }
                let tcq = self.bus.borrow().tcq();
                let result = {
                    let mut buf = self.buf.borrow_mut();
                    emulate::execute(&self.dev, &self.cmd, tcq, &mut buf)
                };
                match result {
                    Ok(len) => self.iov_len.set(len),
                    Err(sense) => {
                        self.check_condition(sense);
                        return 0;
                    }
                }
            }
            opcode::SYNCHRONIZE_CACHE => {
                let cookie = self.backend.borrow_mut().acct_start(AcctType::Flush, 0);
                self.acct.set(Some(cookie));
                let r = self.rc();
                let handle = self
                    .backend
                    .borrow_mut()
                    .aio_flush(Box::new(move |ret| ScsiRequest::flush_complete(&r, ret)));
                self.aiocb.set(Some(handle));
                return 0;
            }
            opcode::READ_6 | opcode::READ_10 | opcode::READ_12 | opcode::READ_16 => {
                let len = self.cmd.blocks(self.dev.blocksize());
                log::debug!("read (lba {}, count {})", self.cmd.lba, len);
                if self.cmd.lba > self.dev.max_lba() {
                    self.check_condition(sense::LBA_OUT_OF_RANGE);
                    return 0;
                }
                let factor = (self.dev.blocksize() / 512) as u64;
                self.sector.set(self.cmd.lba * factor);
                self.sector_count.set(len * factor as u32);
            }
            opcode::VERIFY_10
            | opcode::VERIFY_12
            | opcode::VERIFY_16
            | opcode::WRITE_6
            | opcode::WRITE_10
            | opcode::WRITE_12
            | opcode::WRITE_16
            | opcode::WRITE_VERIFY_10
            | opcode::WRITE_VERIFY_12
            | opcode::WRITE_VERIFY_16 => {
                let len = self.cmd.blocks(self.dev.blocksize());
                log::debug!("write (lba {}, count {})", self.cmd.lba, len);
                if self.cmd.lba > self.dev.max_lba() {
                    self.check_condition(sense::LBA_OUT_OF_RANGE);
                    return 0;
                }
                let factor = (self.dev.blocksize() / 512) as u64;
                self.sector.set(self.cmd.lba * factor);
                self.sector_count.set(len * factor as u32);
            }
            opcode::MODE_SELECT => {
                log::debug!("mode select(6) (len {})", self.cmd.xfer);
                // Mode parameter changes are not supported; allow the
                // header and block descriptors only.
                if self.cmd.xfer > 12 {
                    self.check_condition(sense::INVALID_FIELD);
                    return 0;
                }
            }
            opcode::MODE_SELECT_10 => {
                log::debug!("mode select(10) (len {})", self.cmd.xfer);
                if self.cmd.xfer > 16 {
                    self.check_condition(sense::INVALID_FIELD);
                    return 0;
                }
            }
            opcode::SEEK_10 => {
                log::debug!("seek(10) (lba {})", self.cmd.lba);
                if self.cmd.lba > self.dev.max_lba() {
                    self.check_condition(sense::LBA_OUT_OF_RANGE);
                    return 0;
                }
            }
            opcode::WRITE_SAME_10 | opcode::WRITE_SAME_16 => {
                let len = if op == opcode::WRITE_SAME_10 {
                    BigEndian::read_u16(&self.cmd.buf[7..9]) as u64
                } else {
                    BigEndian::read_u32(&self.cmd.buf[10..14]) as u64
                };
                log::debug!("write same (lba {}, count {})", self.cmd.lba, len);
                if self.cmd.lba > self.dev.max_lba() {
                    self.check_condition(sense::LBA_OUT_OF_RANGE);
                    return 0;
                }
                // Only WRITE SAME with the unmap bit set is supported.
                if self.cmd.buf[1] & 0x8 == 0 {
                    self.check_condition(sense::INVALID_FIELD);
                    return 0;
                }
                let factor = (self.dev.blocksize() / 512) as u64;
                let rc = self
                    .backend
                    .borrow_mut()
                    .discard(self.cmd.lba * factor, (len * factor) as u32);
                if rc.is_err() {
                    self.check_condition(sense::INVALID_FIELD);
                    return 0;
                }
            }
            _ => {
                log::debug!("unknown SCSI command 0x{:02x}", op);
                self.check_condition(sense::INVALID_OPCODE);
                return 0;
            }
        }

        if self.sector_count.get() == 0 && self.iov_len.get() == 0 {
            self.complete(status::GOOD);
        }
        let len = self.sector_count.get() as i64 * 512 + self.iov_len.get() as i64;
        if self.cmd.mode == XferMode::ToDev {
            -len as i32
        } else {
            if self.sector_count.get() == 0 {
                self.sector_count.set(PENDING_EMULATED);
            }
            len as i32
        }
    }

    /// Continue a transfer from the device: deliver a synthesized payload
    /// or issue the next chunk of a media read.
    pub fn read_data(&self) {
        if self.sector_count.get() == PENDING_EMULATED {
            let len = self.iov_len.get();
            log::debug!("read buf_len={}", len);
            self.sector_count.set(0);
            self.started.set(true);
            self.transfer_data(len);
            return;
        }
        log::debug!("read sector_count={}", self.sector_count.get());
        if self.sector_count.get() == 0 {
            // This also clears the device sense for REQUEST SENSE.
            self.complete(status::GOOD);
            return;
        }

        // No data transfer may already be in progress.
        debug_assert!(self.aiocb.get().is_none());

        if self.cmd.mode == XferMode::ToDev {
            log::warn!("data transfer direction invalid");
            self.read_complete(Err(BlockError::InvalidRequest));
            return;
        }

        if self.dev.is_tray_open() {
            self.read_complete(Err(BlockError::NoMedium));
            return;
        }

        let first = !self.started.get();
        self.started.set(true);
        if first && self.cmd.is_fua() {
            // FUA read: commit pending writes before touching the medium.
            let cookie = self.backend.borrow_mut().acct_start(AcctType::Flush, 0);
            self.acct.set(Some(cookie));
            let r = self.rc();
            let handle = self
                .backend
                .borrow_mut()
                .aio_flush(Box::new(move |ret| ScsiRequest::do_read(&r, ret)));
            self.aiocb.set(Some(handle));
        } else {
            self.do_read(Ok(()));
        }
    }

    /// Actually issue a read against the block backend.
    fn do_read(&self, ret: AioResult) {
        if self.aiocb.take().is_some() {
            if let Some(cookie) = self.acct.take() {
                self.backend.borrow_mut().acct_done(cookie);
            }
        }

        if let Err(e) = ret {
            if self.handle_rw_error(e) {
                return;
            }
        }

        if self.io_canceled.get() {
            return;
        }

        let sg = self.sg.borrow().clone();
        if let Some(sg) = sg {
            let cookie = self
                .backend
                .borrow_mut()
                .acct_start(AcctType::Read, sg.size());
            self.acct.set(Some(cookie));
            let r = self.rc();
            let handle = self.backend.borrow_mut().aio_readv(
                self.sector.get(),
                AioBuf::Sg(sg),
                Box::new(move |ret| ScsiRequest::dma_complete(&r, ret)),
            );
            self.aiocb.set(Some(handle));
        } else {
            let n = self.init_iovec(SCSI_DMA_BUF_SIZE);
            let cookie = self
                .backend
                .borrow_mut()
                .acct_start(AcctType::Read, n as usize * 512);
            self.acct.set(Some(cookie));
            let r = self.rc();
            let handle = self.backend.borrow_mut().aio_readv(
                self.sector.get(),
                AioBuf::Bounce {
                    buf: Rc::clone(&self.buf),
                    len: self.iov_len.get(),
                },
                Box::new(move |ret| ScsiRequest::read_complete(&r, ret)),
            );
            self.aiocb.set(Some(handle));
        }
    }

    fn read_complete(&self, ret: AioResult) {
        if self.aiocb.take().is_some() {
            if let Some(cookie) = self.acct.take() {
                self.backend.borrow_mut().acct_done(cookie);
            }
        }

        if let Err(e) = ret {
            if self.handle_rw_error(e) {
                return;
            }
        }

        if self.io_canceled.get() {
            return;
        }

        let len = self.iov_len.get();
        log::debug!("data ready tag=0x{:x} len={}", self.tag, len);
        let n = (len / 512) as u32;
        self.sector.set(self.sector.get() + n as u64);
        self.sector_count.set(self.sector_count.get() - n);
        self.transfer_data(len);
    }

    /// Continue a transfer to the device: consume the buffer the transport
    /// just filled, or ask for the first chunk.
    pub fn write_data(&self) {
        // No data transfer may already be in progress.
        debug_assert!(self.aiocb.get().is_none());

        if self.cmd.mode != XferMode::ToDev {
            log::warn!("data transfer direction invalid");
            self.write_complete(Err(BlockError::InvalidRequest));
            return;
        }

        if self.sg.borrow().is_none() && self.iov_len.get() == 0 {
            // Called for the first time; ask the transport for data.
            self.started.set(true);
            self.write_complete(Ok(()));
            return;
        }

        if self.dev.is_tray_open() {
            self.write_complete(Err(BlockError::NoMedium));
            return;
        }

        if matches!(
            self.cmd.opcode(),
            opcode::VERIFY_10 | opcode::VERIFY_12 | opcode::VERIFY_16
        ) {
            // VERIFY consumes the data phase without touching the medium.
            let has_sg = self.sg.borrow().is_some();
            if has_sg {
                self.dma_complete(Ok(()));
            } else {
                self.write_complete(Ok(()));
            }
            return;
        }

        let sg = self.sg.borrow().clone();
        if let Some(sg) = sg {
            let cookie = self
                .backend
                .borrow_mut()
                .acct_start(AcctType::Write, sg.size());
            self.acct.set(Some(cookie));
            let r = self.rc();
            let handle = self.backend.borrow_mut().aio_writev(
                self.sector.get(),
                AioBuf::Sg(sg),
                Box::new(move |ret| ScsiRequest::dma_complete(&r, ret)),
            );
            self.aiocb.set(Some(handle));
        } else {
            let n = self.iov_len.get() / 512;
            let cookie = self
                .backend
                .borrow_mut()
                .acct_start(AcctType::Write, n * 512);
            self.acct.set(Some(cookie));
            let r = self.rc();
            let handle = self.backend.borrow_mut().aio_writev(
                self.sector.get(),
                AioBuf::Bounce {
                    buf: Rc::clone(&self.buf),
                    len: self.iov_len.get(),
                },
                Box::new(move |ret| ScsiRequest::write_complete(&r, ret)),
            );
            self.aiocb.set(Some(handle));
        }
    }

    fn write_complete(&self, ret: AioResult) {
        if self.aiocb.take().is_some() {
            if let Some(cookie) = self.acct.take() {
                self.backend.borrow_mut().acct_done(cookie);
            }
        }

        if let Err(e) = ret {
            if self.handle_rw_error(e) {
                return;
            }
        }

        if self.io_canceled.get() {
            return;
        }

        let n = (self.iov_len.get() / 512) as u32;
        self.sector.set(self.sector.get() + n as u64);
        self.sector_count.set(self.sector_count.get() - n);
        if self.sector_count.get() == 0 {
            self.write_do_fua();
        } else {
            self.init_iovec(SCSI_DMA_BUF_SIZE);
            log::debug!(
                "write complete tag=0x{:x} more={}",
                self.tag,
                self.iov_len.get()
            );
            self.transfer_data(self.iov_len.get());
        }
    }

    /// All payload is on the medium; honor FUA before reporting GOOD.
    fn write_do_fua(&self) {
        if self.cmd.is_fua() {
            let cookie = self.backend.borrow_mut().acct_start(AcctType::Flush, 0);
            self.acct.set(Some(cookie));
            let r = self.rc();
            let handle = self
                .backend
                .borrow_mut()
                .aio_flush(Box::new(move |ret| ScsiRequest::flush_complete(&r, ret)));
            self.aiocb.set(Some(handle));
            return;
        }
        self.complete(status::GOOD);
    }

    /// Completion of a whole-transfer DMA through a scatter/gather list.
    fn dma_complete(&self, ret: AioResult) {
        if self.aiocb.take().is_some() {
            if let Some(cookie) = self.acct.take() {
                self.backend.borrow_mut().acct_done(cookie);
            }
        }

        if let Err(e) = ret {
            if self.handle_rw_error(e) {
                return;
            }
        }

        if self.io_canceled.get() {
            return;
        }

        self.sector
            .set(self.sector.get() + self.sector_count.get() as u64);
        self.sector_count.set(0);
        if self.cmd.mode == XferMode::ToDev {
            self.write_do_fua();
        } else {
            self.complete(status::GOOD);
        }
    }

    fn flush_complete(&self, ret: AioResult) {
        self.aiocb.set(None);
        if let Some(cookie) = self.acct.take() {
            self.backend.borrow_mut().acct_done(cookie);
        }

        if let Err(e) = ret {
            if self.handle_rw_error(e) {
                return;
            }
        }

        if self.io_canceled.get() {
            return;
        }

        self.complete(status::GOOD);
    }

    /// Apply the backend's error-action policy to a failed transfer.
    ///
    /// Returns false when the error must be ignored and the success path
    /// should continue; true when the error has been fully handled and the
    /// caller must do nothing further for this request.
    fn handle_rw_error(&self, error: BlockError) -> bool {
        let is_read = self.cmd.mode == XferMode::FromDev;
        let action = self.backend.borrow().get_on_error(is_read);

        let stop = match action {
            ErrorAction::Ignore => {
                self.backend
                    .borrow_mut()
                    .report_error_event(ReportedAction::Ignore, is_read);
                return false;
            }
            ErrorAction::StopEnospc => error == BlockError::NoSpace,
            ErrorAction::StopAny | ErrorAction::Retry => true,
            ErrorAction::Report => false,
        };

        if stop {
            log::warn!(
                "stopping VM after {} error on tag=0x{:x}: {}",
                if is_read { "read" } else { "write" },
                self.tag,
                error
            );
            self.backend
                .borrow_mut()
                .report_error_event(ReportedAction::Stop, is_read);
            self.bus.borrow_mut().stop_vm();
            self.backend.borrow_mut().set_iostatus_err(error);
            self.retry.set(true);
        } else {
            let sense = match error {
                BlockError::NoMedium => sense::NO_MEDIUM,
                BlockError::NoMemory => sense::TARGET_FAILURE,
                BlockError::InvalidRequest => sense::INVALID_FIELD,
                _ => sense::IO_ERROR,
            };
            self.check_condition(sense);
            self.backend
                .borrow_mut()
                .report_error_event(ReportedAction::Report, is_read);
        }
        true
    }

    /// Serialize the in-flight transfer state for migration.
    ///
    /// Layout, big-endian: `sector` (u64), `sector_count` (u32), `buflen`
    /// (u32), then for transfers to the device the active iovec bytes, and
    /// for transfers from the device outside a retry a u32 length followed
    /// by that many buffered bytes.
    pub fn save_request<W: Write>(&self, w: &mut W) -> ScsiResult<()> {
        w.write_u64::<BigEndian>(self.sector.get())?;
        w.write_u32::<BigEndian>(self.sector_count.get())?;
        w.write_u32::<BigEndian>(self.buflen.get() as u32)?;
        if self.buflen.get() > 0 {
            let buf = self.buf.borrow();
            if self.cmd.mode == XferMode::ToDev {
                w.write_all(&buf[..self.iov_len.get()])?;
            } else if !self.retry.get() {
                let len = self.iov_len.get() as u32;
                w.write_u32::<BigEndian>(len)?;
                w.write_all(&buf[..len as usize])?;
            }
        }
        Ok(())
    }

    /// Restore state produced by [`save_request`](Self::save_request).
    pub fn load_request<R: Read>(&self, r: &mut R) -> ScsiResult<()> {
        self.sector.set(r.read_u64::<BigEndian>()?);
        self.sector_count.set(r.read_u32::<BigEndian>()?);
        let buflen = r.read_u32::<BigEndian>()? as usize;
        self.buflen.set(buflen);
        if buflen > 0 {
            self.buf.borrow_mut().resize(buflen, 0);
            let iov = (self.sector_count.get() as u64 * 512).min(buflen as u64) as usize;
            self.iov_len.set(iov);
            if self.cmd.mode == XferMode::ToDev {
                r.read_exact(&mut self.buf.borrow_mut()[..iov])?;
            } else if !self.retry.get() {
                let len = r.read_u32::<BigEndian>()? as usize;
                if len > buflen {
                    return Err(ScsiError::Migration(format!(
                        "iovec length {} exceeds buffer {}",
                        len, buflen
                    )));
                }
                self.iov_len.set(len);
                r.read_exact(&mut self.buf.borrow_mut()[..len])?;
            }
        }
        Ok(())
    }
}
