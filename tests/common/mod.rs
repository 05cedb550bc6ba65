//! Shared mock backend and host-adapter harness for integration tests
//!
//! The mock backend queues async submissions and only completes them when
//! the test pumps its completion queue, mirroring the cooperative event
//! loop contract: callbacks are never invoked from inside a submission.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use scsi_emu::{
    create_device, AcctCookie, AcctType, AioBuf, AioCallback, AioHandle, AioResult, BlockBackend,
    BlockError, DeviceOptions, ErrorAction, ReportedAction, ScsiBus, ScsiDisk, ScsiRequest,
};

enum IoKind {
    Read { sector: u64, buf: AioBuf },
    Write { sector: u64, buf: AioBuf },
    Flush,
}

struct PendingIo {
    handle: AioHandle,
    kind: IoKind,
    cb: AioCallback,
}

/// In-memory block backend with scripted failures and deferred completion
///
/// Only the first few thousand sectors are actually backed by memory; the
/// reported geometry can be much larger so capacity-reporting commands
/// can be tested against big media.
pub struct MockBackend {
    geometry: u64,
    pub data: Vec<u8>,
    pub inserted: bool,
    pub read_only: bool,
    pub write_cache: bool,
    pub on_error_read: ErrorAction,
    pub on_error_write: ErrorAction,
    /// Scripted per-completion failures, consumed front to back
    pub fail: VecDeque<BlockError>,
    /// Deliver completions for cancelled submissions instead of dropping
    /// them, to exercise the late-completion path
    pub cancel_delivers: bool,
    pending: VecDeque<PendingIo>,
    next_handle: u64,
    pub cancelled: Vec<AioHandle>,
    pub discards: Vec<(u64, u32)>,
    pub flushes: usize,
    pub ejects: Vec<bool>,
    pub locks: Vec<bool>,
    pub acct_open: i64,
    pub iostatus: Option<BlockError>,
    pub events: Vec<(ReportedAction, bool)>,
}

impl MockBackend {
    pub fn new(sectors: u64) -> Self {
        let backed = sectors.min(4096) as usize;
        let mut data = vec![0u8; backed * 512];
        for (i, b) in data.iter_mut().enumerate() {
            *b = ((i / 512) as u8).wrapping_add((i % 512) as u8);
        }
        MockBackend {
            geometry: sectors,
            data,
            inserted: true,
            read_only: false,
            write_cache: true,
            on_error_read: ErrorAction::Report,
            on_error_write: ErrorAction::Report,
            fail: VecDeque::new(),
            cancel_delivers: false,
            pending: VecDeque::new(),
            next_handle: 0,
            cancelled: Vec::new(),
            discards: Vec::new(),
            flushes: 0,
            ejects: Vec::new(),
            locks: Vec::new(),
            acct_open: 0,
            iostatus: None,
            events: Vec::new(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn push(&mut self, kind: IoKind, cb: AioCallback) -> AioHandle {
        self.next_handle += 1;
        let handle = AioHandle(self.next_handle);
        self.pending.push_back(PendingIo { handle, kind, cb });
        handle
    }

    fn copy_read(data: &[u8], sector: u64, buf: &AioBuf) {
        let mut off = sector as usize * 512;
        match buf {
            AioBuf::Bounce { buf, len } => {
                buf.borrow_mut()[..*len].copy_from_slice(&data[off..off + len]);
            }
            AioBuf::Sg(sg) => {
                for seg in sg.segments() {
                    let mut seg = seg.borrow_mut();
                    let n = seg.len();
                    seg.copy_from_slice(&data[off..off + n]);
                    off += n;
                }
            }
        }
    }

    fn copy_write(data: &mut [u8], sector: u64, buf: &AioBuf) {
        let mut off = sector as usize * 512;
        match buf {
            AioBuf::Bounce { buf, len } => {
                data[off..off + len].copy_from_slice(&buf.borrow()[..*len]);
            }
            AioBuf::Sg(sg) => {
                for seg in sg.segments() {
                    let seg = seg.borrow();
                    data[off..off + seg.len()].copy_from_slice(&seg);
                    off += seg.len();
                }
            }
        }
    }

    /// Complete every queued submission, returning the callbacks for the
    /// caller to invoke outside the backend borrow.
    fn take_completions(&mut self) -> Vec<(AioCallback, AioResult)> {
        let mut out = Vec::new();
        while let Some(p) = self.pending.pop_front() {
            let ret = match self.fail.pop_front() {
                Some(e) => Err(e),
                None => Ok(()),
            };
            if ret.is_ok() {
                match &p.kind {
                    IoKind::Read { sector, buf } => Self::copy_read(&self.data, *sector, buf),
                    IoKind::Write { sector, buf } => Self::copy_write(&mut self.data, *sector, buf),
                    IoKind::Flush => self.flushes += 1,
                }
            }
            out.push((p.cb, ret));
        }
        out
    }
}

impl BlockBackend for MockBackend {
    fn get_geometry(&self) -> u64 {
        self.geometry
    }

    fn is_inserted(&self) -> bool {
        self.inserted
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn enable_write_cache(&self) -> bool {
        self.write_cache
    }

    fn get_on_error(&self, is_read: bool) -> ErrorAction {
        if is_read {
            self.on_error_read
        } else {
            self.on_error_write
        }
    }

    fn aio_readv(&mut self, sector: u64, buf: AioBuf, cb: AioCallback) -> AioHandle {
        self.push(IoKind::Read { sector, buf }, cb)
    }

    fn aio_writev(&mut self, sector: u64, buf: AioBuf, cb: AioCallback) -> AioHandle {
        self.push(IoKind::Write { sector, buf }, cb)
    }

    fn aio_flush(&mut self, cb: AioCallback) -> AioHandle {
        self.push(IoKind::Flush, cb)
    }

    fn aio_cancel(&mut self, handle: AioHandle) {
        self.cancelled.push(handle);
        if !self.cancel_delivers {
            // Drop the submission; its callback is never invoked.
            self.pending.retain(|p| p.handle != handle);
        }
    }

    fn discard(&mut self, sector: u64, nb_sectors: u32) -> Result<(), BlockError> {
        self.discards.push((sector, nb_sectors));
        Ok(())
    }

    fn acct_start(&mut self, _op: AcctType, _bytes: usize) -> AcctCookie {
        self.acct_open += 1;
        AcctCookie(self.acct_open as u64)
    }

    fn acct_done(&mut self, _cookie: AcctCookie) {
        self.acct_open -= 1;
    }

    fn eject(&mut self, eject_flag: bool) {
        self.ejects.push(eject_flag);
    }

    fn lock_medium(&mut self, locked: bool) {
        self.locks.push(locked);
    }

    fn set_iostatus_err(&mut self, err: BlockError) {
        self.iostatus = Some(err);
    }

    fn report_error_event(&mut self, action: ReportedAction, is_read: bool) {
        self.events.push((action, is_read));
    }

    fn device_name(&self) -> String {
        String::from("drive0")
    }
}

/// Host adapter that records notifications; the test loop re-enters the
/// request from outside the callback, as the bus contract requires.
#[derive(Default)]
pub struct TestBus {
    pub transfers: VecDeque<usize>,
    pub completions: Vec<(u32, u8)>,
    pub cancelled: Vec<u32>,
    pub vm_stops: usize,
    pub tcq: bool,
}

impl ScsiBus for TestBus {
    fn transfer_data(&mut self, _req: &Rc<ScsiRequest>, len: usize) {
        self.transfers.push_back(len);
    }

    fn complete(&mut self, req: &Rc<ScsiRequest>, status: u8) {
        self.completions.push((req.tag(), status));
    }

    fn request_cancelled(&mut self, req: &Rc<ScsiRequest>) {
        self.cancelled.push(req.tag());
    }

    fn stop_vm(&mut self) {
        self.vm_stops += 1;
    }

    fn tcq(&self) -> bool {
        self.tcq
    }
}

/// Device, backend and bus wired together for one test
pub struct Harness {
    pub backend: Rc<RefCell<MockBackend>>,
    pub bus: Rc<RefCell<TestBus>>,
    pub bus_dyn: Rc<RefCell<dyn ScsiBus>>,
    pub dev: Rc<ScsiDisk>,
}

/// Opt-in test logging: `RUST_LOG=debug cargo test -- --nocapture`
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

impl Harness {
    pub fn new(model: &str, sectors_512: u64, opts: DeviceOptions) -> Harness {
        init_logging();
        let backend = Rc::new(RefCell::new(MockBackend::new(sectors_512)));
        let dev = create_device(model, backend.clone(), opts).unwrap();
        let bus = Rc::new(RefCell::new(TestBus::default()));
        let bus_dyn: Rc<RefCell<dyn ScsiBus>> = bus.clone();
        Harness {
            backend,
            bus,
            bus_dyn,
            dev,
        }
    }

    pub fn hd(sectors_512: u64) -> Harness {
        Harness::new("scsi-hd", sectors_512, DeviceOptions::default())
    }

    pub fn cd(sectors_512: u64) -> Harness {
        Harness::new("scsi-cd", sectors_512, DeviceOptions::default())
    }

    pub fn request(&self, tag: u32, cdb: &[u8]) -> Rc<ScsiRequest> {
        self.dev.new_request(&self.bus_dyn, tag, 0, cdb, None).unwrap()
    }

    /// Deliver queued backend completions until none remain.
    pub fn pump(&self) {
        loop {
            let completions = self.backend.borrow_mut().take_completions();
            if completions.is_empty() {
                break;
            }
            for (cb, ret) in completions {
                cb(ret);
            }
        }
    }

    /// Deliver only the completions queued so far; submissions made by
    /// their callbacks stay pending.
    pub fn pump_once(&self) {
        let completions = self.backend.borrow_mut().take_completions();
        for (cb, ret) in completions {
            cb(ret);
        }
    }

    fn pop_transfer(&self) -> Option<usize> {
        self.bus.borrow_mut().transfers.pop_front()
    }

    /// Drive a transfer from the device to completion, collecting the
    /// payload chunk by chunk.
    pub fn run_read(&self, req: &Rc<ScsiRequest>) -> Vec<u8> {
        let mut out = Vec::new();
        req.read_data();
        loop {
            self.pump();
            match self.pop_transfer() {
                Some(len) => {
                    out.extend_from_slice(&req.buf().borrow()[..len]);
                    req.read_data();
                }
                None => break,
            }
        }
        out
    }

    /// Drive a transfer to the device, feeding `payload` chunk by chunk.
    pub fn run_write(&self, req: &Rc<ScsiRequest>, payload: &[u8]) {
        let mut off = 0;
        req.write_data();
        loop {
            self.pump();
            match self.pop_transfer() {
                Some(len) => {
                    let n = len.min(payload.len() - off);
                    req.buf().borrow_mut()[..n].copy_from_slice(&payload[off..off + n]);
                    off += n;
                    req.write_data();
                }
                None => break,
            }
        }
    }

    /// Issue a CDB and, for emulated data-in commands, return the payload.
    pub fn execute(&self, tag: u32, cdb: &[u8]) -> (Rc<ScsiRequest>, Vec<u8>) {
        let req = self.request(tag, cdb);
        let len = req.send_command();
        let payload = if len > 0 {
            self.run_read(&req)
        } else {
            Vec::new()
        };
        (req, payload)
    }

    pub fn status_of(&self, tag: u32) -> Option<u8> {
        self.bus
            .borrow()
            .completions
            .iter()
            .rev()
            .find(|(t, _)| *t == tag)
            .map(|(_, s)| *s)
    }

    /// Pattern the mock backend stores at the given byte range.
    pub fn backend_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.backend.borrow().data[offset..offset + len].to_vec()
    }
}
