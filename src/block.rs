//! Block backend interface consumed by the emulator core
//!
//! The core never touches storage directly. Implement [`BlockBackend`] to
//! supply geometry, media state, the error-action policy and asynchronous
//! vectored I/O. All sector arguments are in 512-byte units regardless of
//! the emulated device's logical block size.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

/// Shared bounce buffer. Single-writer: either the backend (while an async
/// submission is outstanding) or the core, never both.
pub type SharedBuf = Rc<RefCell<Vec<u8>>>;

/// Caller-owned scatter/gather list for zero-copy DMA transfers.
///
/// The host adapter builds one of these from guest memory and hands it to
/// the core; the core submits it to the backend untouched.
pub struct SgList {
    segments: Vec<SharedBuf>,
}

impl SgList {
    pub fn new(segments: Vec<SharedBuf>) -> Self {
        SgList { segments }
    }

    pub fn segments(&self) -> &[SharedBuf] {
        &self.segments
    }

    /// Total byte size across all segments.
    pub fn size(&self) -> usize {
        self.segments.iter().map(|s| s.borrow().len()).sum()
    }
}

/// Destination or source of one async transfer.
pub enum AioBuf {
    /// Core-owned bounce buffer; the first `len` bytes are transferred.
    Bounce { buf: SharedBuf, len: usize },
    /// Caller-owned scatter/gather list; its full size is transferred.
    Sg(Rc<SgList>),
}

impl AioBuf {
    pub fn len(&self) -> usize {
        match self {
            AioBuf::Bounce { len, .. } => *len,
            AioBuf::Sg(sg) => sg.size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Error classes a backend may report on I/O completion.
///
/// The request state machine branches on these when applying the
/// per-direction error-action policy.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("no medium present")]
    NoMedium,
    #[error("out of memory")]
    NoMemory,
    #[error("invalid request")]
    InvalidRequest,
    #[error("no space left on device")]
    NoSpace,
    #[error("input/output error")]
    Io,
}

/// Result of one async submission, delivered to its completion callback.
pub type AioResult = Result<(), BlockError>;

/// Completion callback for an async submission. The closure owns one
/// reference to the request it completes; dropping it unfired (e.g. after
/// a cancel) releases that reference.
pub type AioCallback = Box<dyn FnOnce(AioResult)>;

/// Token identifying an outstanding async submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioHandle(pub u64);

/// Per-direction error-action policy configured on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Complete the request as if the I/O had succeeded.
    Ignore,
    /// Stop the VM when the error is ENOSPC-class, otherwise report.
    StopEnospc,
    /// Stop the VM on any error and keep the request for retry.
    StopAny,
    /// Translate the error to sense data and report CHECK CONDITION.
    Report,
    /// Keep the request for retry without reporting to the guest.
    Retry,
}

/// Action classes surfaced to the host's telemetry stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedAction {
    Ignore,
    Stop,
    Report,
}

/// I/O accounting classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcctType {
    Read,
    Write,
    Flush,
}

/// Cookie returned by `acct_start`, closed out by `acct_done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcctCookie(pub u64);

/// Abstract contract the core requires of the storage layer.
///
/// Completion callbacks must be delivered from the host event loop, never
/// re-entrantly from within the `aio_*` submission call. `aio_cancel` may
/// either drop the stored callback unfired or deliver it later; the core
/// tolerates both.
pub trait BlockBackend {
    /// Total device size in 512-byte sectors. Zero means no medium.
    fn get_geometry(&self) -> u64;

    fn is_inserted(&self) -> bool;

    fn is_read_only(&self) -> bool;

    fn enable_write_cache(&self) -> bool;

    /// Error-action policy for the given direction.
    fn get_on_error(&self, is_read: bool) -> ErrorAction;

    fn aio_readv(&mut self, sector: u64, buf: AioBuf, cb: AioCallback) -> AioHandle;

    fn aio_writev(&mut self, sector: u64, buf: AioBuf, cb: AioCallback) -> AioHandle;

    fn aio_flush(&mut self, cb: AioCallback) -> AioHandle;

    fn aio_cancel(&mut self, handle: AioHandle);

    /// Synchronously discard a range of 512-byte sectors.
    fn discard(&mut self, sector: u64, nb_sectors: u32) -> Result<(), BlockError>;

    fn acct_start(&mut self, op: AcctType, bytes: usize) -> AcctCookie;

    fn acct_done(&mut self, cookie: AcctCookie);

    /// Load (`eject_flag` false) or eject (`eject_flag` true) the medium.
    fn eject(&mut self, _eject_flag: bool) {}

    fn lock_medium(&mut self, _locked: bool) {}

    fn set_buffer_alignment(&mut self, _align: u32) {}

    /// Record a failed I/O so the host can surface device iostatus.
    fn set_iostatus_err(&mut self, _err: BlockError) {}

    /// Emit a telemetry event for an error-policy decision.
    fn report_error_event(&mut self, _action: ReportedAction, _is_read: bool) {}

    /// Backend open-flags bitmask; meaning is host-defined.
    fn get_flags(&self) -> u32 {
        0
    }

    /// Host-assigned name of the backing drive, reported by the device
    /// identification VPD page when no serial number is configured.
    fn device_name(&self) -> String {
        String::from("drive")
    }
}
