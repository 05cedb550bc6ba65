//! A pure Rust SCSI target device emulator core
//!
//! This library interprets SCSI Command Descriptor Blocks on behalf of a
//! host bus adapter emulator and executes them against an abstract block
//! backend. Two device personalities are provided: a direct-access block
//! device (`scsi-hd`) and a removable read-only CD-ROM (`scsi-cd`).
//!
//! The host integrates three traits:
//!
//! - [`BlockBackend`] supplies storage: geometry, media state, async
//!   vectored I/O and the error-action policy.
//! - [`ScsiBus`] receives the core's notifications: data-phase transfers
//!   and command completion.
//! - [`MigrationSink`] (optional) is the downstream of the rate-limited
//!   buffered writer used while migrating a running VM.
//!
//! Everything runs on a single cooperative event loop; the core never
//! blocks and never spawns threads.
//!
//! # Example
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use scsi_emu::{create_device, DeviceOptions, ScsiBus};
//! # use scsi_emu::{BlockBackend, ScsiResult};
//!
//! # fn demo(backend: Rc<RefCell<dyn BlockBackend>>,
//! #         bus: Rc<RefCell<dyn ScsiBus>>) -> ScsiResult<()> {
//! let dev = create_device("scsi-hd", backend, DeviceOptions::default())?;
//!
//! // INQUIRY, allocation length 36
//! let cdb = [0x12, 0, 0, 0, 36, 0];
//! let req = dev.new_request(&bus, 1, 0, &cdb, None)?;
//! let len = req.send_command();
//! assert!(len > 0);
//! req.read_data(); // payload arrives via ScsiBus::transfer_data
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod buffered;
pub mod cdb;
pub mod device;
pub mod emulate;
pub mod error;
pub mod request;
pub mod sense;

pub use block::{
    AcctCookie, AcctType, AioBuf, AioCallback, AioHandle, AioResult, BlockBackend, BlockError,
    ErrorAction, ReportedAction, SgList, SharedBuf,
};
pub use buffered::{BufferedSink, MigrationSink, RateLimit, SinkError};
pub use cdb::{Cdb, XferMode};
pub use device::{create_device, device_models, DeviceKind, DeviceOptions, ScsiDisk};
pub use error::{ScsiError, ScsiResult};
pub use request::{ScsiBus, ScsiRequest, SCSI_DMA_BUF_SIZE};
pub use sense::SenseCode;

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
