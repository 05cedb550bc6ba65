//! Integration tests for the request state machine and data path
//!
//! These drive real transfer loops against the mock backend: chunked
//! bounce-buffer I/O, scatter/gather DMA, FUA ordering, the rw error
//! policy, cancellation and request migration.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use common::Harness;
use scsi_emu::sense::{self, status};
use scsi_emu::{BlockError, DeviceOptions, ErrorAction, SgList, SCSI_DMA_BUF_SIZE};

fn read10(lba: u32, count: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = 0x28;
    BigEndian::write_u32(&mut cdb[2..6], lba);
    BigEndian::write_u16(&mut cdb[7..9], count);
    cdb
}

fn write10(lba: u32, count: u16, fua: bool) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = 0x2a;
    if fua {
        cdb[1] = 0x08;
    }
    BigEndian::write_u32(&mut cdb[2..6], lba);
    BigEndian::write_u16(&mut cdb[7..9], count);
    cdb
}

#[test]
fn test_read_single_chunk() {
    let h = Harness::hd(4096);
    let req = h.request(1, &read10(3, 8));
    assert_eq!(req.send_command(), 8 * 512);

    let data = h.run_read(&req);
    assert_eq!(h.status_of(1), Some(status::GOOD));
    assert_eq!(data, h.backend_bytes(3 * 512, 8 * 512));
    assert_eq!(req.sector_count(), 0);
    assert_eq!(h.backend.borrow().acct_open, 0);
}

#[test]
fn test_read_chunked_transfer_is_complete() {
    // 600 sectors span three bounce-buffer chunks
    let h = Harness::hd(1024);
    let req = h.request(1, &read10(0, 600));
    assert_eq!(req.send_command(), 600 * 512);

    let data = h.run_read(&req);
    assert_eq!(h.status_of(1), Some(status::GOOD));
    // the delivered payload sums to exactly sector_count * 512
    assert_eq!(data.len(), 600 * 512);
    assert_eq!(data, h.backend_bytes(0, 600 * 512));
    assert_eq!(h.backend.borrow().acct_open, 0);
}

#[test]
fn test_read_cdrom_block_conversion() {
    let h = Harness::cd(1_000_000);
    // 2048-byte blocks: LBA 3, two blocks
    let req = h.request(1, &read10(3, 2));
    assert_eq!(req.send_command(), 2 * 2048);

    let data = h.run_read(&req);
    assert_eq!(data, h.backend_bytes(3 * 2048, 2 * 2048));
}

#[test]
fn test_write_chunked() {
    let h = Harness::hd(1024);
    let payload: Vec<u8> = (0..600u32 * 512).map(|i| (i % 253) as u8).collect();
    let req = h.request(1, &write10(16, 600, false));
    assert_eq!(req.send_command(), -(600 * 512));

    h.run_write(&req, &payload);
    assert_eq!(h.status_of(1), Some(status::GOOD));
    assert_eq!(h.backend_bytes(16 * 512, 600 * 512), payload);
    assert_eq!(h.backend.borrow().flushes, 0);
    assert_eq!(h.backend.borrow().acct_open, 0);
}

#[test]
fn test_write_fua_flushes_after_data() {
    let h = Harness::hd(1024);
    let payload = vec![0xabu8; 8 * 512];
    let req = h.request(1, &write10(0, 8, true));
    req.send_command();

    req.write_data();
    let len = h.bus.borrow_mut().transfers.pop_front().unwrap();
    req.buf().borrow_mut()[..len].copy_from_slice(&payload[..len]);
    req.write_data();

    // the writev completes; the flush must be issued before GOOD
    h.pump_once();
    assert_eq!(h.status_of(1), None);
    assert_eq!(h.backend.borrow().flushes, 0);
    assert_eq!(h.backend.borrow().outstanding(), 1);

    h.pump_once();
    assert_eq!(h.backend.borrow().flushes, 1);
    assert_eq!(h.status_of(1), Some(status::GOOD));
}

#[test]
fn test_read_fua_flushes_before_data() {
    let h = Harness::hd(1024);
    let mut cdb = read10(0, 4);
    cdb[1] = 0x08; // FUA
    let req = h.request(1, &cdb);
    req.send_command();

    req.read_data();
    // only the flush is outstanding; no data has been read yet
    assert_eq!(h.backend.borrow().outstanding(), 1);
    h.pump();
    assert_eq!(h.backend.borrow().flushes, 1);

    // then the data phase proceeds normally
    let mut data = Vec::new();
    loop {
        h.pump();
        match h.bus.borrow_mut().transfers.pop_front() {
            Some(len) => {
                data.extend_from_slice(&req.buf().borrow()[..len]);
                req.read_data();
            }
            None => break,
        }
    }
    assert_eq!(h.status_of(1), Some(status::GOOD));
    assert_eq!(data, h.backend_bytes(0, 4 * 512));
}

#[test]
fn test_verify_consumes_data_without_writing() {
    let h = Harness::hd(1024);
    let before = h.backend_bytes(0, 8 * 512);
    let mut cdb = [0u8; 10];
    cdb[0] = 0x2f; // VERIFY(10)
    BigEndian::write_u16(&mut cdb[7..9], 8);
    let req = h.request(1, &cdb);
    assert_eq!(req.send_command(), -(8 * 512));

    h.run_write(&req, &vec![0xeeu8; 8 * 512]);
    // VERIFY implies FUA, so a flush still runs before GOOD
    assert_eq!(h.status_of(1), Some(status::GOOD));
    assert_eq!(h.backend_bytes(0, 8 * 512), before);
    assert_eq!(h.backend.borrow().flushes, 1);
}

#[test]
fn test_sg_list_read_single_dma() {
    let h = Harness::hd(1024);
    let segments: Vec<_> = (0..4)
        .map(|_| Rc::new(RefCell::new(vec![0u8; 512])))
        .collect();
    let sg = Rc::new(SgList::new(segments.clone()));

    let req = h.request(1, &read10(8, 4));
    req.set_sg(Some(sg));
    req.send_command();
    req.read_data();

    assert_eq!(h.backend.borrow().outstanding(), 1);
    h.pump();
    assert_eq!(h.status_of(1), Some(status::GOOD));
    for (i, seg) in segments.iter().enumerate() {
        assert_eq!(*seg.borrow(), h.backend_bytes((8 + i) * 512, 512));
    }
    // a scatter/gather transfer never notifies chunk by chunk
    assert!(h.bus.borrow().transfers.is_empty());
}

#[test]
fn test_sg_list_write_single_dma() {
    let h = Harness::hd(1024);
    let segments: Vec<_> = (0..4)
        .map(|i| Rc::new(RefCell::new(vec![i as u8 + 1; 512])))
        .collect();
    let sg = Rc::new(SgList::new(segments));

    let req = h.request(1, &write10(32, 4, false));
    req.set_sg(Some(sg));
    req.send_command();
    req.write_data();

    h.pump();
    assert_eq!(h.status_of(1), Some(status::GOOD));
    assert_eq!(h.backend_bytes(32 * 512, 512), vec![1u8; 512]);
    assert_eq!(h.backend_bytes(35 * 512, 512), vec![4u8; 512]);
}

#[test]
fn test_synchronize_cache() {
    let h = Harness::hd(1024);
    let req = h.request(1, &[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(req.send_command(), 0);
    assert_eq!(h.status_of(1), None);

    h.pump();
    assert_eq!(h.backend.borrow().flushes, 1);
    assert_eq!(h.status_of(1), Some(status::GOOD));
    assert_eq!(h.backend.borrow().acct_open, 0);
}

#[test]
fn test_synchronize_cache_error_reports() {
    let h = Harness::hd(1024);
    h.backend.borrow_mut().fail.push_back(BlockError::Io);
    let req = h.request(1, &[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    req.send_command();
    h.pump();
    assert_eq!(h.status_of(1), Some(status::CHECK_CONDITION));
    assert_eq!(req.sense(), Some(sense::IO_ERROR));
}

#[test]
fn test_error_policy_report_maps_errno_to_sense() {
    for (err, expected) in [
        (BlockError::NoMedium, sense::NO_MEDIUM),
        (BlockError::NoMemory, sense::TARGET_FAILURE),
        (BlockError::InvalidRequest, sense::INVALID_FIELD),
        (BlockError::Io, sense::IO_ERROR),
    ] {
        let h = Harness::hd(1024);
        h.backend.borrow_mut().fail.push_back(err);
        let req = h.request(1, &read10(0, 4));
        req.send_command();
        req.read_data();
        h.pump();
        assert_eq!(h.status_of(1), Some(status::CHECK_CONDITION));
        assert_eq!(req.sense(), Some(expected));
        let backend = h.backend.borrow();
        assert_eq!(
            backend.events,
            vec![(scsi_emu::ReportedAction::Report, true)]
        );
        assert_eq!(backend.acct_open, 0);
    }
}

#[test]
fn test_error_policy_ignore_continues() {
    let h = Harness::hd(1024);
    h.backend.borrow_mut().on_error_read = ErrorAction::Ignore;
    h.backend.borrow_mut().fail.push_back(BlockError::Io);

    let req = h.request(1, &read10(0, 4));
    req.send_command();
    let _ = h.run_read(&req);

    // the guest never sees the error
    assert_eq!(h.status_of(1), Some(status::GOOD));
    assert_eq!(
        h.backend.borrow().events,
        vec![(scsi_emu::ReportedAction::Ignore, true)]
    );
}

#[test]
fn test_error_policy_stop_marks_retry_and_resumes() {
    let h = Harness::hd(1024);
    h.backend.borrow_mut().on_error_write = ErrorAction::StopAny;
    h.backend.borrow_mut().fail.push_back(BlockError::Io);

    let payload = vec![0x5au8; 4 * 512];
    let req = h.request(1, &write10(64, 4, false));
    req.send_command();
    req.write_data();
    let len = h.bus.borrow_mut().transfers.pop_front().unwrap();
    req.buf().borrow_mut()[..len].copy_from_slice(&payload);
    req.write_data();
    h.pump();

    // the VM stopped, iostatus was set and the request is preserved
    assert_eq!(h.status_of(1), None);
    assert_eq!(h.bus.borrow().vm_stops, 1);
    assert_eq!(h.backend.borrow().iostatus, Some(BlockError::Io));
    assert!(req.is_retry());
    assert_eq!(req.sector(), 64); // cursor unchanged, chunk not consumed
    assert_eq!(
        h.backend.borrow().events,
        vec![(scsi_emu::ReportedAction::Stop, false)]
    );

    // resume: the command replays from its cursor and succeeds
    req.restart();
    h.pump();
    assert_eq!(h.status_of(1), Some(status::GOOD));
    assert_eq!(h.backend_bytes(64 * 512, 4 * 512), payload);
}

#[test]
fn test_error_policy_stop_enospc() {
    let h = Harness::hd(1024);
    h.backend.borrow_mut().on_error_write = ErrorAction::StopEnospc;

    // a non-ENOSPC error still goes to the guest
    h.backend.borrow_mut().fail.push_back(BlockError::Io);
    let req = h.request(1, &write10(0, 4, false));
    req.send_command();
    h.run_write(&req, &vec![0u8; 4 * 512]);
    assert_eq!(h.status_of(1), Some(status::CHECK_CONDITION));
    assert_eq!(h.bus.borrow().vm_stops, 0);

    // ENOSPC stops the VM
    h.backend.borrow_mut().fail.push_back(BlockError::NoSpace);
    let req = h.request(2, &write10(0, 4, false));
    req.send_command();
    req.write_data();
    let len = h.bus.borrow_mut().transfers.pop_front().unwrap();
    req.buf().borrow_mut()[..len].fill(0);
    req.write_data();
    h.pump();
    assert_eq!(h.status_of(2), None);
    assert_eq!(h.bus.borrow().vm_stops, 1);
    assert!(req.is_retry());
}

#[test]
fn test_cancel_drops_submission_reference() {
    let h = Harness::hd(1024);
    let req = h.request(1, &read10(0, 8));
    req.send_command();
    req.read_data();

    // held by the test, the device queue and the submission closure
    assert_eq!(Rc::strong_count(&req), 3);

    req.cancel_io();
    assert!(req.is_io_canceled());
    assert_eq!(h.backend.borrow().cancelled.len(), 1);
    // the backend dropped the callback; its reference went with it
    assert_eq!(Rc::strong_count(&req), 2);
    // accounting was closed out on the cancellation path
    assert_eq!(h.backend.borrow().acct_open, 0);

    h.pump();
    assert_eq!(h.status_of(1), None);
    assert!(h.bus.borrow().transfers.is_empty());
}

#[test]
fn test_cancel_tolerates_late_completion() {
    let h = Harness::hd(1024);
    h.backend.borrow_mut().cancel_delivers = true;

    let req = h.request(1, &read10(0, 8));
    req.send_command();
    req.read_data();
    req.cancel_io();

    // the completion still arrives; it must not advance device state
    let sector_before = req.sector();
    h.pump();
    assert_eq!(req.sector(), sector_before);
    assert_eq!(h.status_of(1), None);
    assert!(h.bus.borrow().transfers.is_empty());
    // the late completion released the submission reference exactly once
    assert_eq!(Rc::strong_count(&req), 2);
}

#[test]
fn test_purge_requests_on_reset() {
    let h = Harness::hd(1024);
    let req = h.request(1, &read10(0, 8));
    req.send_command();
    req.read_data();

    h.dev.reset();
    assert!(req.is_io_canceled());
    assert_eq!(h.bus.borrow().cancelled, vec![1]);
    // the reset is latched as a unit attention for the next command
    assert_eq!(h.dev.pending_unit_attention(), Some(sense::RESET));
    // the device queue dropped its reference
    assert_eq!(Rc::strong_count(&req), 1);
}

#[test]
fn test_tray_open_mid_transfer_fails_with_no_medium() {
    let h = Harness::cd(1_000_000);
    let req = h.request(1, &read10(0, 1));
    req.send_command();
    h.dev.set_tray_open(true);
    req.read_data();
    h.pump();
    assert_eq!(h.status_of(1), Some(status::CHECK_CONDITION));
    assert_eq!(req.sense(), Some(sense::NO_MEDIUM));
}

#[test]
fn test_request_migration_round_trip_write() {
    let h = Harness::hd(1024);
    let payload = vec![0x77u8; 8 * 512];
    let req = h.request(1, &write10(5, 8, false));
    req.send_command();
    req.write_data();
    let len = h.bus.borrow_mut().transfers.pop_front().unwrap();
    req.buf().borrow_mut()[..len].copy_from_slice(&payload[..len]);

    // suspended with a filled chunk not yet submitted
    let mut stream = Vec::new();
    req.save_request(&mut stream).unwrap();

    let h2 = Harness::hd(1024);
    let restored = h2.request(1, &write10(5, 8, false));
    restored.load_request(&mut stream.as_slice()).unwrap();

    assert_eq!(restored.sector(), req.sector());
    assert_eq!(restored.sector_count(), req.sector_count());
    assert_eq!(
        &restored.buf().borrow()[..len],
        &req.buf().borrow()[..len]
    );

    // the restored request finishes the transfer on the new backend
    restored.write_data();
    loop {
        h2.pump();
        match h2.bus.borrow_mut().transfers.pop_front() {
            Some(_) => restored.write_data(),
            None => break,
        }
    }
    assert_eq!(h2.status_of(1), Some(status::GOOD));
    assert_eq!(h2.backend_bytes(5 * 512, 8 * 512), payload);
}

#[test]
fn test_request_migration_round_trip_read() {
    let h = Harness::hd(1024);
    let req = h.request(1, &read10(7, 4));
    req.send_command();
    req.read_data();
    h.pump();
    // a chunk is buffered and announced but not yet consumed
    assert_eq!(h.bus.borrow().transfers.len(), 1);

    let mut stream = Vec::new();
    req.save_request(&mut stream).unwrap();
    // sector (u64) + sector_count (u32) + buflen (u32) + len (u32) + data
    assert_eq!(stream.len(), 8 + 4 + 4 + 4 + 4 * 512);

    let h2 = Harness::hd(1024);
    let restored = h2.request(1, &read10(7, 4));
    restored.load_request(&mut stream.as_slice()).unwrap();
    assert_eq!(restored.sector(), req.sector());
    assert_eq!(restored.sector_count(), 0);
    assert_eq!(*restored.buf().borrow(), *req.buf().borrow());
}

#[test]
fn test_request_migration_rejects_oversized_iovec() {
    let h = Harness::hd(1024);
    let restored = h.request(1, &read10(0, 4));
    let mut stream = Vec::new();
    stream.extend_from_slice(&[0u8; 8]); // sector
    stream.extend_from_slice(&4u32.to_be_bytes()); // sector_count
    stream.extend_from_slice(&512u32.to_be_bytes()); // buflen
    stream.extend_from_slice(&1024u32.to_be_bytes()); // iovec len > buflen
    assert!(restored.load_request(&mut stream.as_slice()).is_err());
}

#[test]
fn test_read6_write6() {
    let h = Harness::hd(1024);
    // READ(6): LBA packed into bytes 1-3, count in byte 4
    let req = h.request(1, &[0x08, 0, 0, 9, 2, 0]);
    assert_eq!(req.send_command(), 2 * 512);
    let data = h.run_read(&req);
    assert_eq!(data, h.backend_bytes(9 * 512, 2 * 512));

    let payload = vec![0x31u8; 512];
    let req = h.request(2, &[0x0a, 0, 0, 40, 1, 0]);
    assert_eq!(req.send_command(), -512);
    h.run_write(&req, &payload);
    assert_eq!(h.status_of(2), Some(status::GOOD));
    assert_eq!(h.backend_bytes(40 * 512, 512), payload);
}

#[test]
fn test_bounce_buffer_sized_to_transfer() {
    let h = Harness::hd(1024);
    let req = h.request(1, &read10(0, 4));
    req.send_command();
    let _ = h.run_read(&req);
    // small transfers never allocate the full DMA buffer
    assert!(req.buf().borrow().len() < SCSI_DMA_BUF_SIZE);
    assert_eq!(req.buf().borrow().len(), 4 * 512);
}

#[test]
fn test_write_verify_writes_and_flushes() {
    let h = Harness::hd(1024);
    let payload = vec![0x42u8; 2 * 512];
    let mut cdb = [0u8; 10];
    cdb[0] = 0x2e; // WRITE AND VERIFY(10)
    BigEndian::write_u32(&mut cdb[2..6], 50);
    BigEndian::write_u16(&mut cdb[7..9], 2);
    let req = h.request(1, &cdb);
    assert_eq!(req.send_command(), -(2 * 512));
    h.run_write(&req, &payload);

    assert_eq!(h.status_of(1), Some(status::GOOD));
    assert_eq!(h.backend_bytes(50 * 512, 2 * 512), payload);
    // WRITE AND VERIFY implies FUA
    assert_eq!(h.backend.borrow().flushes, 1);
}

#[test]
fn test_zero_length_read_completes_immediately() {
    let h = Harness::hd(1024);
    let req = h.request(1, &read10(0, 0));
    assert_eq!(req.send_command(), 0);
    assert_eq!(h.status_of(1), Some(status::GOOD));
}

#[test]
fn test_device_options_geometry_validation() {
    let backend = Rc::new(RefCell::new(common::MockBackend::new(1024)));
    let err = scsi_emu::create_device(
        "scsi-hd",
        backend,
        DeviceOptions {
            heads: 300,
            cyls: 10,
            secs: 32,
            ..DeviceOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, scsi_emu::ScsiError::Config(_)));
}
