//! End-to-end tests over the loopback backend: transfers, streams, stalls,
//! timeouts, cancellation, and hotplug.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use usbio::backend::loopback::{LoopbackBackend, LoopbackDevice};
use usbio::backend::NativeId;
use usbio::{ControlRequest, ControlType, Device, Direction, Error, Recipient, Registry};

const BULK_ENDPOINT: u8 = 1;
const BULK_IN_ADDRESS: u8 = 0x81;

fn setup() -> (LoopbackBackend, Registry, NativeId, Device) {
    let backend = LoopbackBackend::new();
    let id = backend.plug(LoopbackDevice::new(0x1234, 0x5678));
    let registry = Registry::with_backend(Arc::new(backend.clone()));
    let device = registry.devices().into_iter().next().expect("one device");
    (backend, registry, id, device)
}

fn vendor_request(request: u8) -> ControlRequest {
    ControlRequest {
        control_type: ControlType::Vendor,
        recipient: Recipient::Device,
        request,
        value: 0,
        index: 0,
    }
}

/// Deterministic payload for round-trip comparisons.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn read_exactly(reader: &mut impl Read, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut data[filled..]).expect("read failed");
        assert!(n > 0, "unexpected zero-length read at offset {filled}");
        filled += n;
    }
    data
}

#[test]
fn enumerates_device_with_parsed_topology() {
    let (_backend, registry, _id, device) = setup();

    assert_eq!(device.vendor_id(), 0x1234);
    assert_eq!(device.product_id(), 0x5678);
    assert_eq!(device.manufacturer(), Some("usbio"));
    assert_eq!(device.product(), Some("Loopback device"));
    assert_eq!(device.serial_number(), Some("LB-0001"));
    assert_eq!(device.usb_version().major(), 2);
    assert!(device.is_connected());
    assert!(!device.is_open());

    let interfaces = device.interfaces();
    assert_eq!(interfaces.len(), 2);
    assert_eq!(interfaces[0].number(), 0);
    assert_eq!(interfaces[0].alternates().len(), 2);
    let alt0 = &interfaces[0].alternates()[0];
    assert_eq!(alt0.endpoints().len(), 4);
    assert_eq!(
        alt0.endpoint(BULK_ENDPOINT, Direction::In)
            .map(|ep| ep.max_packet_size()),
        Some(64)
    );

    assert!(registry
        .find_device(|d| d.vendor_id() == 0x1234)
        .is_some());
    assert!(registry.find_device(|d| d.vendor_id() == 0xffff).is_none());
}

#[test]
fn control_transfers_roundtrip() {
    let (_backend, _registry, _id, device) = setup();
    device.open().unwrap();

    let payload = b"configuration blob";
    device
        .control_transfer_out(vendor_request(0x10), payload, Duration::from_secs(1))
        .unwrap();
    let echoed = device
        .control_transfer_in(
            vendor_request(0x11),
            payload.len() as u16,
            Duration::from_secs(1),
        )
        .unwrap();
    assert_eq!(echoed, payload);

    device.close().unwrap();
}

#[test]
fn bulk_roundtrips_through_streams() {
    let (_backend, _registry, _id, device) = setup();
    device.open().unwrap();
    device.claim_interface(0).unwrap();

    // 12 and 140 bytes fit the device buffering; the large payload needs
    // many pipelined transfers
    for len in [12usize, 140, 230_763] {
        let payload = pattern(len);
        let mut writer = device.open_output_stream(BULK_ENDPOINT, 4096).unwrap();
        writer.write_all(&payload).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let mut reader = device.open_input_stream(BULK_ENDPOINT, 4096).unwrap();
        let received = read_exactly(&mut reader, len);
        assert_eq!(received, payload, "round-trip of {len} bytes corrupted");
    }

    device.close().unwrap();
}

#[test]
fn raw_bulk_transfer_roundtrip() {
    let (_backend, _registry, _id, device) = setup();
    device.open().unwrap();
    device.claim_interface(0).unwrap();

    let payload = pattern(140);
    device
        .transfer_out(BULK_ENDPOINT, &payload, Duration::from_secs(1))
        .unwrap();
    let received = device
        .transfer_in(BULK_ENDPOINT, 4096, Duration::from_secs(1))
        .unwrap();
    assert_eq!(received, payload);

    device.close().unwrap();
}

#[test]
fn flush_appends_zero_length_packet_after_full_chunk() {
    let (_backend, _registry, _id, device) = setup();
    device.open().unwrap();
    device.claim_interface(0).unwrap();

    // exactly one full 64-byte packet, then flush: the device must see the
    // data packet plus a zero-length packet
    let mut writer = device.open_output_stream(BULK_ENDPOINT, 64).unwrap();
    writer.write_all(&pattern(64)).unwrap();
    writer.flush().unwrap();
    drop(writer);

    let data = device
        .transfer_in(BULK_ENDPOINT, 4096, Duration::from_secs(1))
        .unwrap();
    assert_eq!(data, pattern(64));
    let zlp = device
        .transfer_in(BULK_ENDPOINT, 4096, Duration::from_secs(1))
        .unwrap();
    assert!(zlp.is_empty(), "expected a zero-length packet");

    // an uneven payload must not produce a ZLP
    let mut writer = device.open_output_stream(BULK_ENDPOINT, 64).unwrap();
    writer.write_all(&pattern(65)).unwrap();
    writer.flush().unwrap();
    drop(writer);
    let first = device
        .transfer_in(BULK_ENDPOINT, 4096, Duration::from_secs(1))
        .unwrap();
    let second = device
        .transfer_in(BULK_ENDPOINT, 4096, Duration::from_secs(1))
        .unwrap();
    assert_eq!(first.len() + second.len(), 65);
    let err = device
        .transfer_in(BULK_ENDPOINT, 4096, Duration::from_millis(200))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout), "unexpected extra packet");

    device.close().unwrap();
}

#[test]
fn reader_surfaces_zero_length_packets() {
    let (_backend, _registry, _id, device) = setup();
    device.open().unwrap();
    device.claim_interface(0).unwrap();

    device
        .transfer_out(BULK_ENDPOINT, &pattern(64), Duration::from_secs(1))
        .unwrap();
    device
        .transfer_out(BULK_ENDPOINT, &[], Duration::from_secs(1))
        .unwrap();
    device
        .transfer_out(BULK_ENDPOINT, &pattern(5), Duration::from_secs(1))
        .unwrap();

    let mut reader = device.open_input_stream(BULK_ENDPOINT, 64).unwrap();
    let first = read_exactly(&mut reader, 64);
    assert_eq!(first, pattern(64));
    // the zero-length packet arrives as a zero-length read, not end-of-stream
    let mut buf = [0u8; 64];
    assert_eq!(reader.read(&mut buf).unwrap(), 0);
    assert_eq!(reader.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], &pattern(5)[..]);

    device.close().unwrap();
}

#[test]
fn stall_recovery() {
    let (backend, _registry, id, device) = setup();
    device.open().unwrap();
    device.claim_interface(0).unwrap();

    backend.halt_endpoint(id, BULK_IN_ADDRESS);
    let err = device
        .transfer_in(BULK_ENDPOINT, 64, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, Error::Stalled));

    // the halt is latched: the next transfer fails without reaching the
    // device
    let err = device
        .transfer_in(BULK_ENDPOINT, 64, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, Error::Stalled));

    device.clear_halt(Direction::In, BULK_ENDPOINT).unwrap();
    device
        .transfer_out(BULK_ENDPOINT, &pattern(16), Duration::from_secs(1))
        .unwrap();
    let data = device
        .transfer_in(BULK_ENDPOINT, 64, Duration::from_secs(1))
        .unwrap();
    assert_eq!(data, pattern(16));

    device.close().unwrap();
}

#[test]
fn timeout_is_bounded_and_leaves_endpoint_usable() {
    let (_backend, _registry, _id, device) = setup();
    device.open().unwrap();
    device.claim_interface(0).unwrap();

    let started = Instant::now();
    let err = device
        .transfer_in(BULK_ENDPOINT, 64, Duration::from_secs(1))
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, Error::Timeout));
    assert!(
        elapsed >= Duration::from_millis(900) && elapsed < Duration::from_secs(5),
        "timeout took {elapsed:?}"
    );

    // a subsequent unrelated transfer on the same endpoint is unaffected
    device
        .transfer_out(BULK_ENDPOINT, &pattern(8), Duration::from_secs(1))
        .unwrap();
    let data = device
        .transfer_in(BULK_ENDPOINT, 64, Duration::from_secs(1))
        .unwrap();
    assert_eq!(data, pattern(8));

    device.close().unwrap();
}

#[test]
fn abort_cancels_blocked_transfer() {
    let (_backend, _registry, _id, device) = setup();
    device.open().unwrap();
    device.claim_interface(0).unwrap();

    let worker = {
        let device = device.clone();
        thread::spawn(move || device.transfer_in(BULK_ENDPOINT, 64, Duration::ZERO))
    };
    thread::sleep(Duration::from_millis(100));
    device.abort_transfers(Direction::In, BULK_ENDPOINT).unwrap();
    let result = worker.join().unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    // aborting the control endpoint is rejected
    let err = device.abort_transfers(Direction::Out, 0).unwrap_err();
    assert!(matches!(err, Error::InvalidEndpoint(_)));

    device.close().unwrap();
}

#[test]
fn close_cancels_pending_transfers() {
    let (_backend, _registry, _id, device) = setup();
    device.open().unwrap();
    device.claim_interface(0).unwrap();

    let worker = {
        let device = device.clone();
        thread::spawn(move || device.transfer_in(BULK_ENDPOINT, 64, Duration::ZERO))
    };
    thread::sleep(Duration::from_millis(100));
    device.close().unwrap();
    let result = worker.join().unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[test]
fn disconnect_fails_blocked_transfer_promptly() {
    let (backend, registry, id, device) = setup();
    device.open().unwrap();
    device.claim_interface(0).unwrap();

    let worker = {
        let device = device.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let result = device.transfer_in(BULK_ENDPOINT, 64, Duration::from_secs(30));
            (result, started.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(100));
    backend.unplug(id);

    let (result, elapsed) = worker.join().unwrap();
    assert!(matches!(result, Err(Error::Disconnected)));
    assert!(
        elapsed < Duration::from_secs(5),
        "disconnect took the full timeout: {elapsed:?}"
    );

    // the registry drops the device and the handle turns terminal
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && !registry.devices().is_empty() {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(registry.devices().is_empty());
    assert!(!device.is_connected());
    assert!(matches!(
        device.transfer_out(BULK_ENDPOINT, b"x", Duration::ZERO),
        Err(Error::Disconnected)
    ));
    assert!(matches!(device.open(), Err(Error::Disconnected)));
    assert!(matches!(device.close(), Err(Error::Disconnected)));
}

#[test]
fn hotplug_handlers_fire_on_monitor_thread() {
    let backend = LoopbackBackend::new();
    let registry = Registry::with_backend(Arc::new(backend.clone()));

    let (connect_tx, connect_rx) = mpsc::channel::<Device>();
    let (disconnect_tx, disconnect_rx) = mpsc::channel::<Device>();
    registry.on_device_connected(Some(Arc::new(move |device: &Device| {
        let _ = connect_tx.send(device.clone());
    })));
    registry.on_device_disconnected(Some(Arc::new(move |device: &Device| {
        let _ = disconnect_tx.send(device.clone());
    })));

    let id = backend.plug(LoopbackDevice::new(0xaaaa, 0x0001));
    let connected = connect_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("connect handler not invoked");
    assert_eq!(connected.vendor_id(), 0xaaaa);
    assert_eq!(registry.devices().len(), 1);

    backend.unplug(id);
    let disconnected = disconnect_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("disconnect handler not invoked");
    assert_eq!(disconnected.vendor_id(), 0xaaaa);
    assert!(!disconnected.is_connected());

    // clearing the handler stops notifications
    registry.on_device_connected(None);
    backend.plug(LoopbackDevice::new(0xaaaa, 0x0002));
    assert!(connect_rx.recv_timeout(Duration::from_millis(300)).is_err());

    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && registry.devices().len() < 1 {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(registry.devices().len(), 1);
}

#[test]
fn reopening_after_close_works() {
    let (_backend, _registry, _id, device) = setup();

    device.open().unwrap();
    device.claim_interface(0).unwrap();
    device.close().unwrap();

    device.open().unwrap();
    device.claim_interface(0).unwrap();
    device
        .transfer_out(BULK_ENDPOINT, &pattern(3), Duration::from_secs(1))
        .unwrap();
    let data = device
        .transfer_in(BULK_ENDPOINT, 64, Duration::from_secs(1))
        .unwrap();
    assert_eq!(data, pattern(3));
    device.close().unwrap();
}
