//! Software loopback backend.
//!
//! Simulates a USB host whose devices echo traffic: every packet written to
//! an OUT endpoint becomes available, in order, on the IN endpoint with the
//! same number. Control OUT transfers store their payload, and control IN
//! transfers read it back. The backend exists so that the full device
//! lifecycle (enumeration, hotplug, claims, transfers, streams, stalls,
//! disconnects) can be exercised without hardware, both by this crate's
//! tests and by applications.
//!
//! Each open device is served by one worker thread, which doubles as the
//! backend's completion thread: it consumes submitted requests and resolves
//! them through the device's [`CompletionSink`]. An IN transfer with no data
//! available stays pending until a matching OUT arrives, it is aborted, or
//! the device disappears: exactly the situations the transfer engine's
//! timeout and cancellation paths need to handle.
//!
//! Delivery is packetized: each OUT transfer is handed to exactly one IN
//! transfer. An IN requesting fewer bytes than the packet holds drops the
//! excess, as a real endpoint would on babble.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use crate::backend::{
    Completion, CompletionSink, DeviceBackend, HostBackend, HotplugEvent, NativeId,
    TransferRequest, TransferStatus,
};
use crate::descriptor::{Direction, TransferType, DESCRIPTOR_TYPE_STRING};
use crate::{Error, Result};

/// Description of one simulated device: its raw descriptors and strings.
///
/// [`LoopbackDevice::new`] builds the standard loopback topology; custom
/// devices can fill the fields directly.
#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    /// The 18-byte device descriptor.
    pub device_descriptor: Vec<u8>,
    /// The full configuration descriptor.
    pub configuration_descriptor: Vec<u8>,
    /// String descriptors by index.
    pub strings: HashMap<u8, String>,
}

impl LoopbackDevice {
    /// A loopback device with the standard topology:
    ///
    /// - interface 0, alternate 0: bulk OUT/IN pair on endpoint 1
    ///   (64-byte packets) and interrupt OUT/IN pair on endpoint 2
    ///   (16-byte packets);
    /// - interface 0, alternate 1: the bulk pair only, with 512-byte packets;
    /// - interface 1, alternate 0: no endpoints.
    #[must_use]
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        let vendor = vendor_id.to_le_bytes();
        let product = product_id.to_le_bytes();
        let device_descriptor = vec![
            18, 1, 0x00, 0x02, 0, 0, 0, 64, vendor[0], vendor[1], product[0], product[1], 0x00,
            0x01, 1, 2, 3, 1,
        ];
        let records: &[&[u8]] = &[
            &[9, 2, 0, 0, 2, 1, 0, 0x80, 50],
            &[9, 4, 0, 0, 4, 0xff, 0, 0, 0],
            &[7, 5, 0x01, 0x02, 64, 0, 0],
            &[7, 5, 0x81, 0x02, 64, 0, 0],
            &[7, 5, 0x02, 0x03, 16, 0, 1],
            &[7, 5, 0x82, 0x03, 16, 0, 1],
            &[9, 4, 0, 1, 2, 0xff, 0, 0, 0],
            &[7, 5, 0x01, 0x02, 0x00, 0x02, 0],
            &[7, 5, 0x81, 0x02, 0x00, 0x02, 0],
            &[9, 4, 1, 0, 0, 0xff, 0x42, 0, 0],
        ];
        let mut configuration_descriptor: Vec<u8> = records.concat();
        let total = configuration_descriptor.len() as u16;
        configuration_descriptor[2..4].copy_from_slice(&total.to_le_bytes());

        let mut strings = HashMap::new();
        strings.insert(1, "usbio".to_string());
        strings.insert(2, "Loopback device".to_string());
        strings.insert(3, "LB-0001".to_string());
        LoopbackDevice {
            device_descriptor,
            configuration_descriptor,
            strings,
        }
    }
}

struct DeviceSlot {
    device: LoopbackDevice,
    // command channel of the worker serving the open device, if any
    worker: Option<mpsc::Sender<Command>>,
}

struct BackendInner {
    devices: Mutex<HashMap<NativeId, DeviceSlot>>,
    events: Mutex<Option<mpsc::Sender<HotplugEvent>>>,
    next_id: AtomicU64,
}

/// The loopback host backend. Cloning yields another handle to the same
/// simulated bus, which is how tests keep control of it after handing it to
/// a [`Registry`](crate::Registry).
#[derive(Clone)]
pub struct LoopbackBackend {
    inner: Arc<BackendInner>,
}

impl LoopbackBackend {
    /// An empty simulated bus.
    #[must_use]
    pub fn new() -> Self {
        LoopbackBackend {
            inner: Arc::new(BackendInner {
                devices: Mutex::new(HashMap::new()),
                events: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Connect a simulated device, returning its native id. Emits a hotplug
    /// arrival if a registry is listening.
    pub fn plug(&self, device: LoopbackDevice) -> NativeId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .devices
            .lock()
            .unwrap()
            .insert(id, DeviceSlot {
                device,
                worker: None,
            });
        self.emit(HotplugEvent::Arrived(id));
        id
    }

    /// Disconnect a simulated device. In-flight transfers complete with a
    /// disconnect status, and a hotplug removal is emitted.
    pub fn unplug(&self, id: NativeId) {
        let slot = self.inner.devices.lock().unwrap().remove(&id);
        let Some(slot) = slot else { return };
        if let Some(worker) = slot.worker {
            let _ = worker.send(Command::Disconnect);
        }
        self.emit(HotplugEvent::Left(id));
    }

    /// Put an endpoint of an open device into the halted state. Pending and
    /// subsequent transfers on the endpoint fail with a stall until the halt
    /// is cleared.
    pub fn halt_endpoint(&self, id: NativeId, endpoint_address: u8) {
        let devices = self.inner.devices.lock().unwrap();
        if let Some(worker) = devices.get(&id).and_then(|slot| slot.worker.as_ref()) {
            let _ = worker.send(Command::Halt(endpoint_address));
        }
    }

    fn emit(&self, event: HotplugEvent) {
        if let Some(sender) = self.inner.events.lock().unwrap().as_ref() {
            let _ = sender.send(event);
        }
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend for LoopbackBackend {
    fn enumerate(&self) -> Result<Vec<NativeId>> {
        let mut ids: Vec<NativeId> = self.inner.devices.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn hotplug_events(&self) -> Result<mpsc::Receiver<HotplugEvent>> {
        let (tx, rx) = mpsc::channel();
        *self.inner.events.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    fn device_descriptor(&self, device: NativeId) -> Result<Vec<u8>> {
        let devices = self.inner.devices.lock().unwrap();
        let slot = devices.get(&device).ok_or(Error::Disconnected)?;
        Ok(slot.device.device_descriptor.clone())
    }

    fn configuration_descriptor(&self, device: NativeId) -> Result<Vec<u8>> {
        let devices = self.inner.devices.lock().unwrap();
        let slot = devices.get(&device).ok_or(Error::Disconnected)?;
        Ok(slot.device.configuration_descriptor.clone())
    }

    fn string_descriptor(&self, device: NativeId, index: u8, _language_id: u16) -> Result<Vec<u8>> {
        let devices = self.inner.devices.lock().unwrap();
        let slot = devices.get(&device).ok_or(Error::Disconnected)?;
        slot.device
            .strings
            .get(&index)
            .map(|value| encode_string_descriptor(value))
            .ok_or_else(|| Error::native(format!("no string descriptor with index {index}"), None))
    }

    fn open(&self, device: NativeId, sink: Arc<CompletionSink>) -> Result<Arc<dyn DeviceBackend>> {
        let mut devices = self.inner.devices.lock().unwrap();
        let slot = devices.get_mut(&device).ok_or(Error::Disconnected)?;
        let (tx, rx) = mpsc::channel();
        slot.worker = Some(tx.clone());
        thread::Builder::new()
            .name("usbio-loopback".into())
            .spawn(move || worker(&rx, &sink))
            .map_err(|err| Error::native(format!("could not start loopback worker: {err}"), None))?;
        Ok(Arc::new(LoopbackDeviceBackend {
            commands: tx,
            claimed: Mutex::new(HashSet::new()),
        }))
    }
}

struct LoopbackDeviceBackend {
    commands: mpsc::Sender<Command>,
    claimed: Mutex<HashSet<u8>>,
}

impl DeviceBackend for LoopbackDeviceBackend {
    fn claim_interface(&self, number: u8) -> Result<()> {
        if self.claimed.lock().unwrap().insert(number) {
            Ok(())
        } else {
            Err(Error::AlreadyClaimed(number))
        }
    }

    fn release_interface(&self, number: u8) -> Result<()> {
        if self.claimed.lock().unwrap().remove(&number) {
            Ok(())
        } else {
            Err(Error::NotClaimed(number))
        }
    }

    fn set_alternate_setting(&self, _number: u8, _alternate: u8) -> Result<()> {
        Ok(())
    }

    fn submit(&self, request: TransferRequest) -> Result<()> {
        self.commands
            .send(Command::Submit(request))
            .map_err(|_| Error::Disconnected)
    }

    fn abort(&self, endpoint: u8) -> Result<()> {
        self.commands
            .send(Command::Abort(endpoint))
            .map_err(|_| Error::Disconnected)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.commands
            .send(Command::ClearHalt(endpoint))
            .map_err(|_| Error::Disconnected)
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

enum Command {
    Submit(TransferRequest),
    Abort(u8),
    ClearHalt(u8),
    Halt(u8),
    Disconnect,
    Close,
}

#[derive(Default)]
struct EndpointPipe {
    // packets written by OUT transfers, oldest first
    data: VecDeque<Vec<u8>>,
    // IN transfers waiting for data, oldest first
    waiting: VecDeque<TransferRequest>,
}

struct Worker<'a> {
    sink: &'a CompletionSink,
    // pipes keyed by endpoint number; OUT feeds the same-numbered IN
    pipes: HashMap<u8, EndpointPipe>,
    // halted endpoint addresses
    halted: HashSet<u8>,
    // payload of the last control OUT, echoed by control IN
    control: Vec<u8>,
}

fn worker(commands: &mpsc::Receiver<Command>, sink: &Arc<CompletionSink>) {
    let mut state = Worker {
        sink: sink.as_ref(),
        pipes: HashMap::new(),
        halted: HashSet::new(),
        control: Vec::new(),
    };
    for command in commands {
        match command {
            Command::Submit(request) => state.submit(request),
            Command::Abort(endpoint) => state.abort(endpoint),
            Command::ClearHalt(endpoint) => {
                state.halted.remove(&endpoint);
            }
            Command::Halt(endpoint) => state.halt(endpoint),
            Command::Disconnect => {
                state.fail_all(TransferStatus::Disconnected);
                return;
            }
            Command::Close => {
                state.fail_all(TransferStatus::Cancelled);
                return;
            }
        }
    }
    // every sender dropped without an explicit close
    state.fail_all(TransferStatus::Cancelled);
}

impl Worker<'_> {
    fn submit(&mut self, request: TransferRequest) {
        if request.transfer_type == TransferType::Control {
            return self.handle_control(request);
        }
        if self.halted.contains(&request.endpoint) {
            return self.resolve(request.token, TransferStatus::Stalled, Vec::new());
        }
        let number = request.endpoint & 0x7f;
        match request.direction {
            Direction::Out => {
                let token = request.token;
                self.pipes.entry(number).or_default().data.push_back(request.buffer);
                self.resolve(token, TransferStatus::Completed, Vec::new());
                self.drain(number);
            }
            Direction::In => {
                self.pipes.entry(number).or_default().waiting.push_back(request);
                self.drain(number);
            }
        }
    }

    /// Match waiting IN transfers with queued packets, oldest first.
    fn drain(&mut self, number: u8) {
        let Some(pipe) = self.pipes.get_mut(&number) else {
            return;
        };
        let mut resolved = Vec::new();
        while !pipe.waiting.is_empty() && !pipe.data.is_empty() {
            let Some(request) = pipe.waiting.pop_front() else {
                break;
            };
            let Some(mut packet) = pipe.data.pop_front() else {
                break;
            };
            packet.truncate(request.buffer.len());
            resolved.push((request.token, packet));
        }
        for (token, packet) in resolved {
            self.resolve(token, TransferStatus::Completed, packet);
        }
    }

    fn handle_control(&mut self, request: TransferRequest) {
        let token = request.token;
        match request.direction {
            Direction::Out => {
                self.control = request.buffer;
                self.resolve(token, TransferStatus::Completed, Vec::new());
            }
            Direction::In => {
                let mut data = self.control.clone();
                data.truncate(request.buffer.len());
                self.resolve(token, TransferStatus::Completed, data);
            }
        }
    }

    fn abort(&mut self, endpoint: u8) {
        // only IN transfers can be pending; OUT and control complete
        // synchronously
        if Direction::from_address(endpoint) != Direction::In {
            return;
        }
        let number = endpoint & 0x7f;
        if let Some(pipe) = self.pipes.get_mut(&number) {
            let cancelled: Vec<u64> = pipe.waiting.drain(..).map(|request| request.token).collect();
            for token in cancelled {
                self.resolve(token, TransferStatus::Cancelled, Vec::new());
            }
        }
    }

    fn halt(&mut self, endpoint: u8) {
        self.halted.insert(endpoint);
        if Direction::from_address(endpoint) == Direction::In {
            let number = endpoint & 0x7f;
            if let Some(pipe) = self.pipes.get_mut(&number) {
                let stalled: Vec<u64> =
                    pipe.waiting.drain(..).map(|request| request.token).collect();
                for token in stalled {
                    self.resolve(token, TransferStatus::Stalled, Vec::new());
                }
            }
        }
    }

    fn fail_all(&mut self, status: TransferStatus) {
        let mut tokens = Vec::new();
        for pipe in self.pipes.values_mut() {
            tokens.extend(pipe.waiting.drain(..).map(|request| request.token));
        }
        for token in tokens {
            self.resolve(token, status, Vec::new());
        }
    }

    fn resolve(&self, token: u64, status: TransferStatus, data: Vec<u8>) {
        self.sink.complete(Completion {
            token,
            status,
            data,
        });
    }
}

fn encode_string_descriptor(value: &str) -> Vec<u8> {
    let units: Vec<u16> = value.encode_utf16().collect();
    let mut bytes = Vec::with_capacity(2 + units.len() * 2);
    bytes.push((2 + units.len() * 2) as u8);
    bytes.push(DESCRIPTOR_TYPE_STRING);
    for unit in units {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}
