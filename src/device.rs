//! Device handle and lifecycle state machine.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{CompletionSink, HostBackend, NativeId};
use crate::descriptor::{
    AlternateSetting, ClassCodes, Configuration, DeviceDescriptor, Direction, Endpoint, Function,
    Interface, TransferType, Version,
};
use crate::stream::{EndpointReader, EndpointWriter};
use crate::transfer::{ControlRequest, TransferEngine};
use crate::{Error, Result};

/// Handle to one connected USB device.
///
/// Handles are produced by the [`Registry`](crate::Registry) and are cheap to
/// clone; all clones refer to the same device and share its state. Equality
/// and hashing are defined over the backend's stable native id, since
/// vendor, product, and serial number are not guaranteed unique.
///
/// A device moves through a small lifecycle: closed → opened, and per
/// interface released ⇄ claimed. Transfers require the device to be open and
/// the endpoint's interface to be claimed. Every guard is checked atomically
/// with respect to concurrent calls from other threads. Once the physical
/// device disconnects, every operation on the handle fails with
/// [`Error::Disconnected`], which callers can use to stop retrying.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// # fn main() -> usbio::Result<()> {
/// let registry = usbio::registry();
/// let device = registry
///     .find_device(|d| d.vendor_id() == 0xcafe)
///     .expect("device not connected");
/// device.open()?;
/// device.claim_interface(0)?;
/// device.transfer_out(1, b"hello", Duration::from_secs(1))?;
/// let reply = device.transfer_in(1, 64, Duration::from_secs(1))?;
/// device.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    host: Arc<dyn HostBackend>,
    id: NativeId,
    descriptor: DeviceDescriptor,
    configuration: Configuration,
    manufacturer: Option<String>,
    product: Option<String>,
    serial_number: Option<String>,
    device_descriptor_bytes: Vec<u8>,
    configuration_bytes: Vec<u8>,
    connected: AtomicBool,
    state: Mutex<DeviceState>,
}

struct DeviceState {
    open: Option<OpenState>,
    interfaces: HashMap<u8, InterfaceState>,
}

struct OpenState {
    engine: Arc<TransferEngine>,
}

struct InterfaceState {
    claimed: bool,
    current_alternate: u8,
}

impl Device {
    pub(crate) fn new(
        host: Arc<dyn HostBackend>,
        id: NativeId,
        descriptor: DeviceDescriptor,
        device_descriptor_bytes: Vec<u8>,
        configuration_bytes: Vec<u8>,
        manufacturer: Option<String>,
        product: Option<String>,
        serial_number: Option<String>,
    ) -> Result<Device> {
        let configuration = Configuration::parse(&configuration_bytes)?;
        let interfaces = configuration
            .interfaces()
            .iter()
            .map(|iface| {
                (
                    iface.number(),
                    InterfaceState {
                        claimed: false,
                        current_alternate: default_alternate(iface),
                    },
                )
            })
            .collect();
        Ok(Device {
            inner: Arc::new(DeviceInner {
                host,
                id,
                descriptor,
                configuration,
                manufacturer,
                product,
                serial_number,
                device_descriptor_bytes,
                configuration_bytes,
                connected: AtomicBool::new(true),
                state: Mutex::new(DeviceState {
                    open: None,
                    interfaces,
                }),
            }),
        })
    }

    pub(crate) fn native_id(&self) -> NativeId {
        self.inner.id
    }

    /// Vendor ID.
    #[must_use]
    pub fn vendor_id(&self) -> u16 {
        self.inner.descriptor.vendor_id()
    }

    /// Product ID.
    #[must_use]
    pub fn product_id(&self) -> u16 {
        self.inner.descriptor.product_id()
    }

    /// Device-level class code triple.
    #[must_use]
    pub fn class_codes(&self) -> ClassCodes {
        self.inner.descriptor.class_codes()
    }

    /// USB specification release the device conforms to.
    #[must_use]
    pub fn usb_version(&self) -> Version {
        self.inner.descriptor.usb_version()
    }

    /// Device release number.
    #[must_use]
    pub fn device_version(&self) -> Version {
        self.inner.descriptor.device_version()
    }

    /// Manufacturer name, if the device supplies one.
    #[must_use]
    pub fn manufacturer(&self) -> Option<&str> {
        self.inner.manufacturer.as_deref()
    }

    /// Product name, if the device supplies one.
    #[must_use]
    pub fn product(&self) -> Option<&str> {
        self.inner.product.as_deref()
    }

    /// Serial number, if the device supplies one.
    #[must_use]
    pub fn serial_number(&self) -> Option<&str> {
        self.inner.serial_number.as_deref()
    }

    /// The parsed active configuration.
    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }

    /// The interfaces of the active configuration, sorted by number.
    #[must_use]
    pub fn interfaces(&self) -> &[Interface] {
        self.inner.configuration.interfaces()
    }

    /// The functions of a composite device (empty otherwise).
    #[must_use]
    pub fn functions(&self) -> &[Function] {
        self.inner.configuration.functions()
    }

    /// The raw 18-byte device descriptor.
    #[must_use]
    pub fn device_descriptor_bytes(&self) -> &[u8] {
        &self.inner.device_descriptor_bytes
    }

    /// The raw configuration descriptor.
    #[must_use]
    pub fn configuration_descriptor_bytes(&self) -> &[u8] {
        &self.inner.configuration_bytes
    }

    /// Whether the physical device is still connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Whether the device is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().unwrap().open.is_some()
    }

    /// Whether an interface is currently claimed.
    #[must_use]
    pub fn is_interface_claimed(&self, number: u8) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .interfaces
            .get(&number)
            .is_some_and(|iface| iface.claimed)
    }

    /// The currently selected alternate setting of an interface. Before a
    /// claim (and right after one) this is the interface's default setting.
    pub fn current_alternate(&self, number: u8) -> Result<Arc<AlternateSetting>> {
        let state = self.inner.state.lock().unwrap();
        let iface_state = state
            .interfaces
            .get(&number)
            .ok_or(Error::InvalidInterface(number))?;
        self.inner
            .configuration
            .interface(number)
            .and_then(|iface| iface.alternate(iface_state.current_alternate))
            .cloned()
            .ok_or(Error::InvalidInterface(number))
    }

    /// Open the device for I/O.
    ///
    /// Fails with [`Error::AlreadyOpen`] if the device is already open and
    /// [`Error::Disconnected`] if it vanished first.
    pub fn open(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.ensure_connected()?;
        if state.open.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let sink = CompletionSink::new();
        let backend = self.inner.host.open(self.inner.id, Arc::clone(&sink))?;
        log::debug!(
            "opened device {:04x}:{:04x}",
            self.vendor_id(),
            self.product_id()
        );
        state.open = Some(OpenState {
            engine: TransferEngine::new(backend, sink),
        });
        Ok(())
    }

    /// Close the device.
    ///
    /// Valid whenever the device is open, regardless of interface claims:
    /// all pending transfers on all endpoints are cancelled, claimed
    /// interfaces are released, and the native handle is released. Only the
    /// first call succeeds; closing an already closed device fails with
    /// [`Error::NotOpen`].
    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        let open = state.open.take().ok_or_else(|| self.closed_error())?;
        for iface_state in state.interfaces.values_mut() {
            iface_state.claimed = false;
        }
        self.reset_alternates(&mut state);
        // cancels in-flight transfers, releases claims and the handle
        open.engine.shutdown(false);
        log::debug!(
            "closed device {:04x}:{:04x}",
            self.vendor_id(),
            self.product_id()
        );
        Ok(())
    }

    /// Claim an interface for exclusive use. Required before any transfer on
    /// the interface's endpoints. Claiming selects the interface's default
    /// alternate setting.
    pub fn claim_interface(&self, number: u8) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.ensure_connected()?;
        let engine = state.engine()?;
        let iface = self
            .inner
            .configuration
            .interface(number)
            .ok_or(Error::InvalidInterface(number))?;
        let default = default_alternate(iface);
        let iface_state = state
            .interfaces
            .get_mut(&number)
            .ok_or(Error::InvalidInterface(number))?;
        if iface_state.claimed {
            return Err(Error::AlreadyClaimed(number));
        }
        engine.backend().claim_interface(number)?;
        iface_state.claimed = true;
        iface_state.current_alternate = default;
        Ok(())
    }

    /// Release a claimed interface.
    pub fn release_interface(&self, number: u8) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.ensure_connected()?;
        let engine = state.engine()?;
        let iface = self
            .inner
            .configuration
            .interface(number)
            .ok_or(Error::InvalidInterface(number))?;
        let default = default_alternate(iface);
        let iface_state = state
            .interfaces
            .get_mut(&number)
            .ok_or(Error::InvalidInterface(number))?;
        if !iface_state.claimed {
            return Err(Error::NotClaimed(number));
        }
        engine.backend().release_interface(number)?;
        iface_state.claimed = false;
        iface_state.current_alternate = default;
        Ok(())
    }

    /// Select an alternate setting of a claimed interface. Changes the set
    /// of endpoints transfers may use.
    pub fn select_alternate_setting(&self, number: u8, alternate: u8) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.ensure_connected()?;
        let engine = state.engine()?;
        let iface = self
            .inner
            .configuration
            .interface(number)
            .ok_or(Error::InvalidInterface(number))?;
        if iface.alternate(alternate).is_none() {
            return Err(Error::InvalidAlternate {
                interface: number,
                alternate,
            });
        }
        let iface_state = state
            .interfaces
            .get_mut(&number)
            .ok_or(Error::InvalidInterface(number))?;
        if !iface_state.claimed {
            return Err(Error::NotClaimed(number));
        }
        engine.backend().set_alternate_setting(number, alternate)?;
        iface_state.current_alternate = alternate;
        Ok(())
    }

    /// Issue an IN control transfer and return the data stage.
    ///
    /// `timeout` of [`Duration::ZERO`] waits indefinitely.
    pub fn control_transfer_in(
        &self,
        request: ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.engine()?.control_in(&request, length, timeout)
    }

    /// Issue an OUT control transfer carrying `data`.
    pub fn control_transfer_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        self.engine()?.control_out(&request, data, timeout)
    }

    /// Read up to `max_length` bytes from a bulk or interrupt IN endpoint.
    ///
    /// The endpoint must belong to the current alternate setting of a
    /// claimed interface. `timeout` of [`Duration::ZERO`] waits
    /// indefinitely; on expiry the request is cancelled at the native layer
    /// before [`Error::Timeout`] is returned.
    pub fn transfer_in(&self, endpoint: u8, max_length: usize, timeout: Duration) -> Result<Vec<u8>> {
        let (engine, ep) = self.claimed_endpoint(Direction::In, endpoint)?;
        engine.transfer_in(ep.address(), ep.transfer_type(), max_length, timeout)
    }

    /// Write `data` to a bulk or interrupt OUT endpoint.
    pub fn transfer_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<()> {
        let (engine, ep) = self.claimed_endpoint(Direction::Out, endpoint)?;
        engine.transfer_out(ep.address(), ep.transfer_type(), data, timeout)
    }

    /// Cancel all pending transfers on one endpoint. Each cancelled caller
    /// receives [`Error::Cancelled`]. Not valid for the control endpoint.
    pub fn abort_transfers(&self, direction: Direction, endpoint: u8) -> Result<()> {
        if endpoint == 0 {
            return Err(Error::InvalidEndpoint(
                "transfers on the control endpoint cannot be aborted".into(),
            ));
        }
        let (engine, ep) = self.claimed_endpoint(direction, endpoint)?;
        engine.abort(ep.address())
    }

    /// Clear a halted endpoint's stall condition, making it usable again.
    /// The control endpoint never stays halted and cannot be cleared.
    pub fn clear_halt(&self, direction: Direction, endpoint: u8) -> Result<()> {
        if endpoint == 0 {
            return Err(Error::InvalidEndpoint(
                "the control endpoint never stays halted".into(),
            ));
        }
        let (engine, ep) = self.claimed_endpoint(direction, endpoint)?;
        engine.clear_halt(ep.address())
    }

    /// Open a buffered, pipelined writer over a bulk or interrupt OUT
    /// endpoint. See [`EndpointWriter`] for flushing and zero-length-packet
    /// semantics. While the writer exists, no raw transfers should be issued
    /// on the same endpoint.
    pub fn open_output_stream(&self, endpoint: u8, buffer_size: usize) -> Result<EndpointWriter> {
        let (engine, ep) = self.claimed_endpoint(Direction::Out, endpoint)?;
        Ok(EndpointWriter::new(engine, ep, buffer_size))
    }

    /// Open a buffered, pipelined reader over a bulk or interrupt IN
    /// endpoint. See [`EndpointReader`] for zero-length-packet semantics.
    /// While the reader exists, no raw transfers should be issued on the
    /// same endpoint.
    pub fn open_input_stream(&self, endpoint: u8, buffer_size: usize) -> Result<EndpointReader> {
        let (engine, ep) = self.claimed_endpoint(Direction::In, endpoint)?;
        EndpointReader::new(engine, ep, buffer_size)
    }

    /// Called from the registry's monitor thread when the device physically
    /// disconnects: fails everything in flight and releases the handle.
    pub(crate) fn handle_disconnect(&self) {
        self.inner.connected.store(false, Ordering::Release);
        let mut state = self.inner.state.lock().unwrap();
        if let Some(open) = state.open.take() {
            for iface_state in state.interfaces.values_mut() {
                iface_state.claimed = false;
            }
            open.engine.shutdown(true);
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    fn closed_error(&self) -> Error {
        if self.is_connected() {
            Error::NotOpen
        } else {
            Error::Disconnected
        }
    }

    fn engine(&self) -> Result<Arc<TransferEngine>> {
        let state = self.inner.state.lock().unwrap();
        self.ensure_connected()?;
        state.engine()
    }

    /// Resolve an endpoint reference against the current alternate settings
    /// of the claimed interfaces, returning the engine alongside so the
    /// state lock is released before any blocking happens.
    fn claimed_endpoint(
        &self,
        direction: Direction,
        number: u8,
    ) -> Result<(Arc<TransferEngine>, Endpoint)> {
        let state = self.inner.state.lock().unwrap();
        self.ensure_connected()?;
        let engine = state.engine()?;
        for (iface_number, iface_state) in &state.interfaces {
            if !iface_state.claimed {
                continue;
            }
            let endpoint = self
                .inner
                .configuration
                .interface(*iface_number)
                .and_then(|iface| iface.alternate(iface_state.current_alternate))
                .and_then(|alt| alt.endpoint(number, direction).copied());
            if let Some(endpoint) = endpoint {
                if !matches!(
                    endpoint.transfer_type(),
                    TransferType::Bulk | TransferType::Interrupt
                ) {
                    return Err(Error::InvalidEndpoint(format!(
                        "endpoint {number} {direction} is {:?}, not bulk or interrupt",
                        endpoint.transfer_type()
                    )));
                }
                return Ok((engine, endpoint));
            }
        }
        Err(Error::InvalidEndpoint(format!(
            "no {direction} endpoint {number} in the current alternate settings of the claimed interfaces"
        )))
    }

    fn reset_alternates(&self, state: &mut DeviceState) {
        for iface in self.inner.configuration.interfaces() {
            if let Some(iface_state) = state.interfaces.get_mut(&iface.number()) {
                iface_state.current_alternate = default_alternate(iface);
            }
        }
    }
}

impl DeviceState {
    fn engine(&self) -> Result<Arc<TransferEngine>> {
        self.open
            .as_ref()
            .map(|open| Arc::clone(&open.engine))
            .ok_or(Error::NotOpen)
    }
}

fn default_alternate(iface: &Interface) -> u8 {
    iface.alternates().first().map_or(0, |alt| alt.number())
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id()))
            .field("product_id", &format_args!("{:#06x}", self.product_id()))
            .field("product", &self.inner.product)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::loopback::{LoopbackBackend, LoopbackDevice};
    use crate::Registry;

    fn loopback_device() -> (LoopbackBackend, Device) {
        let backend = LoopbackBackend::new();
        backend.plug(LoopbackDevice::new(0x1234, 0x5678));
        let registry = Registry::with_backend(Arc::new(backend.clone()));
        let device = registry.devices().into_iter().next().expect("one device");
        (backend, device)
    }

    #[test]
    fn lifecycle_guards() {
        let (_backend, device) = loopback_device();

        // from Closed, everything interface-related fails NotOpen
        assert!(matches!(device.claim_interface(0), Err(Error::NotOpen)));
        assert!(matches!(device.release_interface(0), Err(Error::NotOpen)));
        assert!(matches!(device.close(), Err(Error::NotOpen)));

        device.open().unwrap();
        assert!(device.is_open());
        assert!(matches!(device.open(), Err(Error::AlreadyOpen)));

        device.claim_interface(0).unwrap();
        assert!(device.is_interface_claimed(0));
        assert!(matches!(
            device.claim_interface(0),
            Err(Error::AlreadyClaimed(0))
        ));
        assert!(matches!(
            device.claim_interface(9),
            Err(Error::InvalidInterface(9))
        ));
        assert!(matches!(
            device.release_interface(1),
            Err(Error::NotClaimed(1))
        ));

        device.release_interface(0).unwrap();
        assert!(!device.is_interface_claimed(0));

        // close succeeds once, then reports NotOpen
        device.claim_interface(0).unwrap();
        device.close().unwrap();
        assert!(!device.is_open());
        assert!(!device.is_interface_claimed(0));
        assert!(matches!(device.close(), Err(Error::NotOpen)));
    }

    #[test]
    fn alternate_setting_selection() {
        let (_backend, device) = loopback_device();
        device.open().unwrap();

        // selecting requires a claim
        assert!(matches!(
            device.select_alternate_setting(0, 1),
            Err(Error::NotClaimed(0))
        ));

        device.claim_interface(0).unwrap();
        assert_eq!(device.current_alternate(0).unwrap().number(), 0);

        device.select_alternate_setting(0, 1).unwrap();
        let alt = device.current_alternate(0).unwrap();
        assert_eq!(alt.number(), 1);

        assert!(matches!(
            device.select_alternate_setting(0, 7),
            Err(Error::InvalidAlternate {
                interface: 0,
                alternate: 7
            })
        ));

        // releasing falls back to the default setting
        device.release_interface(0).unwrap();
        assert_eq!(device.current_alternate(0).unwrap().number(), 0);
        device.close().unwrap();
    }

    #[test]
    fn transfers_validate_endpoints() {
        let (_backend, device) = loopback_device();
        device.open().unwrap();

        // no interface claimed yet
        assert!(matches!(
            device.transfer_out(1, b"x", Duration::ZERO),
            Err(Error::InvalidEndpoint(_))
        ));

        device.claim_interface(0).unwrap();
        assert!(matches!(
            device.transfer_out(5, b"x", Duration::ZERO),
            Err(Error::InvalidEndpoint(_))
        ));
        assert!(matches!(
            device.abort_transfers(Direction::Out, 0),
            Err(Error::InvalidEndpoint(_))
        ));
        assert!(matches!(
            device.clear_halt(Direction::Out, 0),
            Err(Error::InvalidEndpoint(_))
        ));

        // the alternate setting gates which endpoints are reachable: alt 1
        // drops the interrupt pair
        device.select_alternate_setting(0, 1).unwrap();
        assert!(matches!(
            device.transfer_out(2, b"x", Duration::ZERO),
            Err(Error::InvalidEndpoint(_))
        ));
        device.transfer_out(1, b"x", Duration::ZERO).unwrap();
        device.close().unwrap();
    }

    #[test]
    fn equality_is_by_native_identity() {
        let backend = LoopbackBackend::new();
        backend.plug(LoopbackDevice::new(0x1111, 0x0001));
        backend.plug(LoopbackDevice::new(0x1111, 0x0001));
        let registry = Registry::with_backend(Arc::new(backend));
        let devices = registry.devices();
        assert_eq!(devices.len(), 2);
        // identical vendor/product/serial, still two distinct devices
        assert_ne!(devices[0], devices[1]);
        assert_eq!(devices[0], devices[0].clone());
    }
}
