//! Device registry: enumeration, the live device list, and hotplug
//! notifications.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use crate::backend::{HostBackend, HotplugEvent, NativeId};
use crate::descriptor::parse_string_descriptor;
use crate::device::Device;
use crate::Result;

/// Language id used when fetching the well-known device strings.
const LANGUAGE_ENGLISH_US: u16 = 0x0409;

/// A hotplug notification handler.
///
/// At most one handler is active per event type; registering a new one
/// replaces the previous, and `None` clears it. Handlers run synchronously
/// on the registry's monitor thread: the monitor does not process further
/// hotplug events until the handler returns, so a slow handler delays
/// recognition of subsequent connects and disconnects and the freshness of
/// [`Registry::devices`].
pub type DeviceHandler = Arc<dyn Fn(&Device) + Send + Sync + 'static>;

/// The set of connected USB devices, kept current by a background monitor
/// thread.
///
/// On Linux the process-wide instance is obtained with [`registry()`]; a
/// registry over an explicit backend (for example the
/// [loopback backend](crate::backend::loopback)) is built with
/// [`Registry::with_backend`].
pub struct Registry {
    shared: Arc<Shared>,
}

struct Shared {
    host: Arc<dyn HostBackend>,
    devices: Mutex<Vec<Device>>,
    connected_handler: Mutex<Option<DeviceHandler>>,
    disconnected_handler: Mutex<Option<DeviceHandler>>,
}

impl Registry {
    /// Create a registry over the given backend.
    ///
    /// Devices already connected are enumerated before this returns; the
    /// hotplug monitor thread is started immediately afterwards. A device
    /// whose descriptors cannot be read or parsed is skipped with a warning
    /// rather than failing the whole registry.
    pub fn with_backend(host: Arc<dyn HostBackend>) -> Registry {
        let shared = Arc::new(Shared {
            host,
            devices: Mutex::new(Vec::new()),
            connected_handler: Mutex::new(None),
            disconnected_handler: Mutex::new(None),
        });

        match shared.host.enumerate() {
            Ok(ids) => {
                let mut devices = shared.devices.lock().unwrap();
                for id in ids {
                    match probe_device(&shared.host, id) {
                        Ok(device) => devices.push(device),
                        Err(err) => log::warn!("skipping device {id:#x}: {err}"),
                    }
                }
            }
            Err(err) => log::error!("initial USB enumeration failed: {err}"),
        }

        match shared.host.hotplug_events() {
            Ok(events) => {
                let monitor_shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name("usbio-hotplug".into())
                    .spawn(move || monitor(&monitor_shared, &events));
                if let Err(err) = spawned {
                    log::error!("could not start hotplug monitor thread: {err}");
                }
            }
            Err(err) => log::error!("hotplug monitoring unavailable: {err}"),
        }

        Registry { shared }
    }

    /// A snapshot of the currently connected devices. Safe to iterate while
    /// hotplug events occur; the snapshot simply will not contain them.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.shared.devices.lock().unwrap().clone()
    }

    /// The first connected device matching `predicate`.
    #[must_use]
    pub fn find_device(&self, predicate: impl Fn(&Device) -> bool) -> Option<Device> {
        self.devices().into_iter().find(|device| predicate(device))
    }

    /// Set or clear the handler invoked when a device is connected. See
    /// [`DeviceHandler`] for the threading contract.
    pub fn on_device_connected(&self, handler: Option<DeviceHandler>) {
        *self.shared.connected_handler.lock().unwrap() = handler;
    }

    /// Set or clear the handler invoked when a device is disconnected.
    pub fn on_device_disconnected(&self, handler: Option<DeviceHandler>) {
        *self.shared.disconnected_handler.lock().unwrap() = handler;
    }
}

/// The monitor loop: owns the canonical device list. Runs until the backend
/// drops its event source.
fn monitor(shared: &Arc<Shared>, events: &mpsc::Receiver<HotplugEvent>) {
    for event in events {
        match event {
            HotplugEvent::Arrived(id) => {
                let already_known = {
                    let devices = shared.devices.lock().unwrap();
                    devices.iter().any(|device| device.native_id() == id)
                };
                if already_known {
                    continue;
                }
                let device = match probe_device(&shared.host, id) {
                    Ok(device) => device,
                    Err(err) => {
                        log::warn!("skipping device {id:#x}: {err}");
                        continue;
                    }
                };
                log::debug!(
                    "device connected: {:04x}:{:04x}",
                    device.vendor_id(),
                    device.product_id()
                );
                shared.devices.lock().unwrap().push(device.clone());
                let handler = shared.connected_handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    handler(&device);
                }
            }
            HotplugEvent::Left(id) => {
                let device = {
                    let mut devices = shared.devices.lock().unwrap();
                    devices
                        .iter()
                        .position(|device| device.native_id() == id)
                        .map(|index| devices.remove(index))
                };
                let Some(device) = device else { continue };
                log::debug!(
                    "device disconnected: {:04x}:{:04x}",
                    device.vendor_id(),
                    device.product_id()
                );
                // fail in-flight transfers now, not when their timeouts hit
                device.handle_disconnect();
                let handler = shared.disconnected_handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    handler(&device);
                }
            }
        }
    }
    log::debug!("hotplug event source closed; monitor thread exiting");
}

fn probe_device(host: &Arc<dyn HostBackend>, id: NativeId) -> Result<Device> {
    let device_bytes = host.device_descriptor(id)?;
    let configuration_bytes = host.configuration_descriptor(id)?;
    let descriptor = crate::descriptor::DeviceDescriptor::parse(&device_bytes)?;
    let manufacturer = fetch_string(host, id, descriptor.manufacturer_index());
    let product = fetch_string(host, id, descriptor.product_index());
    let serial_number = fetch_string(host, id, descriptor.serial_number_index());
    Device::new(
        Arc::clone(host),
        id,
        descriptor,
        device_bytes,
        configuration_bytes,
        manufacturer,
        product,
        serial_number,
    )
}

/// Fetch and decode one of the well-known device strings. Strings are
/// optional and device-supplied; anything unreadable or undecodable becomes
/// `None` instead of an error.
fn fetch_string(host: &Arc<dyn HostBackend>, id: NativeId, index: u8) -> Option<String> {
    if index == 0 {
        return None;
    }
    match host.string_descriptor(id, index, LANGUAGE_ENGLISH_US) {
        Ok(bytes) => match parse_string_descriptor(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("device {id:#x}: malformed string descriptor {index}: {err}");
                None
            }
        },
        Err(err) => {
            log::debug!("device {id:#x}: string descriptor {index} unavailable: {err}");
            None
        }
    }
}

/// The process-wide registry over the native platform backend.
///
/// Initialized on first use; the hotplug monitor thread starts then and runs
/// until process exit. There is no teardown.
#[cfg(target_os = "linux")]
pub fn registry() -> &'static Registry {
    use std::sync::OnceLock;
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry::with_backend(crate::backend::platform_backend()))
}
