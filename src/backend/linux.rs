//! Linux backend over usbfs.
//!
//! Devices appear as files under `/dev/bus/usb/<bus>/<address>`. Reading the
//! file yields the device descriptor followed by the descriptors of the
//! active configuration; everything else goes through ioctls: interface
//! claims, alternate settings, halt clearing, and asynchronous transfers as
//! URBs (USB request blocks). A submitted URB is owned by the kernel until
//! it is reaped; each open device runs one reaper thread that polls the
//! device file for completion readiness, reaps finished URBs without
//! blocking, and resolves them through the [`CompletionSink`].
//!
//! Hotplug detection rescans the bus directory at a fixed interval and
//! diffs the result; bus/address pairs are stable for the lifetime of a
//! connection, which is exactly what [`NativeId`] requires.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;

use crate::backend::{
    Completion, CompletionSink, DeviceBackend, HostBackend, HotplugEvent, NativeId,
    TransferRequest, TransferStatus,
};
use crate::descriptor::{Direction, TransferType};
use crate::{Error, Result};

const DEV_BUS_USB: &str = "/dev/bus/usb";
const HOTPLUG_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REAPER_POLL_TIMEOUT_MS: i32 = 100;

const USBFS_URB_TYPE_ISO: u8 = 0;
const USBFS_URB_TYPE_INTERRUPT: u8 = 1;
const USBFS_URB_TYPE_CONTROL: u8 = 2;
const USBFS_URB_TYPE_BULK: u8 = 3;

const SETUP_PACKET_LENGTH: usize = 8;
const GET_DESCRIPTOR: u8 = 0x06;

#[repr(C)]
struct UsbfsCtrlTransfer {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: u32,
    data: *mut libc::c_void,
}

#[repr(C)]
struct UsbfsSetInterface {
    interface: u32,
    alt_setting: u32,
}

#[repr(C)]
struct UsbfsUrb {
    urb_type: u8,
    endpoint: u8,
    status: i32,
    flags: u32,
    buffer: *mut libc::c_void,
    buffer_length: i32,
    actual_length: i32,
    start_frame: i32,
    // union with number_of_packets, which never applies here
    stream_id: i32,
    error_count: i32,
    signr: u32,
    usercontext: *mut libc::c_void,
}

/// The usbfs ioctl surface. Kept in a private module so the generated
/// wrappers do not leak the raw structures into the public API.
mod ioctls {
    use super::{UsbfsCtrlTransfer, UsbfsSetInterface, UsbfsUrb};
    use nix::{
        ioctl_read, ioctl_readwrite, ioctl_write_ptr, ioctl_write_ptr_bad, request_code_none,
    };

    ioctl_readwrite!(usbfs_control, b'U', 0, UsbfsCtrlTransfer);
    ioctl_read!(usbfs_setinterface, b'U', 4, UsbfsSetInterface);
    ioctl_read!(usbfs_submiturb, b'U', 10, UsbfsUrb);
    ioctl_write_ptr_bad!(usbfs_discardurb, request_code_none!(b'U', 11), UsbfsUrb);
    ioctl_write_ptr!(usbfs_reapurbndelay, b'U', 13, *mut UsbfsUrb);
    ioctl_read!(usbfs_claiminterface, b'U', 15, libc::c_uint);
    ioctl_read!(usbfs_releaseinterface, b'U', 16, libc::c_uint);
    ioctl_read!(usbfs_clear_halt, b'U', 21, libc::c_uint);
}

use ioctls::{
    usbfs_claiminterface, usbfs_clear_halt, usbfs_control, usbfs_discardurb,
    usbfs_reapurbndelay, usbfs_releaseinterface, usbfs_setinterface, usbfs_submiturb,
};

/// The Linux usbfs host backend.
pub struct LinuxBackend;

impl LinuxBackend {
    /// A backend over `/dev/bus/usb`. Nothing is opened until devices are
    /// enumerated or opened.
    #[must_use]
    pub fn new() -> Self {
        LinuxBackend
    }
}

impl Default for LinuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn device_path(id: NativeId) -> PathBuf {
    PathBuf::from(format!("{DEV_BUS_USB}/{:03}/{:03}", id >> 8, id & 0xff))
}

fn scan() -> Result<Vec<NativeId>> {
    let buses = fs::read_dir(DEV_BUS_USB)
        .map_err(|err| Error::native(format!("cannot enumerate {DEV_BUS_USB}: {err}"), None))?;
    let mut ids = Vec::new();
    for bus_entry in buses.flatten() {
        let Ok(bus) = bus_entry.file_name().to_string_lossy().parse::<u64>() else {
            continue;
        };
        let Ok(addresses) = fs::read_dir(bus_entry.path()) else {
            continue;
        };
        for device_entry in addresses.flatten() {
            if let Ok(address) = device_entry.file_name().to_string_lossy().parse::<u64>() {
                ids.push((bus << 8) | address);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn open_device_file(id: NativeId) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(device_path(id))
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => Error::Disconnected,
            _ => Error::native(
                format!("cannot open {}: {err}", device_path(id).display()),
                err.raw_os_error(),
            ),
        })
}

/// Read the raw descriptors file: device descriptor first, then the active
/// configuration's descriptors.
fn read_descriptors(id: NativeId) -> Result<Vec<u8>> {
    fs::read(device_path(id)).map_err(|err| match err.kind() {
        ErrorKind::NotFound => Error::Disconnected,
        _ => Error::native(
            format!("cannot read {}: {err}", device_path(id).display()),
            err.raw_os_error(),
        ),
    })
}

fn map_errno(context: &str, errno: Errno) -> Error {
    match errno {
        Errno::EPIPE => Error::Stalled,
        Errno::ENODEV | Errno::ESHUTDOWN => Error::Disconnected,
        Errno::EBUSY => Error::native(format!("{context}: resource busy"), Some(errno as i32)),
        _ => Error::native(format!("{context}: {errno}"), Some(errno as i32)),
    }
}

fn map_urb_status(status: i32) -> TransferStatus {
    match -status {
        0 => TransferStatus::Completed,
        code if code == libc::EPIPE => TransferStatus::Stalled,
        code if code == libc::ENOENT || code == libc::ECONNRESET => TransferStatus::Cancelled,
        code if code == libc::ENODEV || code == libc::ESHUTDOWN => TransferStatus::Disconnected,
        _ => TransferStatus::Failed(status),
    }
}

impl HostBackend for LinuxBackend {
    fn enumerate(&self) -> Result<Vec<NativeId>> {
        scan()
    }

    fn hotplug_events(&self) -> Result<mpsc::Receiver<HotplugEvent>> {
        let (tx, rx) = mpsc::channel();
        let mut known: HashSet<NativeId> = scan()?.into_iter().collect();
        thread::Builder::new()
            .name("usbio-usbfs-hotplug".into())
            .spawn(move || loop {
                thread::sleep(HOTPLUG_POLL_INTERVAL);
                let current: HashSet<NativeId> = match scan() {
                    Ok(ids) => ids.into_iter().collect(),
                    Err(err) => {
                        log::debug!("bus rescan failed: {err}");
                        continue;
                    }
                };
                for id in current.difference(&known) {
                    if tx.send(HotplugEvent::Arrived(*id)).is_err() {
                        return;
                    }
                }
                for id in known.difference(&current) {
                    if tx.send(HotplugEvent::Left(*id)).is_err() {
                        return;
                    }
                }
                known = current;
            })
            .map_err(|err| Error::native(format!("could not start hotplug thread: {err}"), None))?;
        Ok(rx)
    }

    fn device_descriptor(&self, device: NativeId) -> Result<Vec<u8>> {
        let bytes = read_descriptors(device)?;
        if bytes.len() < 18 {
            return Err(Error::InvalidDescriptor(format!(
                "device descriptor too short: {} bytes, need 18",
                bytes.len()
            )));
        }
        Ok(bytes[..18].to_vec())
    }

    fn configuration_descriptor(&self, device: NativeId) -> Result<Vec<u8>> {
        let bytes = read_descriptors(device)?;
        if bytes.len() < 18 + 4 {
            return Err(Error::InvalidDescriptor(
                "descriptors file holds no configuration descriptor".into(),
            ));
        }
        let config = &bytes[18..];
        let total = usize::from(u16::from_le_bytes([config[2], config[3]]));
        if total < 9 || total > config.len() {
            return Err(Error::InvalidDescriptor(
                "configuration descriptor truncated in descriptors file".into(),
            ));
        }
        Ok(config[..total].to_vec())
    }

    fn string_descriptor(&self, device: NativeId, index: u8, language_id: u16) -> Result<Vec<u8>> {
        // transient open; string reads happen at enumeration time, before
        // the device is opened for I/O
        let file = open_device_file(device)?;
        let mut buffer = vec![0u8; 255];
        let mut ctrl = UsbfsCtrlTransfer {
            request_type: 0x80,
            request: GET_DESCRIPTOR,
            value: (u16::from(crate::descriptor::DESCRIPTOR_TYPE_STRING) << 8) | u16::from(index),
            index: language_id,
            length: buffer.len() as u16,
            timeout: 1000,
            data: buffer.as_mut_ptr().cast(),
        };
        let len = unsafe { usbfs_control(file.as_raw_fd(), &mut ctrl) }
            .map_err(|errno| map_errno("control transfer", errno))?;
        buffer.truncate(len.max(0) as usize);
        Ok(buffer)
    }

    fn open(&self, device: NativeId, sink: Arc<CompletionSink>) -> Result<Arc<dyn DeviceBackend>> {
        let file = open_device_file(device)?;
        Ok(Arc::new(LinuxDevice::new(file, sink)?))
    }
}

struct PendingUrb {
    urb: Box<UsbfsUrb>,
    buffer: Vec<u8>,
    direction: Direction,
    is_control: bool,
}

// The raw pointers inside UsbfsUrb are owned by the PendingUrb (they point
// into its own `buffer` and back at its own `urb`) and are only dereferenced
// by the kernel and the owning device, which moves the map across to the
// reaper thread under a Mutex. Sending the owning struct is sound.
unsafe impl Send for PendingUrb {}

struct LinuxDevice {
    file: File,
    urbs: Arc<Mutex<HashMap<u64, PendingUrb>>>,
    claims: Mutex<Vec<u8>>,
    closing: Arc<AtomicBool>,
    reaper: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LinuxDevice {
    fn new(file: File, sink: Arc<CompletionSink>) -> Result<Self> {
        let urbs = Arc::new(Mutex::new(HashMap::new()));
        let closing = Arc::new(AtomicBool::new(false));
        let fd = file.as_raw_fd();
        let reaper = {
            let urbs = Arc::clone(&urbs);
            let closing = Arc::clone(&closing);
            thread::Builder::new()
                .name("usbio-usbfs-reaper".into())
                .spawn(move || reaper_loop(fd, &urbs, &closing, &sink))
                .map_err(|err| {
                    Error::native(format!("could not start reaper thread: {err}"), None)
                })?
        };
        Ok(LinuxDevice {
            file,
            urbs,
            claims: Mutex::new(Vec::new()),
            closing,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn close_internal(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        // discard everything in flight; each discarded URB is still
        // delivered through the reap loop with a cancelled status
        {
            let mut urbs = self.urbs.lock().unwrap();
            for pending in urbs.values_mut() {
                let urb: *mut UsbfsUrb = &mut *pending.urb;
                if let Err(errno) = unsafe { usbfs_discardurb(self.fd(), urb) } {
                    log::debug!("discarding urb failed: {errno}");
                }
            }
        }
        let reaper = self.reaper.lock().unwrap().take();
        if let Some(reaper) = reaper {
            if reaper.join().is_err() {
                log::warn!("usbfs reaper thread panicked");
            }
        }
        let claims: Vec<u8> = self.claims.lock().unwrap().drain(..).collect();
        for number in claims {
            let mut iface = libc::c_uint::from(number);
            if let Err(errno) = unsafe { usbfs_releaseinterface(self.fd(), &mut iface) } {
                log::debug!("releasing interface {number} on close failed: {errno}");
            }
        }
    }
}

impl DeviceBackend for LinuxDevice {
    fn claim_interface(&self, number: u8) -> Result<()> {
        let mut iface = libc::c_uint::from(number);
        unsafe { usbfs_claiminterface(self.fd(), &mut iface) }.map_err(|errno| match errno {
            Errno::EBUSY => Error::AlreadyClaimed(number),
            Errno::ENODEV => Error::Disconnected,
            errno => map_errno("claiming interface", errno),
        })?;
        self.claims.lock().unwrap().push(number);
        Ok(())
    }

    fn release_interface(&self, number: u8) -> Result<()> {
        let mut iface = libc::c_uint::from(number);
        unsafe { usbfs_releaseinterface(self.fd(), &mut iface) }.map_err(|errno| match errno {
            Errno::ENODEV => Error::Disconnected,
            errno => map_errno("releasing interface", errno),
        })?;
        self.claims.lock().unwrap().retain(|claimed| *claimed != number);
        Ok(())
    }

    fn set_alternate_setting(&self, number: u8, alternate: u8) -> Result<()> {
        let mut setting = UsbfsSetInterface {
            interface: u32::from(number),
            alt_setting: u32::from(alternate),
        };
        unsafe { usbfs_setinterface(self.fd(), &mut setting) }.map_err(|errno| match errno {
            Errno::ENODEV => Error::Disconnected,
            errno => map_errno("selecting alternate setting", errno),
        })?;
        Ok(())
    }

    fn submit(&self, request: TransferRequest) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        let urb_type = match request.transfer_type {
            TransferType::Control => USBFS_URB_TYPE_CONTROL,
            TransferType::Isochronous => USBFS_URB_TYPE_ISO,
            TransferType::Bulk => USBFS_URB_TYPE_BULK,
            TransferType::Interrupt => USBFS_URB_TYPE_INTERRUPT,
        };
        let is_control = request.setup.is_some();
        // a control URB carries the setup packet at the front of its buffer
        let mut buffer = match request.setup {
            Some(setup) => {
                let mut control = setup.to_bytes().to_vec();
                match request.direction {
                    Direction::Out => control.extend_from_slice(&request.buffer),
                    Direction::In => {
                        control.resize(SETUP_PACKET_LENGTH + usize::from(setup.length), 0);
                    }
                }
                control
            }
            None => request.buffer,
        };
        let endpoint = if is_control {
            0
        } else {
            request.endpoint
        };
        let mut urb = Box::new(UsbfsUrb {
            urb_type,
            endpoint,
            status: 0,
            flags: 0,
            buffer: buffer.as_mut_ptr().cast(),
            buffer_length: buffer.len() as i32,
            actual_length: 0,
            start_frame: 0,
            stream_id: 0,
            error_count: 0,
            signr: 0,
            usercontext: request.token as *mut libc::c_void,
        });
        let urb_ptr: *mut UsbfsUrb = &mut *urb;
        let mut urbs = self.urbs.lock().unwrap();
        urbs.insert(
            request.token,
            PendingUrb {
                urb,
                buffer,
                direction: request.direction,
                is_control,
            },
        );
        if let Err(errno) = unsafe { usbfs_submiturb(self.fd(), urb_ptr) } {
            urbs.remove(&request.token);
            return Err(match errno {
                Errno::ENODEV | Errno::ESHUTDOWN => Error::Disconnected,
                Errno::EPIPE => Error::Stalled,
                errno => map_errno("submitting transfer", errno),
            });
        }
        Ok(())
    }

    fn abort(&self, endpoint: u8) -> Result<()> {
        let mut urbs = self.urbs.lock().unwrap();
        for pending in urbs.values_mut() {
            let matches = if endpoint & 0x7f == 0 {
                pending.is_control
            } else {
                !pending.is_control && pending.urb.endpoint == endpoint
            };
            if matches {
                let urb: *mut UsbfsUrb = &mut *pending.urb;
                // a URB that already completed returns EINVAL; harmless
                if let Err(errno) = unsafe { usbfs_discardurb(self.fd(), urb) } {
                    if errno != Errno::EINVAL {
                        log::debug!("discarding urb on endpoint {endpoint:#04x}: {errno}");
                    }
                }
            }
        }
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> Result<()> {
        let mut address = libc::c_uint::from(endpoint);
        unsafe { usbfs_clear_halt(self.fd(), &mut address) }.map_err(|errno| match errno {
            Errno::ENODEV => Error::Disconnected,
            errno => map_errno("clearing halt", errno),
        })?;
        Ok(())
    }

    fn close(&self) {
        self.close_internal();
    }
}

impl Drop for LinuxDevice {
    fn drop(&mut self) {
        self.close_internal();
    }
}

/// The per-device completion thread: polls the device file for URB
/// completion readiness and resolves reaped URBs by their token.
fn reaper_loop(
    fd: RawFd,
    urbs: &Arc<Mutex<HashMap<u64, PendingUrb>>>,
    closing: &Arc<AtomicBool>,
    sink: &Arc<CompletionSink>,
) {
    loop {
        if closing.load(Ordering::Acquire) && urbs.lock().unwrap().is_empty() {
            return;
        }
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, REAPER_POLL_TIMEOUT_MS) };
        if rc < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            log::warn!("polling usbfs device failed: {errno}");
            fail_pending(urbs, sink, TransferStatus::Disconnected);
            return;
        }
        loop {
            let mut urb_ptr: *mut UsbfsUrb = ptr::null_mut();
            let reaped = unsafe {
                usbfs_reapurbndelay(fd, ptr::addr_of_mut!(urb_ptr) as *const *mut UsbfsUrb)
            };
            match reaped {
                Ok(_) => {
                    if urb_ptr.is_null() {
                        break;
                    }
                    let token = unsafe { (*urb_ptr).usercontext } as u64;
                    let pending = urbs.lock().unwrap().remove(&token);
                    let Some(pending) = pending else {
                        log::debug!("reaped urb with unknown token {token}");
                        continue;
                    };
                    sink.complete(finish_urb(pending, token));
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => {}
                Err(Errno::ENODEV) => {
                    // the device is gone; nothing left will ever be reaped
                    fail_pending(urbs, sink, TransferStatus::Disconnected);
                    return;
                }
                Err(errno) => {
                    log::warn!("reaping urb failed: {errno}");
                    break;
                }
            }
        }
    }
}

fn finish_urb(pending: PendingUrb, token: u64) -> Completion {
    let status = map_urb_status(pending.urb.status);
    let actual = pending.urb.actual_length.max(0) as usize;
    let data = if pending.direction == Direction::In && status == TransferStatus::Completed {
        let offset = if pending.is_control {
            SETUP_PACKET_LENGTH
        } else {
            0
        };
        let mut data = pending.buffer;
        data.truncate(offset + actual);
        if offset > 0 {
            data.drain(..offset);
        }
        data
    } else {
        Vec::new()
    };
    Completion {
        token,
        status,
        data,
    }
}

fn fail_pending(
    urbs: &Arc<Mutex<HashMap<u64, PendingUrb>>>,
    sink: &Arc<CompletionSink>,
    status: TransferStatus,
) {
    let pending: Vec<u64> = urbs.lock().unwrap().drain().map(|(token, _)| token).collect();
    for token in pending {
        sink.complete(Completion {
            token,
            status,
            data: Vec::new(),
        });
    }
}
