//! The boundary between the platform-independent core and the native USB
//! stacks.
//!
//! A backend supplies two objects: a [`HostBackend`] that enumerates devices
//! and reports hotplug events, and a [`DeviceBackend`] per open device that
//! claims interfaces and carries transfers. Transfers are asynchronous at
//! this boundary: [`DeviceBackend::submit`] queues a [`TransferRequest`] and
//! returns immediately, and the backend's single completion thread later
//! delivers a [`Completion`] through the [`CompletionSink`] it was given at
//! open time, keyed by the request's correlation token. The transfer engine
//! matches the token to the blocked caller and wakes it.
//!
//! Request buffers are owned: the backend receives the buffer by value and
//! hands it back inside the completion, so no completion, however late,
//! can touch memory the caller still owns.
//!
//! The crate ships the Linux usbfs backend ([`linux`], compiled on Linux
//! only) and a software [`loopback`] backend usable everywhere, primarily
//! for tests.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::descriptor::{Direction, TransferType};
use crate::Result;

#[cfg(target_os = "linux")]
pub mod linux;
pub mod loopback;

/// Stable identifier a backend assigns to one physical device connection.
///
/// The value is opaque to the core; it only needs to stay constant between
/// plug and unplug of the same device. Device equality is defined over it.
pub type NativeId = u64;

/// A device arrival or removal observed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A device was connected.
    Arrived(NativeId),
    /// A device was disconnected.
    Left(NativeId),
}

/// The 8-byte setup stage of a control transfer.
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    /// The bmRequestType byte: direction, type, and recipient.
    pub request_type: u8,
    /// Request code.
    pub request: u8,
    /// Request value.
    pub value: u16,
    /// Request index.
    pub index: u16,
    /// Length of the data stage.
    pub length: u16,
}

impl SetupPacket {
    /// Serialize to the on-the-wire layout (little-endian, packed).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

/// An asynchronous transfer handed to [`DeviceBackend::submit`].
#[derive(Debug)]
pub struct TransferRequest {
    /// Correlation token matching the eventual [`Completion`].
    pub token: u64,
    /// Endpoint address (number plus direction bit); 0 for the control
    /// endpoint.
    pub endpoint: u8,
    /// Transfer type of the endpoint.
    pub transfer_type: TransferType,
    /// Transfer direction. For control transfers this is the direction of
    /// the data stage.
    pub direction: Direction,
    /// Setup stage, present exactly for control transfers.
    pub setup: Option<SetupPacket>,
    /// OUT: the payload to send. IN: a zero-filled buffer whose length is
    /// the number of bytes requested.
    pub buffer: Vec<u8>,
    /// Requested time bound, `Duration::ZERO` for none. The engine enforces
    /// the bound itself; backends with native timeout support may use this
    /// as a hint.
    pub timeout: Duration,
}

/// Outcome of a transfer, before translation into [`crate::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer finished normally.
    Completed,
    /// The endpoint stalled.
    Stalled,
    /// The transfer was aborted.
    Cancelled,
    /// The device is gone.
    Disconnected,
    /// Backend-specific failure, with the native status code.
    Failed(i32),
}

/// Completion of one [`TransferRequest`].
#[derive(Debug)]
pub struct Completion {
    /// Token of the completed request.
    pub token: u64,
    /// Outcome.
    pub status: TransferStatus,
    /// IN data received; empty for OUT transfers and failures.
    pub data: Vec<u8>,
}

/// The completion-delivery mechanism shared between the transfer engine and
/// a backend's completion thread.
///
/// The engine registers a channel per pending request under the request's
/// token; the backend resolves completions with [`CompletionSink::complete`].
/// Each token is resolved at most once; later completions for the same
/// token are dropped.
pub struct CompletionSink {
    pending: Mutex<HashMap<u64, mpsc::Sender<Completion>>>,
}

impl CompletionSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(CompletionSink {
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn register(&self, token: u64, sender: mpsc::Sender<Completion>) {
        self.pending.lock().unwrap().insert(token, sender);
    }

    pub(crate) fn unregister(&self, token: u64) {
        self.pending.lock().unwrap().remove(&token);
    }

    /// Deliver a completion to the caller waiting on its token.
    ///
    /// Called from the backend's completion thread. A completion whose token
    /// is unknown (already resolved, or suppressed after a timeout) is
    /// dropped.
    pub fn complete(&self, completion: Completion) {
        let sender = self.pending.lock().unwrap().remove(&completion.token);
        match sender {
            // the receiver may be gone if the caller gave up; that is fine
            Some(sender) => {
                let _ = sender.send(completion);
            }
            None => {
                log::debug!(
                    "dropping completion for unknown transfer token {}",
                    completion.token
                );
            }
        }
    }

    /// Resolve every still-pending request with `status`. The engine calls
    /// this after the backend has closed so that no blocked caller can
    /// outlive the device handle.
    pub(crate) fn fail_all(&self, status: TransferStatus) {
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (token, sender) in pending {
            let _ = sender.send(Completion {
                token,
                status,
                data: Vec::new(),
            });
        }
    }
}

/// Host-level backend operations: enumeration, hotplug, descriptor access,
/// and opening devices.
pub trait HostBackend: Send + Sync {
    /// List the native ids of all currently connected devices.
    fn enumerate(&self) -> Result<Vec<NativeId>>;

    /// Start delivering hotplug events. The backend owns whatever watcher
    /// mechanism it needs; the registry consumes the channel from its
    /// monitor thread.
    fn hotplug_events(&self) -> Result<mpsc::Receiver<HotplugEvent>>;

    /// Read the 18-byte device descriptor.
    fn device_descriptor(&self, device: NativeId) -> Result<Vec<u8>>;

    /// Read the full configuration descriptor of the active configuration.
    fn configuration_descriptor(&self, device: NativeId) -> Result<Vec<u8>>;

    /// Read a string descriptor as raw UTF-16LE descriptor bytes.
    fn string_descriptor(&self, device: NativeId, index: u8, language_id: u16) -> Result<Vec<u8>>;

    /// Open the device. Completions for transfers submitted on the returned
    /// handle are delivered through `sink` from the backend's completion
    /// thread.
    fn open(&self, device: NativeId, sink: Arc<CompletionSink>) -> Result<Arc<dyn DeviceBackend>>;
}

/// Per-open-device backend operations.
pub trait DeviceBackend: Send + Sync {
    /// Claim an interface for exclusive use.
    fn claim_interface(&self, number: u8) -> Result<()>;

    /// Release a previously claimed interface.
    fn release_interface(&self, number: u8) -> Result<()>;

    /// Select an alternate setting of a claimed interface.
    fn set_alternate_setting(&self, number: u8, alternate: u8) -> Result<()>;

    /// Queue a transfer. Returns as soon as the request is submitted; the
    /// outcome arrives through the [`CompletionSink`].
    fn submit(&self, request: TransferRequest) -> Result<()>;

    /// Cancel every pending transfer on one endpoint address. Each cancelled
    /// request still gets its completion (`Cancelled`).
    fn abort(&self, endpoint: u8) -> Result<()>;

    /// Clear the halt condition of an endpoint.
    fn clear_halt(&self, endpoint: u8) -> Result<()>;

    /// Close the device: cancel all in-flight transfers, deliver their
    /// completions, release any claimed interfaces, then release the native
    /// handle. Idempotent.
    fn close(&self);
}

/// The native backend for the build target. The registry singleton uses this;
/// other platforms construct a [`crate::Registry`] over an explicit backend.
#[cfg(target_os = "linux")]
pub(crate) fn platform_backend() -> Arc<dyn HostBackend> {
    Arc::new(linux::LinuxBackend::new())
}
