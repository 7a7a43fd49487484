//! The transfer engine: blocking calls over asynchronous backend transfers.
//!
//! Every transfer is submitted to the backend with a fresh correlation token
//! and a per-call completion channel registered in the shared
//! [`CompletionSink`]. The calling thread then blocks on the channel until
//! the backend's completion thread resolves the token, the timeout expires,
//! or the transfer is cancelled. On timeout the engine cancels the request
//! at the native layer and waits for the forced completion before returning,
//! so no native request referencing the transfer buffer ever outlives the
//! call.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use num_enum::IntoPrimitive;

use crate::backend::{
    Completion, CompletionSink, DeviceBackend, SetupPacket, TransferRequest, TransferStatus,
};
use crate::descriptor::{Direction, TransferType};
use crate::{Error, Result};

/// How long to wait for the backend to deliver the forced completion after a
/// timeout-triggered cancellation before giving up on it.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// The type field of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive)]
#[repr(u8)]
pub enum ControlType {
    /// Request defined by the USB specification.
    Standard = 0,
    /// Request defined by a device class specification.
    Class = 1,
    /// Vendor-defined request.
    Vendor = 2,
}

/// The recipient field of a control request.
///
/// For [`Recipient::Interface`] and [`Recipient::Endpoint`], the low byte of
/// the request's `index` must carry the interface or endpoint number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive)]
#[repr(u8)]
pub enum Recipient {
    /// The device as a whole.
    Device = 0,
    /// A specific interface.
    Interface = 1,
    /// A specific endpoint.
    Endpoint = 2,
    /// Another recipient.
    Other = 3,
}

/// The setup parameters of a control transfer, minus direction and data
/// stage length, which are implied by the call.
#[derive(Debug, Clone, Copy)]
pub struct ControlRequest {
    /// Request type.
    pub control_type: ControlType,
    /// Request recipient.
    pub recipient: Recipient,
    /// Request code (0–255).
    pub request: u8,
    /// Value field.
    pub value: u16,
    /// Index field.
    pub index: u16,
}

impl ControlRequest {
    fn request_type(&self, direction: Direction) -> u8 {
        direction.bit() | (u8::from(self.control_type) << 5) | u8::from(self.recipient)
    }

    fn setup(&self, direction: Direction, length: u16) -> SetupPacket {
        SetupPacket {
            request_type: self.request_type(direction),
            request: self.request,
            value: self.value,
            index: self.index,
            length,
        }
    }
}

/// One pending transfer: its token, the endpoint it runs on, and the channel
/// its completion will arrive on.
pub(crate) struct InFlight {
    token: u64,
    endpoint: u8,
    rx: mpsc::Receiver<Completion>,
}

/// Per-open-device transfer engine. Shared between the device handle and any
/// streams opened on it.
pub(crate) struct TransferEngine {
    backend: Arc<dyn DeviceBackend>,
    sink: Arc<CompletionSink>,
    next_token: AtomicU64,
    // addresses of endpoints currently latched halted
    halted: Mutex<HashSet<u8>>,
    closed: AtomicBool,
    disconnected: AtomicBool,
}

impl TransferEngine {
    pub fn new(backend: Arc<dyn DeviceBackend>, sink: Arc<CompletionSink>) -> Arc<Self> {
        Arc::new(TransferEngine {
            backend,
            sink,
            next_token: AtomicU64::new(1),
            halted: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        })
    }

    /// The backend carrying this engine's transfers. Lifecycle calls (claim,
    /// release, alternate selection) go through it directly.
    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub fn control_in(
        &self,
        request: &ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let setup = request.setup(Direction::In, length);
        let in_flight = self.submit(
            0,
            TransferType::Control,
            Direction::In,
            Some(setup),
            vec![0; usize::from(length)],
            timeout,
        )?;
        self.wait(in_flight, timeout)
    }

    pub fn control_out(
        &self,
        request: &ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let Ok(length) = u16::try_from(data.len()) else {
            return Err(Error::InvalidEndpoint(
                "control transfer payload exceeds 65535 bytes".into(),
            ));
        };
        let setup = request.setup(Direction::Out, length);
        let in_flight = self.submit(
            0,
            TransferType::Control,
            Direction::Out,
            Some(setup),
            data.to_vec(),
            timeout,
        )?;
        self.wait(in_flight, timeout).map(|_| ())
    }

    pub fn transfer_in(
        &self,
        endpoint: u8,
        transfer_type: TransferType,
        max_length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let in_flight = self.submit(
            endpoint,
            transfer_type,
            Direction::In,
            None,
            vec![0; max_length],
            timeout,
        )?;
        self.wait(in_flight, timeout)
    }

    pub fn transfer_out(
        &self,
        endpoint: u8,
        transfer_type: TransferType,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let in_flight = self.submit(
            endpoint,
            transfer_type,
            Direction::Out,
            None,
            data.to_vec(),
            timeout,
        )?;
        self.wait(in_flight, timeout).map(|_| ())
    }

    /// Submit a transfer and return the pending handle without waiting. Used
    /// directly by the streaming layer to keep several transfers in flight.
    pub fn submit(
        &self,
        endpoint: u8,
        transfer_type: TransferType,
        direction: Direction,
        setup: Option<SetupPacket>,
        buffer: Vec<u8>,
        timeout: Duration,
    ) -> Result<InFlight> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotOpen);
        }
        if endpoint & 0x7f != 0 && self.halted.lock().unwrap().contains(&endpoint) {
            return Err(Error::Stalled);
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.sink.register(token, tx);
        let request = TransferRequest {
            token,
            endpoint,
            transfer_type,
            direction,
            setup,
            buffer,
            timeout,
        };
        if let Err(err) = self.backend.submit(request) {
            self.sink.unregister(token);
            return Err(err);
        }
        Ok(InFlight {
            token,
            endpoint,
            rx,
        })
    }

    /// Block until the transfer completes. `Duration::ZERO` waits forever;
    /// a positive timeout bounds the wait and cancels the request natively
    /// on expiry.
    pub fn wait(&self, in_flight: InFlight, timeout: Duration) -> Result<Vec<u8>> {
        let completion = if timeout.is_zero() {
            match in_flight.rx.recv() {
                Ok(completion) => completion,
                Err(mpsc::RecvError) => return Err(self.shutdown_error()),
            }
        } else {
            match in_flight.rx.recv_timeout(timeout) {
                Ok(completion) => completion,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(self.cancel_after_timeout(&in_flight))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(self.shutdown_error()),
            }
        };
        self.resolve(in_flight.endpoint, completion)
    }

    fn resolve(&self, endpoint: u8, completion: Completion) -> Result<Vec<u8>> {
        match completion.status {
            TransferStatus::Completed => Ok(completion.data),
            TransferStatus::Stalled => {
                // the control endpoint recovers by itself; others stay
                // halted until clear_halt
                if endpoint & 0x7f != 0 {
                    self.halted.lock().unwrap().insert(endpoint);
                }
                Err(Error::Stalled)
            }
            TransferStatus::Cancelled => {
                if self.disconnected.load(Ordering::Acquire) {
                    Err(Error::Disconnected)
                } else {
                    Err(Error::Cancelled)
                }
            }
            TransferStatus::Disconnected => {
                self.disconnected.store(true, Ordering::Release);
                Err(Error::Disconnected)
            }
            TransferStatus::Failed(code) => Err(Error::native(
                format!("transfer failed with native status {code}"),
                Some(code),
            )),
        }
    }

    /// The request outlived its deadline: cancel it at the native layer and
    /// reap the forced completion so the buffer is released before we
    /// return. Data that raced the cancellation is discarded; a timed-out
    /// call never reports partial success.
    fn cancel_after_timeout(&self, in_flight: &InFlight) -> Error {
        if let Err(err) = self.backend.abort(in_flight.endpoint) {
            log::warn!(
                "cancelling timed-out transfer on endpoint {:#04x} failed: {err}",
                in_flight.endpoint
            );
        }
        match in_flight.rx.recv_timeout(CANCEL_GRACE) {
            Ok(completion) => {
                if completion.status == TransferStatus::Disconnected {
                    self.disconnected.store(true, Ordering::Release);
                    return Error::Disconnected;
                }
                Error::Timeout
            }
            Err(_) => {
                // the backend never delivered the forced completion; make
                // sure nothing can resolve the token later
                self.sink.unregister(in_flight.token);
                Error::Timeout
            }
        }
    }

    fn shutdown_error(&self) -> Error {
        if self.disconnected.load(Ordering::Acquire) {
            Error::Disconnected
        } else if self.closed.load(Ordering::Acquire) {
            Error::NotOpen
        } else {
            Error::Cancelled
        }
    }

    /// Cancel all pending transfers on one endpoint address.
    pub fn abort(&self, endpoint: u8) -> Result<()> {
        self.backend.abort(endpoint)
    }

    /// Clear an endpoint's halt condition and unlatch it.
    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.backend.clear_halt(endpoint)?;
        self.halted.lock().unwrap().remove(&endpoint);
        Ok(())
    }

    /// Tear the engine down: cancel everything in flight, close the backend
    /// handle, and fail any waiter the backend missed. After this every
    /// submit fails with `NotOpen` (or `Disconnected`).
    pub fn shutdown(&self, disconnected: bool) {
        if disconnected {
            self.disconnected.store(true, Ordering::Release);
        }
        self.closed.store(true, Ordering::Release);
        self.backend.close();
        self.sink.fail_all(if disconnected {
            TransferStatus::Disconnected
        } else {
            TransferStatus::Cancelled
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_type_byte_packs_direction_type_recipient() {
        let request = ControlRequest {
            control_type: ControlType::Vendor,
            recipient: Recipient::Interface,
            request: 0x22,
            value: 1,
            index: 0,
        };
        assert_eq!(request.request_type(Direction::In), 0xc1);
        assert_eq!(request.request_type(Direction::Out), 0x41);

        let standard = ControlRequest {
            control_type: ControlType::Standard,
            recipient: Recipient::Device,
            request: 0x06,
            value: 0x0100,
            index: 0,
        };
        assert_eq!(standard.request_type(Direction::In), 0x80);
    }

    #[test]
    fn setup_packet_serializes_little_endian() {
        let request = ControlRequest {
            control_type: ControlType::Class,
            recipient: Recipient::Endpoint,
            request: 0x01,
            value: 0x1234,
            index: 0x0081,
        };
        let setup = request.setup(Direction::Out, 0x0200);
        assert_eq!(
            setup.to_bytes(),
            [0x22, 0x01, 0x34, 0x12, 0x81, 0x00, 0x00, 0x02]
        );
    }
}
