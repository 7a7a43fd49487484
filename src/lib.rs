//! Cross-platform user-space USB device I/O.
//!
//! This crate lets an application enumerate, open, configure, and exchange
//! data with USB devices without a kernel driver. The operating systems'
//! USB stacks differ wildly (Linux exposes device files driven by ioctls
//! and readiness polling, macOS a run-loop/callback object graph, Windows
//! overlapped I/O with completion delivery), so everything platform-specific
//! lives behind the [`backend`] traits, and the core of the crate is the
//! same everywhere: a descriptor parser, a per-device lifecycle state
//! machine, an asynchronous transfer engine presented through a blocking
//! thread-safe API, and pipelined endpoint streams.
//!
//! # Background
//!
//! A USB device is a collection of numbered *endpoints*, unidirectional
//! data pipes with a transfer type (control, bulk, interrupt, isochronous)
//! and a maximum packet size. Endpoints are grouped into *interfaces*; an
//! interface can offer several *alternate settings*, each with its own
//! endpoint set, of which exactly one is selected at a time. Composite
//! devices additionally group interfaces into *functions*. The device
//! describes all of this in binary descriptors, which this crate parses
//! into a navigable tree at enumeration time (see [`descriptor`]).
//!
//! Before transferring data, a device must be opened and the endpoint's
//! interface claimed for exclusive use. Control transfers address the
//! implicit endpoint 0 and need no claim.
//!
//! # Concurrency
//!
//! Any number of threads may use a [`Device`] concurrently. Transfer calls
//! block the calling thread until completion, timeout, or cancellation;
//! internally every open device has exactly one completion thread that
//! resolves finished transfers and wakes their callers, so one slow or
//! stalled endpoint never blocks another. A timed-out request is cancelled
//! at the native layer before the call returns, so it cannot touch any
//! buffer afterwards.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Write;
//! use std::time::Duration;
//!
//! # fn main() -> usbio::Result<()> {
//! let registry = usbio::registry();
//! let device = registry
//!     .find_device(|d| d.vendor_id() == 0xcafe && d.product_id() == 0xceaf)
//!     .expect("device not connected");
//!
//! device.open()?;
//! device.claim_interface(0)?;
//!
//! // single transfers
//! device.transfer_out(1, b"hello", Duration::from_secs(1))?;
//! let reply = device.transfer_in(1, 64, Duration::from_secs(1))?;
//! println!("received {} bytes", reply.len());
//!
//! // sustained throughput: a pipelined stream
//! let mut writer = device.open_output_stream(1, 16 * 1024)?;
//! writer.write_all(&vec![0u8; 1 << 20])?;
//! writer.flush()?;
//! drop(writer);
//!
//! device.close()?;
//! # Ok(())
//! # }
//! ```
#![warn(clippy::all, clippy::pedantic, missing_docs)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod backend;
pub mod descriptor;
mod device;
mod error;
pub mod prelude;
mod registry;
mod stream;
mod transfer;

pub use descriptor::{Direction, TransferType};
pub use device::Device;
pub use error::{Error, Result};
#[cfg(target_os = "linux")]
pub use registry::registry;
pub use registry::{DeviceHandler, Registry};
pub use stream::{EndpointReader, EndpointWriter};
pub use transfer::{ControlRequest, ControlType, Recipient};
