//! Public prelude of the crate containing the most commonly used types and
//! functions.

#[cfg(target_os = "linux")]
pub use crate::registry::registry;
pub use crate::{
    ControlRequest, ControlType, Device, Direction, EndpointReader, EndpointWriter, Error,
    Recipient, Registry, Result, TransferType,
};
