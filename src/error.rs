use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error returned by every fallible operation in this crate.
///
/// The taxonomy is deliberately flat. The first group of variants are
/// programmer errors: a precondition of the device state machine was violated
/// and retrying without fixing the call site is pointless. The second group
/// (`Stalled`, `Timeout`, `Cancelled`, `Disconnected`) are environmental
/// conditions a robust caller is expected to handle. `Native` carries
/// anything a backend could not express more precisely, along with the native
/// status code for diagnostics.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed binary descriptor. Raised only by the parser; never retried.
    #[error("{0}")]
    InvalidDescriptor(String),

    /// The device is not open.
    #[error("device is not open")]
    NotOpen,

    /// The device is already open.
    #[error("device is already open")]
    AlreadyOpen,

    /// The interface number does not exist on this device.
    #[error("interface {0} does not exist")]
    InvalidInterface(u8),

    /// The interface is already claimed, by this process or another.
    #[error("interface {0} is already claimed")]
    AlreadyClaimed(u8),

    /// The operation requires the interface to be claimed first.
    #[error("interface {0} is not claimed")]
    NotClaimed(u8),

    /// The interface exists but has no alternate setting with this number.
    #[error("interface {interface} has no alternate setting {alternate}")]
    InvalidAlternate {
        /// Interface number.
        interface: u8,
        /// Requested alternate setting number.
        alternate: u8,
    },

    /// The endpoint does not exist in the current alternate settings of the
    /// claimed interfaces, or its direction or transfer type does not match
    /// the call.
    #[error("{0}")]
    InvalidEndpoint(String),

    /// The endpoint is halted. Call
    /// [`clear_halt`](crate::Device::clear_halt) before retrying; a stall on
    /// the control endpoint clears itself and needs no explicit recovery.
    #[error("endpoint is halted")]
    Stalled,

    /// The operation did not complete within the requested time. The
    /// underlying request is guaranteed to have been cancelled before this
    /// is returned.
    #[error("transfer timed out")]
    Timeout,

    /// The transfer was aborted, either explicitly or because the device was
    /// closed.
    #[error("transfer was cancelled")]
    Cancelled,

    /// The device has been physically disconnected. Terminal: every further
    /// operation on the same device fails the same way.
    #[error("device has been disconnected")]
    Disconnected,

    /// A backend failure not covered by the other variants.
    #[error("{message}")]
    Native {
        /// Human-readable description of the failure.
        message: String,
        /// Native status code, if the backend had one.
        code: Option<i32>,
    },
}

impl Error {
    pub(crate) fn native(message: impl Into<String>, code: Option<i32>) -> Self {
        Error::Native {
            message: message.into(),
            code,
        }
    }

    /// The native status code attached to this error, if any.
    #[must_use]
    pub fn native_code(&self) -> Option<i32> {
        match self {
            Error::Native { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::Disconnected => io::ErrorKind::NotConnected,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::Stalled => io::ErrorKind::ConnectionReset,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
