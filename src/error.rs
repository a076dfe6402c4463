//! ## USBTMC Errors
//!
//! The errors used throughout the crate.
//!

/// Result alias with the error hardwired to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No USB device matched the requested vid/pid/serial.
    #[error("device not found")]
    NotFound,
    /// A device was found but it has no USBTMC interface, or the interface
    /// is missing its bulk endpoints.
    #[error("device is not compatible with USBTMC")]
    NotUsbtmc,
    /// The OS refused the claim or the kernel-driver detach.
    #[error("permission denied while claiming the device")]
    PermissionDenied,
    /// A bulk or control transfer exceeded its deadline. The matching abort
    /// sequence has already run by the time this surfaces.
    #[error("transfer timed out")]
    Timeout,
    /// Short transfer, device removal, or an underlying USB library error.
    #[error("usb i/o error: {0}")]
    Io(String),
    /// An inbound header did not match expectations (wrong MsgID, wrong or
    /// corrupt bTag). The bulk-in abort has already run when this surfaces.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    /// An abort state machine returned a terminal failure status or its
    /// bounded poll loop was exhausted.
    #[error("bulk abort sequence failed")]
    AbortFailed,
    /// INITIATE_CLEAR was rejected or CHECK_CLEAR_STATUS never left pending.
    #[error("device clear failed")]
    ClearFailed,
    /// The resource string is not `USB[n]::vid::pid[::serial]::INSTR`.
    #[error("invalid resource string: {0:?}")]
    InvalidResource(String),
    /// A USB488-only operation was invoked on a pure USBTMC device, or the
    /// required capability bit is missing.
    #[error("operation not supported by this device")]
    NotSupported,
}

impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Error {
        match e {
            rusb::Error::Timeout => Error::Timeout,
            rusb::Error::Access => Error::PermissionDenied,
            other => Error::Io(other.to_string()),
        }
    }
}
