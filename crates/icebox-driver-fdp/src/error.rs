use icebox_core::Pa;

/// Error type for the FDP channel.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The shared region could not be opened or mapped.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The shared region does not carry the FDP magic.
    #[error("Not an FDP region (magic {0:#010x})")]
    BadMagic(u32),

    /// The counterpart speaks an incompatible protocol version.
    #[error("Unsupported FDP protocol version {0}")]
    VersionMismatch(u32),

    /// The shared region is smaller than the protocol requires.
    #[error("FDP region truncated ({0} bytes)")]
    Truncated(usize),

    /// The counterpart did not acknowledge a request in time.
    #[error("FDP request timed out")]
    RequestTimeout,

    /// No event arrived within the wait deadline.
    #[error("Timed out waiting for an event")]
    EventTimeout,

    /// The counterpart rejected a physical address.
    #[error("Invalid physical address {0}")]
    InvalidAddress(Pa),

    /// The counterpart rejected a vCPU index.
    #[error("Invalid vCPU")]
    InvalidVcpu,

    /// The counterpart does not know the breakpoint id.
    #[error("Unknown breakpoint")]
    UnknownBreakpoint,

    /// The counterpart cannot perform the operation.
    #[error("Operation not supported by the counterpart")]
    NotSupported,

    /// A transfer exceeds the data window.
    #[error("Transfer larger than the data window")]
    TooLarge,

    /// The counterpart reported an unknown status code.
    #[error("FDP status {0}")]
    Status(u32),
}

impl From<Error> for icebox_core::VmError {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(err) => Self::Io(err),
            Error::EventTimeout => Self::Timeout,
            Error::InvalidAddress(pa) => Self::OutOfPhysicalBounds(pa),
            Error::UnknownBreakpoint => Self::UnknownBreakpoint,
            Error::NotSupported => Self::NotSupported,
            err => Self::Channel(Box::new(err)),
        }
    }
}
