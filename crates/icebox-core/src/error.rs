use crate::{Dtb, Pa, Va};

/// A virtual address that failed to translate, together with the directory
/// table the walk started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageFault {
    /// The virtual address that faulted.
    pub address: Va,

    /// The directory table used for the walk.
    pub root: Dtb,
}

impl From<(Va, Dtb)> for PageFault {
    fn from(value: (Va, Dtb)) -> Self {
        Self {
            address: value.0,
            root: value.1,
        }
    }
}

/// A collection of page faults.
pub type PageFaults = smallvec::SmallVec<[PageFault; 1]>;

/// An error that can occur when working with a virtual machine.
#[derive(thiserror::Error, Debug)]
pub enum VmError {
    /// The channel transport failed (connection gone, corrupt frame).
    #[error(transparent)]
    Channel(Box<dyn std::error::Error + Send + Sync>),

    /// An OS-specific error occurred.
    #[error(transparent)]
    Os(Box<dyn std::error::Error + Send + Sync>),

    /// A symbol lookup or symbol file error occurred.
    #[error(transparent)]
    Symbol(Box<dyn std::error::Error + Send + Sync>),

    /// A tracing-engine error occurred.
    #[error(transparent)]
    Tracer(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A virtual address did not translate.
    #[error("Translation error ({:?}, len: {})", .0[0], .0.len())]
    Translation(PageFaults),

    /// A physical address is outside of guest memory.
    #[error("Physical address {0} out of bounds")]
    OutOfPhysicalBounds(Pa),

    /// The given address has invalid width.
    #[error("Invalid address width")]
    InvalidAddressWidth,

    /// The breakpoint address is already installed with an incompatible kind.
    #[error("Breakpoint conflict at {0}")]
    BreakpointConflict(Pa),

    /// The breakpoint id is not registered.
    #[error("Unknown breakpoint")]
    UnknownBreakpoint,

    /// The operation is not valid in the current run state.
    #[error("Invalid run state: expected {expected}, currently {actual}")]
    InvalidRunState {
        /// The state the operation requires.
        expected: &'static str,
        /// The state the session was in.
        actual: &'static str,
    },

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// The directory table root is not present.
    #[error("Root not present")]
    RootNotPresent,

    /// Timeout.
    #[error("Operation timed out.")]
    Timeout,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl VmError {
    /// Creates a new translation error for a single faulting address.
    pub fn page_fault(pf: impl Into<PageFault>) -> Self {
        Self::Translation(smallvec::smallvec![pf.into()])
    }

    /// Creates a new translation error for multiple faulting addresses.
    pub fn page_faults(pfs: impl IntoIterator<Item = PageFault>) -> Self {
        Self::Translation(pfs.into_iter().collect())
    }
}
