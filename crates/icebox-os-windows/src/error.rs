use icebox_symbols::SymbolError;

/// Error type for the Windows guest model.
#[derive(thiserror::Error, Debug)]
pub enum WindowsError {
    /// No kernel image was found below the IDT handlers.
    #[error("Windows kernel image not found")]
    KernelNotFound,

    /// The kernel image carries no usable CodeView record.
    #[error("Windows kernel has no CodeView debug entry")]
    MissingCodeView,

    /// The executing thread could not be resolved from the vCPU state.
    #[error("Current thread undetermined")]
    CurrentThreadUndetermined,

    /// The process list walk hit an implausible entry.
    #[error("Process list corrupted near {0}")]
    CorruptProcessList(icebox_core::Va),

    /// A module is not mapped in the target process.
    #[error("Module {0} not found in process")]
    ModuleNotFound(String),

    /// A kernel structure member the model depends on is missing from the
    /// symbol index.
    #[error("Missing layout member {structure}.{member}")]
    MissingMember {
        /// The structure name.
        structure: &'static str,
        /// The member name.
        member: &'static str,
    },

    /// A kernel symbol the model depends on is missing.
    #[error("Missing kernel symbol {0}")]
    MissingSymbol(&'static str),

    /// A symbol store error.
    #[error(transparent)]
    Symbol(#[from] SymbolError),
}

impl From<WindowsError> for icebox_core::VmError {
    fn from(value: WindowsError) -> Self {
        match value {
            WindowsError::Symbol(err) => Self::Symbol(Box::new(err)),
            err => Self::Os(Box::new(err)),
        }
    }
}
