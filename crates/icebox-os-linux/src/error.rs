use icebox_symbols::SymbolError;

/// Error type for the Linux guest model.
#[derive(thiserror::Error, Debug)]
pub enum LinuxError {
    /// No `Linux version` banner was found around the syscall entry.
    #[error("Linux banner not found")]
    BannerNotFound,

    /// No GNU build-id note was found in the kernel image.
    #[error("Kernel build-id not found")]
    BuildIdNotFound,

    /// The executing task could not be resolved from the vCPU state.
    #[error("Current task undetermined")]
    CurrentTaskUndetermined,

    /// The task list walk hit an implausible entry.
    #[error("Task list corrupted near {0}")]
    CorruptTaskList(icebox_core::Va),

    /// A structure member the model depends on is missing from the symbol
    /// index.
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

impl From<LinuxError> for icebox_core::VmError {
    fn from(value: LinuxError) -> Self {
        match value {
            LinuxError::Symbol(err) => Self::Symbol(Box::new(err)),
            err => Self::Os(Box::new(err)),
        }
    }
}
