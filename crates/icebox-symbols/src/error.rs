/// An error raised while loading or querying symbols.
#[derive(thiserror::Error, Debug)]
pub enum SymbolError {
    /// No debug file for the module was found in the store.
    #[error("No symbols for module {name} ({build_id})")]
    MissingModule {
        /// The module name.
        name: String,
        /// The build identity the lookup was keyed on.
        build_id: String,
    },

    /// A symbol name was not present in the module index.
    #[error("Symbol {module}!{symbol} not found")]
    MissingSymbol {
        /// The module name.
        module: String,
        /// The symbol name.
        symbol: String,
    },

    /// A structure was not present in the module index.
    #[error("Structure {module}!{structure} not found")]
    MissingStruct {
        /// The module name.
        module: String,
        /// The structure name.
        structure: String,
    },

    /// A structure member was not present in the module index.
    #[error("Member {module}!{structure}.{member} not found")]
    MissingMember {
        /// The module name.
        module: String,
        /// The structure name.
        structure: String,
        /// The member name.
        member: String,
    },

    /// The debug file exists but could not be parsed.
    #[error("Corrupt debug file {path}: {reason}")]
    CorruptDebugFile {
        /// The file that failed to parse.
        path: String,
        /// Human-readable parse failure.
        reason: String,
    },

    /// No symbol cache root is configured.
    #[error("No symbol cache root configured (set {0})")]
    NoCacheRoot(&'static str),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
