//! Per-module symbol indexes and the on-disk symbol store.
//!
//! A [`SymbolModule`] is an immutable index built from an external debug
//! file: symbol-name to offset, nearest-symbol by offset, structure layouts
//! with member offsets. [`SymbolStore`] keys modules by `(name, build-id)`
//! and resolves debug files in a symbol-server-shaped cache directory.
//! [`find_codeview`] identifies a PDB from raw image bytes.

mod codeview;
mod error;
mod module;
mod store;

pub use self::{
    codeview::{find_codeview, CodeView},
    error::SymbolError,
    module::{ModuleId, StructMembers, SymbolModule, SymbolModuleBuilder},
    store::{gnu_build_id, parse_symbol_path, SymbolLoader, SymbolStore, SYMBOL_PATH_ENV},
};
