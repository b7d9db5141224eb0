use std::{
    cell::RefCell,
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
};

use elf::{endian::AnyEndian, note::Note, ElfBytes};

use crate::{ModuleId, SymbolError, SymbolModule};

/// The environment variable naming the symbol cache root.
pub const SYMBOL_PATH_ENV: &str = "_NT_SYMBOL_PATH";

/// Parses an external debug file (PDB, DWARF, stripped ELF/PE) into a
/// [`SymbolModule`].
///
/// The binary-format parsers themselves live outside this crate; a loader
/// adapts one of them to the module index.
pub trait SymbolLoader {
    /// Parses the file at `path` into a module index for `id`.
    ///
    /// Returns `Ok(None)` when the loader does not handle this file format,
    /// letting the store try the next loader.
    fn load(&self, path: &Path, id: &ModuleId) -> Result<Option<SymbolModule>, SymbolError>;
}

/// An on-disk symbol cache plus the set of loaders that can parse its files.
///
/// The layout mirrors Microsoft symbol servers:
/// `<root>/<name>/<build-id>/<name>` holds a PDB, and for Linux guests
/// `<root>/<build-id>/debug` holds the DWARF file. Loaded modules are cached
/// by identity.
pub struct SymbolStore {
    root: PathBuf,
    loaders: Vec<Box<dyn SymbolLoader>>,
    modules: RefCell<HashMap<ModuleId, Rc<SymbolModule>>>,
}

impl SymbolStore {
    /// Creates a store over an explicit cache root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaders: Vec::new(),
            modules: RefCell::new(HashMap::new()),
        }
    }

    /// Creates a store from the `_NT_SYMBOL_PATH`-style environment variable.
    pub fn from_env() -> Result<Self, SymbolError> {
        let value =
            std::env::var(SYMBOL_PATH_ENV).map_err(|_| SymbolError::NoCacheRoot(SYMBOL_PATH_ENV))?;

        match parse_symbol_path(&value) {
            Some(root) => Ok(Self::new(root)),
            None => Err(SymbolError::NoCacheRoot(SYMBOL_PATH_ENV)),
        }
    }

    /// Adds a debug-file loader.
    pub fn with_loader(mut self, loader: impl SymbolLoader + 'static) -> Self {
        self.loaders.push(Box::new(loader));
        self
    }

    /// Returns the cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The on-disk location of a PDB: `<root>/<name>/<build-id>/<name>`.
    pub fn pdb_path(&self, id: &ModuleId) -> PathBuf {
        self.root.join(&id.name).join(&id.build_id).join(&id.name)
    }

    /// The on-disk location of a Linux debug file: `<root>/<build-id>/debug`.
    pub fn debug_path(&self, build_id: &str) -> PathBuf {
        self.root.join(build_id).join("debug")
    }

    /// Registers a pre-built module index.
    pub fn insert(&self, module: SymbolModule) -> Rc<SymbolModule> {
        let module = Rc::new(module);
        self.modules
            .borrow_mut()
            .insert(module.id().clone(), module.clone());
        module
    }

    /// Resolves a module index by identity, loading the debug file from the
    /// cache hierarchy on first use.
    pub fn module(&self, id: &ModuleId) -> Result<Rc<SymbolModule>, SymbolError> {
        if let Some(module) = self.modules.borrow().get(id) {
            return Ok(module.clone());
        }

        let candidates = [self.pdb_path(id), self.debug_path(&id.build_id)];

        for path in &candidates {
            if !path.is_file() {
                continue;
            }

            tracing::debug!(?path, %id, "loading debug file");

            for loader in &self.loaders {
                if let Some(module) = loader.load(path, id)? {
                    return Ok(self.insert(module));
                }
            }
        }

        Err(SymbolError::MissingModule {
            name: id.name.clone(),
            build_id: id.build_id.clone(),
        })
    }
}

/// Extracts the local cache directory from a `_NT_SYMBOL_PATH` value.
///
/// Elements are `;`-separated; `srv*<local>*<server>` elements contribute
/// their local directory, plain elements are used as-is.
pub fn parse_symbol_path(value: &str) -> Option<PathBuf> {
    for element in value.split(';').filter(|e| !e.is_empty()) {
        if let Some(rest) = element
            .strip_prefix("srv*")
            .or_else(|| element.strip_prefix("SRV*"))
        {
            let local = rest.split('*').next().unwrap_or("");
            if !local.is_empty() {
                return Some(PathBuf::from(local));
            }
            continue;
        }

        return Some(PathBuf::from(element));
    }

    None
}

/// Reads the GNU build-id note of an ELF debug file, hex-encoded lowercase.
pub fn gnu_build_id(path: &Path) -> Result<Option<String>, SymbolError> {
    let file = std::fs::File::open(path)?;
    let data = unsafe { memmap2::Mmap::map(&file)? };

    let elf = ElfBytes::<AnyEndian>::minimal_parse(&data).map_err(|err| {
        SymbolError::CorruptDebugFile {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    })?;

    let section = match elf
        .section_header_by_name(".note.gnu.build-id")
        .map_err(|err| SymbolError::CorruptDebugFile {
            path: path.display().to_string(),
            reason: err.to_string(),
        })? {
        Some(section) => section,
        None => return Ok(None),
    };

    let notes = elf
        .section_data_as_notes(&section)
        .map_err(|err| SymbolError::CorruptDebugFile {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;

    for note in notes {
        if let Note::GnuBuildId(build_id) = note {
            let mut hex = String::with_capacity(build_id.0.len() * 2);
            for byte in build_id.0 {
                hex.push_str(&format!("{byte:02x}"));
            }
            return Ok(Some(hex));
        }
    }

    Ok(None)
}
