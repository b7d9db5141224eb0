use std::collections::HashMap;

/// The stable identity of a symbol module.
///
/// Modules are keyed by `(name, build-id)`: the PDB GUID+age on Windows, the
/// GNU build-id on Linux, or a hash of the debug directory for stripped
/// images.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleId {
    /// The short module name (e.g. `ntkrnlmp.pdb`, `vmlinux`).
    pub name: String,

    /// The build identity string.
    pub build_id: String,
}

impl ModuleId {
    /// Creates a module identity.
    pub fn new(name: impl Into<String>, build_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            build_id: build_id.into(),
        }
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.build_id)
    }
}

/// A slice index into the string arena.
#[derive(Debug, Clone, Copy)]
struct StrRef {
    start: u32,
    len: u32,
}

#[derive(Debug, Clone, Copy)]
struct SymbolEntry {
    name: StrRef,
    offset: u64,
}

#[derive(Debug, Clone, Copy)]
struct StructEntry {
    name: StrRef,
    size: u64,
    /// Range into the member table.
    members: (u32, u32),
}

#[derive(Debug, Clone, Copy)]
struct MemberEntry {
    name: StrRef,
    offset: u64,
}

/// An immutable per-module symbol index.
///
/// All strings live in one flat byte arena and entries reference them by
/// slice index; a returned `&str` stays valid (and pointer-stable) for the
/// lifetime of the module. Symbols are kept sorted by offset for
/// nearest-neighbour lookup, with a name-sorted permutation for exact
/// lookups. Member lookups are case-insensitive to mirror compiler
/// conventions.
pub struct SymbolModule {
    id: ModuleId,
    strings: Box<[u8]>,
    symbols: Box<[SymbolEntry]>,
    by_name: Box<[u32]>,
    structs: Box<[StructEntry]>,
    members: Box<[MemberEntry]>,
}

impl SymbolModule {
    /// Starts building a module index.
    pub fn builder(id: ModuleId) -> SymbolModuleBuilder {
        SymbolModuleBuilder {
            id,
            strings: Vec::new(),
            interned: HashMap::new(),
            symbols: Vec::new(),
            structs: Vec::new(),
        }
    }

    /// Returns the module identity.
    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    /// Returns the module name.
    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Returns the build identity string.
    pub fn build_id(&self) -> &str {
        &self.id.build_id
    }

    /// Returns the number of symbols in the index.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Checks if the index holds no symbols.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Looks up the offset of a symbol by its exact name.
    pub fn symbol_offset(&self, name: &str) -> Option<u64> {
        let index = self
            .by_name
            .binary_search_by(|&i| self.str_at(self.symbols[i as usize].name).cmp(name))
            .ok()?;
        Some(self.symbols[self.by_name[index] as usize].offset)
    }

    /// Finds the symbol covering an offset.
    ///
    /// Returns the nearest symbol at or below `offset` together with the
    /// distance into it.
    pub fn find_symbol(&self, offset: u64) -> Option<(&str, u64)> {
        let index = self.symbols.partition_point(|entry| entry.offset <= offset);
        if index == 0 {
            return None;
        }

        let entry = &self.symbols[index - 1];
        Some((self.str_at(entry.name), offset - entry.offset))
    }

    /// Returns the size of a structure.
    pub fn struct_size(&self, name: &str) -> Option<u64> {
        Some(self.find_struct(name)?.size)
    }

    /// Returns the offset of a member within a structure.
    ///
    /// Member comparison is case-insensitive.
    pub fn member_offset(&self, structure: &str, member: &str) -> Option<u64> {
        let entry = self.find_struct(structure)?;
        let members = &self.members[entry.members.0 as usize..entry.members.1 as usize];

        let index = members
            .binary_search_by(|m| {
                cmp_ignore_case(self.str_at(m.name), member)
            })
            .ok()?;

        Some(members[index].offset)
    }

    /// Iterates the members of a structure as `(name, offset)` pairs.
    pub fn members(&self, structure: &str) -> Option<impl Iterator<Item = (&str, u64)>> {
        let entry = self.find_struct(structure)?;
        let members = &self.members[entry.members.0 as usize..entry.members.1 as usize];
        Some(
            members
                .iter()
                .map(move |m| (self.str_at(m.name), m.offset)),
        )
    }

    /// Walks every symbol ordered by offset. The callback returns `false` to
    /// stop the walk.
    pub fn list_symbols(&self, mut callback: impl FnMut(&str, u64) -> bool) {
        for entry in &self.symbols {
            if !callback(self.str_at(entry.name), entry.offset) {
                break;
            }
        }
    }

    fn find_struct(&self, name: &str) -> Option<&StructEntry> {
        let index = self
            .structs
            .binary_search_by(|entry| self.str_at(entry.name).cmp(name))
            .ok()?;
        Some(&self.structs[index])
    }

    fn str_at(&self, r: StrRef) -> &str {
        // The builder only interns valid UTF-8.
        unsafe {
            std::str::from_utf8_unchecked(&self.strings[r.start as usize..(r.start + r.len) as usize])
        }
    }
}

impl std::fmt::Debug for SymbolModule {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SymbolModule")
            .field("id", &self.id)
            .field("symbols", &self.symbols.len())
            .field("structs", &self.structs.len())
            .finish()
    }
}

fn cmp_ignore_case(a: &str, b: &str) -> std::cmp::Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

/// Accumulates symbols and structure layouts, then freezes them into a
/// [`SymbolModule`].
///
/// The arena is append-only: interning never moves previously stored
/// strings, and equal strings are stored once.
pub struct SymbolModuleBuilder {
    id: ModuleId,
    strings: Vec<u8>,
    interned: HashMap<String, StrRef>,
    symbols: Vec<SymbolEntry>,
    structs: Vec<(StrRef, u64, Vec<MemberEntry>)>,
}

impl SymbolModuleBuilder {
    /// Records a symbol at an image-relative offset.
    pub fn symbol(&mut self, name: &str, offset: u64) -> &mut Self {
        let name = self.intern(name);
        self.symbols.push(SymbolEntry { name, offset });
        self
    }

    /// Records a structure layout.
    pub fn structure(
        &mut self,
        name: &str,
        size: u64,
        members: impl FnOnce(&mut StructMembers<'_>),
    ) -> &mut Self {
        let name = self.intern(name);
        let mut collected = Vec::new();

        {
            let mut scope = StructMembers {
                builder: self,
                members: &mut collected,
            };
            members(&mut scope);
        }

        self.structs.push((name, size, collected));
        self
    }

    /// Freezes the builder into an immutable index.
    pub fn build(mut self) -> SymbolModule {
        // Sort symbols by offset and derive the name-sorted permutation.
        self.symbols.sort_by_key(|entry| entry.offset);

        let strings = self.strings.into_boxed_slice();
        let str_at = |r: StrRef| -> &str {
            unsafe {
                std::str::from_utf8_unchecked(&strings[r.start as usize..(r.start + r.len) as usize])
            }
        };

        let mut by_name: Vec<u32> = (0..self.symbols.len() as u32).collect();
        by_name.sort_by(|&a, &b| {
            str_at(self.symbols[a as usize].name).cmp(str_at(self.symbols[b as usize].name))
        });

        self.structs
            .sort_by(|(a, ..), (b, ..)| str_at(*a).cmp(str_at(*b)));

        let mut structs = Vec::with_capacity(self.structs.len());
        let mut members = Vec::new();

        for (name, size, mut struct_members) in self.structs {
            struct_members.sort_by(|a, b| cmp_ignore_case(str_at(a.name), str_at(b.name)));

            let start = members.len() as u32;
            members.extend(struct_members);
            let end = members.len() as u32;

            structs.push(StructEntry {
                name,
                size,
                members: (start, end),
            });
        }

        SymbolModule {
            id: self.id,
            strings,
            symbols: self.symbols.into_boxed_slice(),
            by_name: by_name.into_boxed_slice(),
            structs: structs.into_boxed_slice(),
            members: members.into_boxed_slice(),
        }
    }

    fn intern(&mut self, s: &str) -> StrRef {
        if let Some(&r) = self.interned.get(s) {
            return r;
        }

        let r = StrRef {
            start: self.strings.len() as u32,
            len: s.len() as u32,
        };
        self.strings.extend_from_slice(s.as_bytes());
        self.interned.insert(s.to_owned(), r);
        r
    }
}

/// Scope for recording the members of one structure.
pub struct StructMembers<'a> {
    builder: &'a mut SymbolModuleBuilder,
    members: &'a mut Vec<MemberEntry>,
}

impl StructMembers<'_> {
    /// Records a member at an offset within the structure.
    pub fn member(&mut self, name: &str, offset: u64) -> &mut Self {
        let name = self.builder.intern(name);
        self.members.push(MemberEntry { name, offset });
        self
    }
}
