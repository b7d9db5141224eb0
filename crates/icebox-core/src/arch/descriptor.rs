use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The interrupt descriptor table register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Idtr {
    /// The linear base address of the IDT.
    pub base: u64,

    /// The table limit in bytes.
    pub limit: u16,
}

/// The global descriptor table register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Gdtr {
    /// The linear base address of the GDT.
    pub base: u64,

    /// The table limit in bytes.
    pub limit: u16,
}

/// A 64-bit interrupt gate descriptor.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IdtEntry64 {
    /// Handler offset bits 0..16.
    pub offset_low: u16,

    /// Code segment selector.
    pub selector: u16,

    /// IST index and gate attributes.
    pub attributes: u16,

    /// Handler offset bits 16..32.
    pub offset_middle: u16,

    /// Handler offset bits 32..64.
    pub offset_high: u32,

    /// Reserved.
    pub reserved: u32,
}

impl IdtEntry64 {
    /// Assembles the handler address from the split offset fields.
    pub fn handler(&self) -> u64 {
        (self.offset_low as u64)
            | ((self.offset_middle as u64) << 16)
            | ((self.offset_high as u64) << 32)
    }

    /// Checks if the gate is present.
    pub fn present(&self) -> bool {
        (self.attributes >> 15) & 1 != 0
    }
}
