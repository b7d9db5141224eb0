use serde::{Deserialize, Serialize};

use super::macros::impl_ops;

impl_ops!(Gfn, u64, "Guest Frame Number");
impl_ops!(Pa, u64, "Guest Physical Address");
impl_ops!(Va, u64, "Guest Virtual Address");

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The physical root of a guest address space.
///
/// Every virtual read is parameterized by a directory table: the kernel has
/// one, and each process carries its own. On AMD64 this is the page-aligned
/// portion of `CR3`.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Dtb(pub Pa);

impl Dtb {
    /// Creates a directory table root from a raw `CR3` value.
    ///
    /// Masks out the PCID and flag bits, keeping only the physical page
    /// address of the top-level table.
    pub const fn from_cr3(cr3: u64) -> Self {
        Self(Pa(cr3 & 0x000F_FFFF_FFFF_F000))
    }

    /// Returns the physical address of the top-level table.
    pub fn root(self) -> Pa {
        self.0
    }

    /// Checks if the directory table root is NULL.
    pub fn is_null(self) -> bool {
        self.0.0 == 0
    }
}

impl From<Pa> for Dtb {
    fn from(value: Pa) -> Self {
        Self(value)
    }
}

impl From<Dtb> for Pa {
    fn from(value: Dtb) -> Self {
        value.0
    }
}

impl std::fmt::Display for Dtb {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr3_flag_bits_are_masked() {
        // PCID 0x123 and the PWT/PCD bits must not leak into the root.
        let dtb = Dtb::from_cr3(0x0000_0001_2345_6123);
        assert_eq!(dtb.root(), Pa(0x0000_0001_2345_6000));
    }

    #[test]
    fn address_arithmetic() {
        let va = Va(0x1000);
        assert_eq!(va + 0x234, Va(0x1234));
        assert_eq!((va + 0x234) & !0xfff, Va(0x1000));
        assert_eq!(Va(0x2000) - va, Va(0x1000));
    }
}
