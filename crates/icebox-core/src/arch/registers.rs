use super::{Cr0, Cr3, Cr4, Gdtr, Idtr, MsrEfer, PagingMode, Rflags, Segment};
use crate::{Dtb, Va};

/// The state of the CPU registers for one virtual CPU.
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: Rflags,

    pub cr0: Cr0,
    pub cr2: u64,
    pub cr3: Cr3,
    pub cr4: Cr4,

    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,

    pub idtr: Idtr,
    pub gdtr: Gdtr,

    pub shadow_gs: u64,

    pub msr_efer: MsrEfer,
    pub msr_lstar: u64,
    pub msr_star: u64,
}

impl Registers {
    /// Returns the instruction pointer.
    pub fn instruction_pointer(&self) -> Va {
        Va(self.rip)
    }

    /// Returns the stack pointer.
    pub fn stack_pointer(&self) -> Va {
        Va(self.rsp)
    }

    /// Returns the function result register (`RAX`).
    pub fn result(&self) -> u64 {
        self.rax
    }

    /// Sets the function result register (`RAX`).
    pub fn set_result(&mut self, result: u64) {
        self.rax = result;
    }

    /// Returns the active directory table root.
    pub fn dtb(&self) -> Dtb {
        self.cr3.dtb()
    }

    /// Determine the paging mode of the processor based on control register
    /// values.
    ///
    /// Returns `None` when paging is disabled (CR0.PG = 0).
    pub fn paging_mode(&self) -> Option<PagingMode> {
        if !self.cr0.paging() {
            return None;
        }

        if !self.cr4.physical_address_extension() {
            return Some(PagingMode::Legacy);
        }

        if !self.msr_efer.long_mode_enable() {
            return Some(PagingMode::Pae);
        }

        if !self.cr4.linear_address_57_bit() {
            return Some(PagingMode::Ia32e);
        }

        Some(PagingMode::Ia32eLa57)
    }

    /// Returns the pointer width of the active paging mode in bytes.
    pub fn address_width(&self) -> usize {
        self.paging_mode().map_or(0, PagingMode::address_width)
    }

    /// Returns the pointer width seen by the currently executing code.
    ///
    /// In IA-32e mode a compatibility-mode code segment (CS.L = 0) still uses
    /// 32-bit addresses even though the paging mode is 64-bit.
    pub fn effective_address_width(&self) -> usize {
        match self.paging_mode() {
            Some(PagingMode::Ia32e | PagingMode::Ia32eLa57) if !self.cs.access.long_mode() => 4,
            Some(mode) => mode.address_width(),
            None => 0,
        }
    }

    /// Returns the base of the kernel per-CPU segment.
    ///
    /// When the CPU was interrupted in user mode (or `swapgs` has not run
    /// yet), the kernel base sits in the shadow slot.
    pub fn kernel_gs_base(&self) -> Va {
        if self.cs.selector.request_privilege_level() != 0 || (self.gs.base & (1 << 47)) == 0 {
            Va(self.shadow_gs)
        }
        else {
            Va(self.gs.base)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SegmentAccess;

    fn long_mode_registers() -> Registers {
        Registers {
            cr0: Cr0(1 << 31),
            cr4: Cr4(1 << 5),
            msr_efer: MsrEfer((1 << 8) | (1 << 10)),
            ..Default::default()
        }
    }

    #[test]
    fn paging_mode_from_control_registers() {
        let mut regs = Registers::default();
        assert_eq!(regs.paging_mode(), None);

        regs.cr0 = Cr0(1 << 31);
        assert_eq!(regs.paging_mode(), Some(PagingMode::Legacy));

        regs.cr4 = Cr4(1 << 5);
        assert_eq!(regs.paging_mode(), Some(PagingMode::Pae));

        regs.msr_efer = MsrEfer(1 << 8);
        assert_eq!(regs.paging_mode(), Some(PagingMode::Ia32e));

        regs.cr4 = Cr4((1 << 5) | (1 << 12));
        assert_eq!(regs.paging_mode(), Some(PagingMode::Ia32eLa57));
    }

    #[test]
    fn compatibility_mode_narrows_addresses() {
        let mut regs = long_mode_registers();
        regs.cs.access = SegmentAccess(1 << 9);
        assert_eq!(regs.effective_address_width(), 8);

        regs.cs.access = SegmentAccess(0);
        assert_eq!(regs.effective_address_width(), 4);
        assert_eq!(regs.address_width(), 8);
    }

    #[test]
    fn kernel_gs_picks_shadow_slot_in_user_mode() {
        let mut regs = long_mode_registers();
        regs.gs.base = 0xFFFF_8000_0000_1000u64;
        regs.shadow_gs = 0x7FF0_0000_2000;

        // Kernel mode, kernel-half GS base: take GS directly.
        assert_eq!(regs.kernel_gs_base(), Va(0xFFFF_8000_0000_1000));

        // User mode: the kernel base has been swapped out.
        regs.cs.selector = crate::arch::Selector(0x33);
        assert_eq!(regs.kernel_gs_base(), Va(0x7FF0_0000_2000));
    }
}
