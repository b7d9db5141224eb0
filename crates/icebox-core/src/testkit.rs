//! An in-memory channel for the workspace test suites.
//!
//! [`MockChannel`] models the hypervisor counterpart: a page store, per-vCPU
//! register files, a breakpoint table that patches bytes the way the real
//! surface does, and a scripted event queue. It also knows how to build
//! 4-level page tables so tests can exercise virtual reads end to end.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    time::Duration,
};

use crate::{
    arch::{self, PageTableEntry, Registers},
    BreakpointId, BreakpointKind, Channel, Dtb, Gfn, Pa, Va, VcpuId, VmError, VmEvent, VmInfo,
};

const PAGE: usize = arch::PAGE_SIZE as usize;

struct MockBreakpoint {
    pa: Pa,
    kind: BreakpointKind,
    original: u8,
}

/// A scriptable in-memory channel.
#[derive(Default)]
pub struct MockChannel {
    pages: RefCell<HashMap<Gfn, Box<[u8; PAGE]>>>,
    registers: RefCell<HashMap<VcpuId, Registers>>,
    msrs: RefCell<HashMap<(VcpuId, u32), u64>>,
    breakpoints: RefCell<HashMap<BreakpointId, MockBreakpoint>>,
    next_breakpoint: Cell<u32>,
    next_gfn: Cell<u64>,
    events: RefCell<VecDeque<VmEvent>>,
    paused: Cell<bool>,
    resumes: Cell<u32>,
    singlesteps: RefCell<Vec<VcpuId>>,
}

impl MockChannel {
    /// Creates an empty mock.
    pub fn new() -> Self {
        Self {
            next_gfn: Cell::new(0x1000),
            ..Default::default()
        }
    }

    /// Allocates a fresh, unused guest frame and backs it with a zero page.
    pub fn alloc_gfn(&self) -> Gfn {
        let gfn = Gfn(self.next_gfn.get());
        self.next_gfn.set(gfn.0 + 1);
        self.insert_page(gfn);
        gfn
    }

    /// Backs a guest frame with a zero page.
    pub fn insert_page(&self, gfn: Gfn) {
        self.pages
            .borrow_mut()
            .entry(gfn)
            .or_insert_with(|| Box::new([0u8; PAGE]));
    }

    /// Writes bytes into physical memory, creating pages on demand.
    pub fn write_bytes(&self, pa: Pa, data: &[u8]) {
        let mut position = 0usize;

        while position < data.len() {
            let address = pa + position as u64;
            let gfn = arch::gfn_from_pa(address);
            let offset = arch::pa_offset(address) as usize;

            self.insert_page(gfn);

            let size = std::cmp::min(data.len() - position, PAGE - offset);
            let mut pages = self.pages.borrow_mut();
            let page = pages.get_mut(&gfn).unwrap();
            page[offset..offset + size].copy_from_slice(&data[position..position + size]);

            position += size;
        }
    }

    /// Reads one byte of physical memory.
    pub fn read_byte(&self, pa: Pa) -> u8 {
        let gfn = arch::gfn_from_pa(pa);
        let offset = arch::pa_offset(pa) as usize;
        self.pages.borrow()[&gfn][offset]
    }

    /// Allocates a fresh top-level page table.
    pub fn new_dtb(&self) -> Dtb {
        Dtb(arch::pa_from_gfn(self.alloc_gfn()))
    }

    /// Maps a 4KB page at `va` in the address space rooted at `dtb`,
    /// creating intermediate tables as needed.
    pub fn map_page(&self, dtb: Dtb, va: Va, gfn: Gfn) {
        let pt = self.walk_tables(dtb, va);
        let index = (va.0 >> 12) & 0x1ff;
        self.write_entry64(pt + index * 8, PageTableEntry((gfn.0 << 12) | 0b11));
        self.insert_page(gfn);
    }

    /// Maps a 2MB large page covering `va`.
    pub fn map_page_2m(&self, dtb: Dtb, va: Va, base_gfn: Gfn) {
        let pml4 = dtb.root();
        let pdpt = self.next_table(pml4, (va.0 >> 39) & 0x1ff);
        let pd = self.next_table(pdpt, (va.0 >> 30) & 0x1ff);
        let index = (va.0 >> 21) & 0x1ff;
        self.write_entry64(
            pd + index * 8,
            PageTableEntry((base_gfn.0 << 12) | (1 << 7) | 0b11),
        );
    }

    /// Removes the present bit of the page table entry covering `va`.
    pub fn unmap_page(&self, dtb: Dtb, va: Va) {
        let pt = self.walk_tables(dtb, va);
        let index = (va.0 >> 12) & 0x1ff;
        self.write_entry64(pt + index * 8, PageTableEntry(0));
    }

    /// Returns the frame mapped at `va`, mapping a fresh one if needed.
    pub fn ensure_mapped(&self, dtb: Dtb, va: Va) -> Gfn {
        let va_page = arch::va_align_down(va);
        let pt = self.walk_tables(dtb, va_page);
        let index = (va_page.0 >> 12) & 0x1ff;
        let entry = self.read_entry64(pt + index * 8);

        if entry.present() {
            return entry.pfn();
        }

        let gfn = self.alloc_gfn();
        self.write_entry64(pt + index * 8, PageTableEntry((gfn.0 << 12) | 0b11));
        gfn
    }

    /// Writes bytes through an address space, mapping pages on demand.
    pub fn write_virtual(&self, dtb: Dtb, va: Va, data: &[u8]) {
        let mut position = 0usize;

        while position < data.len() {
            let address = va + position as u64;
            let gfn = self.ensure_mapped(dtb, address);
            let offset = arch::va_offset(address);

            let size = std::cmp::min(data.len() - position, PAGE - offset as usize);
            self.write_bytes(
                arch::pa_from_gfn(gfn) + offset,
                &data[position..position + size],
            );

            position += size;
        }
    }

    /// Sets the register file of a vCPU.
    pub fn set_vcpu_registers(&self, vcpu: VcpuId, registers: Registers) {
        self.registers.borrow_mut().insert(vcpu, registers);
    }

    /// Sets a model-specific register value.
    pub fn set_msr(&self, vcpu: VcpuId, msr: u32, value: u64) {
        self.msrs.borrow_mut().insert((vcpu, msr), value);
    }

    /// Queues an event for delivery by [`Channel::wait_for_event`].
    pub fn push_event(&self, event: VmEvent) {
        self.events.borrow_mut().push_back(event);
    }

    /// Returns how many times the guest has been resumed.
    pub fn resume_count(&self) -> u32 {
        self.resumes.get()
    }

    /// Returns whether the guest is currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    /// Returns the number of installed breakpoints.
    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.borrow().len()
    }

    /// Returns the vCPUs that have been single-stepped, in order.
    pub fn singlestep_log(&self) -> Vec<VcpuId> {
        self.singlesteps.borrow().clone()
    }

    fn walk_tables(&self, dtb: Dtb, va: Va) -> Pa {
        let pml4 = dtb.root();
        let pdpt = self.next_table(pml4, (va.0 >> 39) & 0x1ff);
        let pd = self.next_table(pdpt, (va.0 >> 30) & 0x1ff);
        self.next_table(pd, (va.0 >> 21) & 0x1ff)
    }

    fn next_table(&self, table: Pa, index: u64) -> Pa {
        let entry_pa = table + index * 8;
        let entry = self.read_entry64(entry_pa);

        if entry.present() {
            return arch::pa_from_gfn(entry.pfn());
        }

        let gfn = self.alloc_gfn();
        self.write_entry64(entry_pa, PageTableEntry((gfn.0 << 12) | 0b11));
        arch::pa_from_gfn(gfn)
    }

    fn read_entry64(&self, pa: Pa) -> PageTableEntry {
        let gfn = arch::gfn_from_pa(pa);
        let offset = arch::pa_offset(pa) as usize;
        self.insert_page(gfn);
        let pages = self.pages.borrow();
        let bytes = &pages[&gfn][offset..offset + 8];
        PageTableEntry(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn write_entry64(&self, pa: Pa, entry: PageTableEntry) {
        self.write_bytes(pa, &entry.0.to_le_bytes());
    }
}

impl Channel for MockChannel {
    fn info(&self) -> Result<VmInfo, VmError> {
        Ok(VmInfo {
            page_size: arch::PAGE_SIZE,
            page_shift: arch::PAGE_SHIFT,
            max_gfn: Gfn(self.next_gfn.get()),
            vcpus: 1,
        })
    }

    fn pause(&self) -> Result<(), VmError> {
        self.paused.set(true);
        Ok(())
    }

    fn resume(&self) -> Result<(), VmError> {
        self.paused.set(false);
        self.resumes.set(self.resumes.get() + 1);
        Ok(())
    }

    fn registers(&self, vcpu: VcpuId) -> Result<Registers, VmError> {
        self.registers
            .borrow()
            .get(&vcpu)
            .copied()
            .ok_or(VmError::Other("no registers for vcpu"))
    }

    fn set_registers(&self, vcpu: VcpuId, registers: Registers) -> Result<(), VmError> {
        self.registers.borrow_mut().insert(vcpu, registers);
        Ok(())
    }

    fn read_msr(&self, vcpu: VcpuId, msr: u32) -> Result<u64, VmError> {
        Ok(self.msrs.borrow().get(&(vcpu, msr)).copied().unwrap_or(0))
    }

    fn write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> Result<(), VmError> {
        self.msrs.borrow_mut().insert((vcpu, msr), value);
        Ok(())
    }

    fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), VmError> {
        let mut position = 0usize;

        while position < buffer.len() {
            let address = pa + position as u64;
            let gfn = arch::gfn_from_pa(address);
            let offset = arch::pa_offset(address) as usize;

            let pages = self.pages.borrow();
            let page = pages
                .get(&gfn)
                .ok_or(VmError::OutOfPhysicalBounds(address))?;

            let size = std::cmp::min(buffer.len() - position, PAGE - offset);
            buffer[position..position + size].copy_from_slice(&page[offset..offset + size]);

            position += size;
        }

        Ok(())
    }

    fn write_physical(&self, pa: Pa, buffer: &[u8]) -> Result<(), VmError> {
        let mut position = 0usize;

        while position < buffer.len() {
            let address = pa + position as u64;
            let gfn = arch::gfn_from_pa(address);
            let offset = arch::pa_offset(address) as usize;

            let mut pages = self.pages.borrow_mut();
            let page = pages
                .get_mut(&gfn)
                .ok_or(VmError::OutOfPhysicalBounds(address))?;

            let size = std::cmp::min(buffer.len() - position, PAGE - offset);
            page[offset..offset + size].copy_from_slice(&buffer[position..position + size]);

            position += size;
        }

        Ok(())
    }

    fn add_breakpoint(&self, pa: Pa, kind: BreakpointKind) -> Result<BreakpointId, VmError> {
        let original = match kind {
            BreakpointKind::SoftExec => {
                let gfn = arch::gfn_from_pa(pa);
                let offset = arch::pa_offset(pa) as usize;

                let mut pages = self.pages.borrow_mut();
                let page = pages.get_mut(&gfn).ok_or(VmError::OutOfPhysicalBounds(pa))?;

                let original = page[offset];
                page[offset] = arch::BREAKPOINT[0];
                original
            }
            _ => 0,
        };

        let id = BreakpointId(self.next_breakpoint.get());
        self.next_breakpoint.set(id.0 + 1);

        self.breakpoints
            .borrow_mut()
            .insert(id, MockBreakpoint { pa, kind, original });

        Ok(id)
    }

    fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), VmError> {
        let breakpoint = self
            .breakpoints
            .borrow_mut()
            .remove(&id)
            .ok_or(VmError::UnknownBreakpoint)?;

        if breakpoint.kind == BreakpointKind::SoftExec {
            let gfn = arch::gfn_from_pa(breakpoint.pa);
            let offset = arch::pa_offset(breakpoint.pa) as usize;

            let mut pages = self.pages.borrow_mut();
            if let Some(page) = pages.get_mut(&gfn) {
                page[offset] = breakpoint.original;
            }
        }

        Ok(())
    }

    fn singlestep(&self, vcpu: VcpuId) -> Result<(), VmError> {
        self.singlesteps.borrow_mut().push(vcpu);
        Ok(())
    }

    fn wait_for_event(&self, _timeout: Duration) -> Result<VmEvent, VmError> {
        match self.events.borrow_mut().pop_front() {
            Some(event) => {
                // The counterpart pauses all vCPUs before publishing.
                self.paused.set(true);
                Ok(event)
            }
            None => Err(VmError::Timeout),
        }
    }
}
