use std::{
    cell::{Cell, RefCell},
    num::NonZeroUsize,
    time::Duration,
};

use lru::LruCache;

use crate::{
    arch::{self, PagingMode, PhysicalRead, Registers},
    BreakpointId, BreakpointKind, Channel, Dtb, Pa, Reader, Va, VcpuId, VmError, VmEvent, VmInfo,
};

/// Size of the virtual-to-physical translation cache, in page entries.
const V2P_CACHE_SIZE: usize = 8192;

/// The memory and register facade over an attached channel.
///
/// `Vm` owns the channel and layers chunked physical access, page-table
/// translation with a small cache, and reader construction on top of it.
/// The translation cache is only valid while the guest is paused; it is
/// flushed on every resume.
pub struct Vm<C>
where
    C: Channel,
{
    channel: C,
    v2p: RefCell<LruCache<(Va, Dtb), Pa>>,
    generation: Cell<u64>,
}

impl<C> Vm<C>
where
    C: Channel,
{
    /// Wraps a channel.
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            v2p: RefCell::new(LruCache::new(NonZeroUsize::new(V2P_CACHE_SIZE).unwrap())),
            generation: Cell::new(0),
        }
    }

    /// Returns the underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Returns static information about the virtual machine.
    pub fn info(&self) -> Result<VmInfo, VmError> {
        self.channel.info()
    }

    /// Returns the registers of a specific virtual CPU.
    pub fn registers(&self, vcpu: VcpuId) -> Result<Registers, VmError> {
        self.channel.registers(vcpu)
    }

    /// Sets the registers of a specific virtual CPU.
    pub fn set_registers(&self, vcpu: VcpuId, registers: Registers) -> Result<(), VmError> {
        self.channel.set_registers(vcpu, registers)
    }

    /// Reads a model-specific register.
    pub fn read_msr(&self, vcpu: VcpuId, msr: u32) -> Result<u64, VmError> {
        self.channel.read_msr(vcpu, msr)
    }

    /// Writes a model-specific register.
    pub fn write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> Result<(), VmError> {
        self.channel.write_msr(vcpu, msr, value)
    }

    /// Reads guest physical memory.
    pub fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), VmError> {
        self.channel.read_physical(pa, buffer)
    }

    /// Writes guest physical memory.
    pub fn write_physical(&self, pa: Pa, buffer: &[u8]) -> Result<(), VmError> {
        self.channel.write_physical(pa, buffer)
    }

    /// Installs a breakpoint at a physical address.
    pub fn add_breakpoint(&self, pa: Pa, kind: BreakpointKind) -> Result<BreakpointId, VmError> {
        self.channel.add_breakpoint(pa, kind)
    }

    /// Removes a previously installed breakpoint.
    pub fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), VmError> {
        self.channel.remove_breakpoint(id)
    }

    /// Blocks until the guest reports an event or the timeout elapses.
    pub fn wait_for_event(&self, timeout: Duration) -> Result<VmEvent, VmError> {
        self.channel.wait_for_event(timeout)
    }

    /// Translates a virtual address through the page tables rooted at `dtb`.
    ///
    /// Translations are cached with page granularity until
    /// [`flush_translation_cache`] is called.
    ///
    /// [`flush_translation_cache`]: Self::flush_translation_cache
    pub fn translate(&self, va: Va, dtb: Dtb, mode: PagingMode) -> Result<Pa, VmError> {
        let va_page = arch::va_align_down(va);
        let offset = arch::va_offset(va);

        if let Some(pa_page) = self.v2p.borrow_mut().get(&(va_page, dtb)) {
            return Ok(*pa_page + offset);
        }

        let pa_page = arch::translate(self, va_page, dtb, mode)?;
        self.v2p.borrow_mut().put((va_page, dtb), pa_page);

        Ok(pa_page + offset)
    }

    /// Drops every cached translation.
    ///
    /// Must be called whenever the guest has had a chance to run: the guest
    /// kernel is free to rewrite its page tables between pauses.
    pub fn flush_translation_cache(&self) {
        self.v2p.borrow_mut().clear();
        self.generation.set(self.generation.get() + 1);
    }

    /// A counter bumped on every cache flush; readers use it to invalidate
    /// their private TLB slot.
    pub(crate) fn translation_generation(&self) -> u64 {
        self.generation.get()
    }

    /// Creates a reader over the address space rooted at `dtb`.
    ///
    /// The paging mode and pointer width are taken from the given register
    /// state.
    pub fn reader(&self, registers: &Registers, dtb: Dtb) -> Reader<'_, C> {
        let mode = registers.paging_mode().unwrap_or(PagingMode::Ia32e);
        Reader::new(self, dtb, mode)
    }
}

impl<C> PhysicalRead for Vm<C>
where
    C: Channel,
{
    fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), VmError> {
        self.channel.read_physical(pa, buffer)
    }
}
