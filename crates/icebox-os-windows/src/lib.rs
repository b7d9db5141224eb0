//! Windows/NT guest model.
//!
//! Identifies the kernel from a paused vCPU (IDT handlers anchor the
//! downward MZ scan), loads its symbol module by CodeView identity, and
//! reconstructs processes, threads, modules and drivers by walking the
//! kernel structures through per-process readers.

mod error;
mod iter;
mod offsets;
mod pe;

#[cfg(test)]
mod windows_tests;

use std::rc::Rc;

use icebox_core::{
    arch::{self, IdtEntry64, PagingMode, Registers},
    os::{
        Driver, DriverObject, GuestOs, Module, ModuleObject, OsArchitecture, Process, ProcessId,
        ProcessObject, Thread, ThreadId, ThreadObject,
    },
    Channel, Dtb, Reader, Session, ThreadResolver, Va, Vm, VmError,
};
use icebox_symbols::{CodeView, ModuleId, SymbolError, SymbolModule, SymbolStore};

pub use self::error::WindowsError;
use self::{
    offsets::{KernelSymbols, Offsets},
    pe::PeImage,
};

/// Maximum distance between the IDT handlers and the kernel image base.
const MAX_KERNEL_SEARCH: u64 = 32 * 1024 * 1024;

/// Start of the canonical kernel half of the address space.
const KERNEL_SPACE: u64 = 0xFFFF_8000_0000_0000;

/// Bound on `UNICODE_STRING` reads.
const MAX_UNICODE_CHARS: usize = 256;

/// The kernel image found by the identification scan.
#[derive(Debug, Clone)]
pub struct WindowsKernelInfo {
    /// The image base address.
    pub base: Va,

    /// The PDB reference extracted from the image.
    pub codeview: CodeView,
}

/// Locates the NT kernel image.
///
/// The IDT handlers live inside the kernel image, so the scan starts at the
/// IDT[0] gate target and walks pages downward until an `MZ` header with a
/// CodeView record appears. Unmapped pages are skipped.
pub fn find_kernel<C>(vm: &Vm<C>, registers: &Registers) -> Result<WindowsKernelInfo, VmError>
where
    C: Channel,
{
    let reader = vm.reader(registers, registers.dtb());

    let gate: IdtEntry64 = reader.read_struct(Va(registers.idtr.base))?;
    let anchor = arch::va_align_down(Va(gate.handler()));

    if anchor.0 < KERNEL_SPACE {
        return Err(WindowsError::KernelNotFound.into());
    }

    let mut magic = [0u8; 2];

    for va in (anchor.0 - MAX_KERNEL_SEARCH..=anchor.0)
        .rev()
        .step_by(arch::PAGE_SIZE as usize)
    {
        let base = Va(va);

        match reader.read(base, &mut magic) {
            Ok(()) => {}
            Err(VmError::Translation(_)) => continue,
            Err(err) => return Err(err),
        }

        if &magic != b"MZ" {
            continue;
        }

        tracing::debug!(%base, "found MZ");

        let image = match PeImage::parse(&reader, base) {
            Ok(image) => image,
            Err(_) => continue,
        };

        match image.codeview(&reader) {
            Ok(Some(codeview)) => {
                tracing::debug!(%base, name = %codeview.name, "kernel identified");
                return Ok(WindowsKernelInfo { base, codeview });
            }
            Ok(None) => tracing::warn!(%base, "PE image without CodeView"),
            Err(err) => tracing::warn!(%base, %err, "failed to read CodeView"),
        }
    }

    Err(WindowsError::KernelNotFound.into())
}

/// The Windows guest backend.
pub struct WindowsOs<C>
where
    C: Channel,
{
    kernel_base: Va,
    kernel_dtb: Dtb,
    codeview: CodeView,
    symbols: Rc<SymbolModule>,
    syms: KernelSymbols,
    offsets: Offsets,
    store: Rc<SymbolStore>,
    _marker: std::marker::PhantomData<C>,
}

impl<C> WindowsOs<C>
where
    C: Channel,
{
    /// Identifies the kernel on a paused guest and loads its symbols from
    /// the store.
    pub fn new(vm: &Vm<C>, registers: &Registers, store: Rc<SymbolStore>) -> Result<Self, VmError> {
        let kernel = find_kernel(vm, registers)?;

        let id = ModuleId::new(&kernel.codeview.name, &kernel.codeview.identity);
        let symbols = store
            .module(&id)
            .map_err(|err| VmError::Symbol(Box::new(err)))?;

        Self::with_kernel(kernel.base, registers.dtb(), kernel.codeview, symbols, store)
    }

    /// Builds the backend from an already-identified kernel.
    pub fn with_kernel(
        kernel_base: Va,
        kernel_dtb: Dtb,
        codeview: CodeView,
        symbols: Rc<SymbolModule>,
        store: Rc<SymbolStore>,
    ) -> Result<Self, VmError> {
        let syms = KernelSymbols::load(&symbols).map_err(VmError::from)?;
        let offsets = Offsets::load(&symbols).map_err(VmError::from)?;

        Ok(Self {
            kernel_base,
            kernel_dtb,
            codeview,
            symbols,
            syms,
            offsets,
            store,
            _marker: std::marker::PhantomData,
        })
    }

    /// Returns the CodeView identity of the kernel.
    pub fn kernel_codeview(&self) -> &CodeView {
        &self.codeview
    }

    /// Returns the kernel's directory table.
    pub fn kernel_dtb(&self) -> Dtb {
        self.kernel_dtb
    }

    /// Returns the address of the system-call entry point.
    ///
    /// On an unhooked guest this equals `MSR_LSTAR`, which makes it a cheap
    /// cross-check of the identified image base.
    pub fn syscall_entry(&self) -> Va {
        self.kernel_base + self.syms.ki_system_call64
    }

    /// Returns the `System` process (`PsInitialSystemProcess`).
    pub fn system_process(&self, vm: &Vm<C>) -> Result<Process, VmError> {
        let reader = self.kernel_reader(vm);
        let object = reader.read_ptr(self.kernel_base + self.syms.ps_initial_system_process)?;
        self.read_process(vm, ProcessObject(object))
    }

    /// Installs this backend as the session's thread resolver, so
    /// thread-filtered breakpoints compare against the executing `ETHREAD`.
    pub fn install_thread_resolver(self: &Rc<Self>, session: &Session<C>) {
        let os = self.clone();
        let resolver: ThreadResolver<C> = Box::new(move |vm, event| {
            os.current_thread(vm, event.registers())
                .map(|thread| thread.object)
                .ok()
        });
        session.set_thread_resolver(resolver);
    }

    fn kernel_reader<'a>(&self, vm: &'a Vm<C>) -> Reader<'a, C> {
        Reader::new(vm, self.kernel_dtb, PagingMode::Ia32e)
    }

    fn read_unicode_string(
        &self,
        reader: &Reader<'_, C>,
        va: Va,
    ) -> Result<String, VmError> {
        let length = reader.read_u16(va + self.offsets.unicode_string.length)? as usize;
        let buffer = reader.read_ptr(va + self.offsets.unicode_string.buffer)?;

        if buffer.is_null() || length == 0 {
            return Ok(String::new());
        }

        reader.read_utf16(buffer, std::cmp::min(length / 2, MAX_UNICODE_CHARS))
    }

    fn read_process(&self, vm: &Vm<C>, object: ProcessObject) -> Result<Process, VmError> {
        let reader = self.kernel_reader(vm);
        let base = object.va();

        let id = reader.read_u64(base + self.offsets.eprocess.unique_process_id)?;
        let parent_id =
            reader.read_u64(base + self.offsets.eprocess.inherited_from_unique_process_id)?;

        let mut name = [0u8; 15];
        reader.read(base + self.offsets.eprocess.image_file_name, &mut name)?;
        let name = String::from_utf8_lossy(&name)
            .trim_end_matches('\0')
            .to_string();

        let dtb = Dtb::from_cr3(
            reader.read_u64(base + self.offsets.kprocess.directory_table_base)?,
        );

        let peb = reader.read_ptr(base + self.offsets.eprocess.peb)?;
        let wow64 = reader.read_ptr(base + self.offsets.eprocess.wow64_process)?;

        Ok(Process {
            object,
            id: ProcessId(id),
            parent_id: ProcessId(parent_id),
            name,
            dtb,
            user: !peb.is_null(),
            arch: if wow64.is_null() {
                OsArchitecture::Amd64
            }
            else {
                OsArchitecture::X86
            },
        })
    }

    fn ldr_module(
        &self,
        reader: &Reader<'_, C>,
        link: Va,
    ) -> Result<(Va, u64, String), VmError> {
        let entry = link - self.offsets.ldr_entry.in_load_order_links;

        let base = reader.read_ptr(entry + self.offsets.ldr_entry.dll_base)?;
        let size = reader.read_u32(entry + self.offsets.ldr_entry.size_of_image)? as u64;
        let name =
            self.read_unicode_string(reader, entry + self.offsets.ldr_entry.base_dll_name)?;

        Ok((base, size, name))
    }

    fn is_kernel_module(&self, module: &str) -> bool {
        module.eq_ignore_ascii_case("nt")
            || module.eq_ignore_ascii_case("ntoskrnl.exe")
            || module.eq_ignore_ascii_case(&self.codeview.name)
    }

    fn module_symbols(
        &self,
        reader: &Reader<'_, C>,
        base: Va,
        symbol: &str,
    ) -> Result<Option<Va>, VmError> {
        let image = PeImage::parse(reader, base)?;

        // Prefer full debug symbols keyed by the image's CodeView identity.
        if let Some(codeview) = image.codeview(reader)? {
            let id = ModuleId::new(&codeview.name, &codeview.identity);
            match self.store.module(&id) {
                Ok(module) => {
                    if let Some(offset) = module.symbol_offset(symbol) {
                        return Ok(Some(base + offset));
                    }
                }
                Err(SymbolError::MissingModule { .. }) => {
                    tracing::debug!(%id, "no debug file cached, falling back to exports");
                }
                Err(err) => return Err(VmError::Symbol(Box::new(err))),
            }
        }

        // Exported symbols cover the common interception targets.
        Ok(image
            .exports(reader)?
            .into_iter()
            .find(|(name, _)| name == symbol)
            .map(|(_, va)| va))
    }
}

impl<C> GuestOs<C> for WindowsOs<C>
where
    C: Channel,
{
    fn kernel_image_base(&self) -> Va {
        self.kernel_base
    }

    fn kernel_information_string(&self, vm: &Vm<C>) -> Result<String, VmError> {
        let reader = self.kernel_reader(vm);
        reader.read_cstring(self.kernel_base + self.syms.nt_build_lab, 256)
    }

    fn processes(&self, vm: &Vm<C>) -> Result<Vec<Process>, VmError> {
        let reader = self.kernel_reader(vm);
        let head = self.kernel_base + self.syms.ps_active_process_head;

        let mut processes = Vec::new();
        let links_offset = self.offsets.eprocess.active_process_links;

        iter::walk_list(&reader, head, self.offsets.list.flink, |link| {
            let object = ProcessObject(link - links_offset);
            processes.push(self.read_process(vm, object)?);
            Ok(true)
        })?;

        Ok(processes)
    }

    fn current_thread(&self, vm: &Vm<C>, registers: &Registers) -> Result<Thread, VmError> {
        let kpcr = registers.kernel_gs_base();

        if kpcr.0 < KERNEL_SPACE {
            return Err(WindowsError::CurrentThreadUndetermined.into());
        }

        let reader = self.kernel_reader(vm);

        let prcb = kpcr + self.offsets.kpcr.prcb;
        let thread = reader.read_ptr(prcb + self.offsets.kprcb.current_thread)?;

        if thread.is_null() {
            return Err(WindowsError::CurrentThreadUndetermined.into());
        }

        let process = reader.read_ptr(
            thread + self.offsets.kthread.apc_state + self.offsets.kapc_state.process,
        )?;
        let id = reader.read_u64(
            thread + self.offsets.ethread.cid + self.offsets.client_id.unique_thread,
        )?;

        Ok(Thread {
            object: ThreadObject(thread),
            id: ThreadId(id),
            process: ProcessObject(process),
        })
    }

    fn current_process(&self, vm: &Vm<C>, registers: &Registers) -> Result<Process, VmError> {
        let thread = self.current_thread(vm, registers)?;
        self.read_process(vm, thread.process)
    }

    fn modules(&self, vm: &Vm<C>, process: &Process) -> Result<Vec<Module>, VmError> {
        let kernel_reader = self.kernel_reader(vm);
        let peb = kernel_reader.read_ptr(process.object.va() + self.offsets.eprocess.peb)?;

        if peb.is_null() {
            return Ok(Vec::new());
        }

        let reader = self.reader(vm, process);
        let ldr = reader.read_ptr(peb + self.offsets.peb.ldr)?;

        if ldr.is_null() {
            return Ok(Vec::new());
        }

        let head = ldr + self.offsets.peb_ldr_data.in_load_order_module_list;
        let mut modules = Vec::new();

        iter::walk_list(&reader, head, self.offsets.list.flink, |link| {
            let (base, size, name) = self.ldr_module(&reader, link)?;
            modules.push(Module {
                object: ModuleObject(link - self.offsets.ldr_entry.in_load_order_links),
                base,
                size,
                name,
            });
            Ok(true)
        })?;

        Ok(modules)
    }

    fn drivers(&self, vm: &Vm<C>) -> Result<Vec<Driver>, VmError> {
        let reader = self.kernel_reader(vm);
        let head = self.kernel_base + self.syms.ps_loaded_module_list;

        let mut drivers = Vec::new();

        iter::walk_list(&reader, head, self.offsets.list.flink, |link| {
            let (base, size, name) = self.ldr_module(&reader, link)?;
            drivers.push(Driver {
                object: DriverObject(link - self.offsets.ldr_entry.in_load_order_links),
                base,
                size,
                name,
            });
            Ok(true)
        })?;

        Ok(drivers)
    }

    fn reader<'a>(&self, vm: &'a Vm<C>, process: &Process) -> Reader<'a, C> {
        let reader = Reader::new(vm, process.dtb, PagingMode::Ia32e);
        match process.arch {
            OsArchitecture::X86 => reader.with_address_width(4),
            _ => reader,
        }
    }

    fn function_argument(
        &self,
        vm: &Vm<C>,
        registers: &Registers,
        index: u64,
    ) -> Result<u64, VmError> {
        let reader = vm.reader(registers, registers.dtb());

        if registers.cs.access.long_mode() {
            match index {
                0 => Ok(registers.rcx),
                1 => Ok(registers.rdx),
                2 => Ok(registers.r8),
                3 => Ok(registers.r9),
                _ => {
                    let stack = registers.rsp + (index + 1) * size_of::<u64>() as u64;
                    reader.read_u64(Va(stack))
                }
            }
        }
        else {
            let stack = registers.rsp + (index + 1) * size_of::<u32>() as u64;
            Ok(reader.read_u32(Va(stack))? as u64)
        }
    }

    fn set_function_argument(
        &self,
        vm: &Vm<C>,
        registers: &mut Registers,
        index: u64,
        value: u64,
    ) -> Result<(), VmError> {
        let reader = vm.reader(registers, registers.dtb());

        if registers.cs.access.long_mode() {
            match index {
                0 => registers.rcx = value,
                1 => registers.rdx = value,
                2 => registers.r8 = value,
                3 => registers.r9 = value,
                _ => {
                    let stack = registers.rsp + (index + 1) * size_of::<u64>() as u64;
                    reader.write_u64(Va(stack), value)?;
                }
            }
        }
        else {
            let stack = registers.rsp + (index + 1) * size_of::<u32>() as u64;
            reader.write_u32(Va(stack), value as u32)?;
        }

        Ok(())
    }

    fn return_address(&self, vm: &Vm<C>, registers: &Registers) -> Result<Va, VmError> {
        let reader = vm.reader(registers, registers.dtb());
        reader
            .with_address_width(registers.effective_address_width())
            .read_ptr(registers.stack_pointer())
    }

    fn resolve_symbol(
        &self,
        vm: &Vm<C>,
        process: &Process,
        module: &str,
        symbol: &str,
    ) -> Result<Va, VmError> {
        if self.is_kernel_module(module) {
            let offset = self.symbols.symbol_offset(symbol).ok_or_else(|| {
                VmError::Symbol(Box::new(SymbolError::MissingSymbol {
                    module: module.to_string(),
                    symbol: symbol.to_string(),
                }))
            })?;
            return Ok(self.kernel_base + offset);
        }

        let target = self
            .modules(vm, process)?
            .into_iter()
            .find(|m| {
                m.name.eq_ignore_ascii_case(module)
                    || m.name
                        .to_ascii_lowercase()
                        .strip_suffix(".dll")
                        .is_some_and(|stem| stem.eq_ignore_ascii_case(module))
            })
            .ok_or_else(|| VmError::from(WindowsError::ModuleNotFound(module.to_string())))?;

        let reader = self.reader(vm, process);

        match self.module_symbols(&reader, target.base, symbol)? {
            Some(va) => Ok(va),
            None => Err(VmError::Symbol(Box::new(SymbolError::MissingSymbol {
                module: module.to_string(),
                symbol: symbol.to_string(),
            }))),
        }
    }
}
