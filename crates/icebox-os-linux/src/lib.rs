//! Linux guest model.
//!
//! Identifies the kernel by its `Linux version` banner and GNU build-id,
//! loads the matching `vmlinux` symbols, and reconstructs tasks, address
//! spaces and modules from the kernel structures. KASLR is undone by
//! comparing `MSR_LSTAR` with the linked address of `entry_SYSCALL_64`.

mod error;
mod offsets;

#[cfg(test)]
mod linux_tests;

use std::rc::Rc;

use icebox_core::{
    arch::{self, PagingMode, Registers},
    os::{
        Driver, DriverObject, GuestOs, Module, ModuleObject, OsArchitecture, Process, ProcessId,
        ProcessObject, Thread, ThreadId, ThreadObject,
    },
    Channel, Dtb, Reader, Session, ThreadResolver, Va, Vm, VmError,
};
use icebox_symbols::{ModuleId, SymbolError, SymbolModule, SymbolStore};

pub use self::error::LinuxError;
use self::offsets::{KernelSymbols, Offsets};

/// Search distance around `MSR_LSTAR` for the banner and build-id scans.
const MAX_KERNEL_SCAN: u64 = 16 * 1024 * 1024;

/// Start of the canonical kernel half of the address space.
const KERNEL_SPACE: u64 = 0xFFFF_8000_0000_0000;

/// Longest list the walkers will follow before declaring corruption.
const MAX_LIST_ENTRIES: usize = 1 << 20;

/// `task_struct::comm` is a fixed 16-byte buffer.
const TASK_COMM_LEN: usize = 16;

/// `module::name` is a fixed 56-byte buffer on 64-bit kernels.
const MODULE_NAME_LEN: usize = 56;

/// Scans kernel pages around the syscall entry for the `Linux version`
/// banner.
pub fn find_banner<C>(vm: &Vm<C>, registers: &Registers) -> Result<Option<String>, VmError>
where
    C: Channel,
{
    const SIGNATURE: &[u8] = b"Linux version ";

    let reader = vm.reader(registers, registers.dtb());
    let lstar = registers.msr_lstar & arch::PAGE_MASK;

    let mut data = [0u8; arch::PAGE_SIZE as usize];

    for va in (lstar - MAX_KERNEL_SCAN..=lstar + MAX_KERNEL_SCAN)
        .rev()
        .step_by(arch::PAGE_SIZE as usize)
    {
        match reader.read(Va(va), &mut data) {
            Ok(()) => {}
            Err(VmError::Translation(_)) => continue,
            Err(err) => return Err(err),
        }

        for index in memchr::memmem::find_iter(&data, SIGNATURE) {
            let banner = &data[index..];

            let banner = match memchr::memmem::find(banner, b"\n") {
                Some(end) => &banner[..end],
                None => continue,
            };

            tracing::debug!(va = %Va(va + index as u64), "found banner");
            return Ok(Some(String::from_utf8_lossy(banner).into()));
        }
    }

    Ok(None)
}

/// Scans kernel pages around the syscall entry for the GNU build-id note.
///
/// The note header is fixed for a 20-byte SHA-1 build-id: name size 4, desc
/// size 20, type `NT_GNU_BUILD_ID`, name `"GNU\0"`.
pub fn find_build_id<C>(vm: &Vm<C>, registers: &Registers) -> Result<Option<String>, VmError>
where
    C: Channel,
{
    const NOTE_HEADER: &[u8] = &[
        0x04, 0x00, 0x00, 0x00, // namesz
        0x14, 0x00, 0x00, 0x00, // descsz
        0x03, 0x00, 0x00, 0x00, // NT_GNU_BUILD_ID
        b'G', b'N', b'U', 0x00,
    ];

    let reader = vm.reader(registers, registers.dtb());
    let lstar = registers.msr_lstar & arch::PAGE_MASK;

    let mut data = [0u8; arch::PAGE_SIZE as usize];

    for va in (lstar - MAX_KERNEL_SCAN..=lstar + MAX_KERNEL_SCAN)
        .rev()
        .step_by(arch::PAGE_SIZE as usize)
    {
        match reader.read(Va(va), &mut data) {
            Ok(()) => {}
            Err(VmError::Translation(_)) => continue,
            Err(err) => return Err(err),
        }

        for index in memchr::memmem::find_iter(&data, NOTE_HEADER) {
            let start = index + NOTE_HEADER.len();
            if start + 20 > data.len() {
                continue;
            }

            let mut hex = String::with_capacity(40);
            for byte in &data[start..start + 20] {
                hex.push_str(&format!("{byte:02x}"));
            }

            tracing::debug!(va = %Va(va + index as u64), build_id = %hex, "found build-id");
            return Ok(Some(hex));
        }
    }

    Ok(None)
}

/// The Linux guest backend.
pub struct LinuxOs<C>
where
    C: Channel,
{
    kaslr_offset: u64,
    kernel_base: Va,
    kernel_dtb: Dtb,
    symbols: Rc<SymbolModule>,
    syms: KernelSymbols,
    offsets: Offsets,
    _marker: std::marker::PhantomData<C>,
}

impl<C> LinuxOs<C>
where
    C: Channel,
{
    /// Identifies the kernel on a paused guest and loads its symbols from
    /// the store under `<root>/<build-id>/debug`.
    pub fn new(vm: &Vm<C>, registers: &Registers, store: Rc<SymbolStore>) -> Result<Self, VmError> {
        if let Some(banner) = find_banner(vm, registers)? {
            tracing::info!(%banner, "identified Linux guest");
        }

        let build_id = find_build_id(vm, registers)?
            .ok_or_else(|| VmError::from(LinuxError::BuildIdNotFound))?;

        let symbols = store
            .module(&ModuleId::new("vmlinux", &build_id))
            .map_err(|err| VmError::Symbol(Box::new(err)))?;

        Self::with_profile(registers, symbols)
    }

    /// Builds the backend from an already-loaded `vmlinux` symbol module.
    ///
    /// The KASLR slide is recovered from `MSR_LSTAR`.
    pub fn with_profile(registers: &Registers, symbols: Rc<SymbolModule>) -> Result<Self, VmError> {
        let syms = KernelSymbols::load(&symbols).map_err(VmError::from)?;
        let offsets = Offsets::load(&symbols).map_err(VmError::from)?;

        let kaslr_offset = registers.msr_lstar.wrapping_sub(syms.entry_syscall_64);
        let kernel_base = Va(syms.text.wrapping_add(kaslr_offset));

        tracing::debug!(kaslr_offset = %icebox_core::Hex(kaslr_offset), %kernel_base, "vmlinux mapped");

        Ok(Self {
            kaslr_offset,
            kernel_base,
            kernel_dtb: registers.dtb(),
            symbols,
            syms,
            offsets,
            _marker: std::marker::PhantomData,
        })
    }

    /// Returns the KASLR slide.
    pub fn kaslr_offset(&self) -> u64 {
        self.kaslr_offset
    }

    /// Installs this backend as the session's thread resolver, so
    /// thread-filtered breakpoints compare against the executing
    /// `task_struct`.
    pub fn install_thread_resolver(self: &Rc<Self>, session: &Session<C>) {
        let os = self.clone();
        let resolver: ThreadResolver<C> = Box::new(move |vm, event| {
            os.current_thread(vm, event.registers())
                .map(|thread| thread.object)
                .ok()
        });
        session.set_thread_resolver(resolver);
    }

    /// Relocates a linked `vmlinux` address by the KASLR slide.
    fn va_of(&self, linked: u64) -> Va {
        Va(linked.wrapping_add(self.kaslr_offset))
    }

    fn kernel_reader<'a>(&self, vm: &'a Vm<C>) -> Reader<'a, C> {
        Reader::new(vm, self.kernel_dtb, PagingMode::Ia32e)
    }

    fn walk_list(
        &self,
        reader: &Reader<'_, C>,
        head: Va,
        mut callback: impl FnMut(Va) -> Result<bool, VmError>,
    ) -> Result<(), VmError> {
        let next = self.offsets.list.next;
        let mut entry = reader.read_ptr(head + next)?;

        for _ in 0..MAX_LIST_ENTRIES {
            if entry == head || entry.is_null() {
                return Ok(());
            }

            if !callback(entry)? {
                return Ok(());
            }

            entry = reader.read_ptr(entry + next)?;
        }

        Err(LinuxError::CorruptTaskList(head).into())
    }

    fn read_task(&self, vm: &Vm<C>, task: Va) -> Result<Process, VmError> {
        let reader = self.kernel_reader(vm);

        let tgid = reader.read_u32(task + self.offsets.task.tgid)? as u64;

        let mut comm = [0u8; TASK_COMM_LEN];
        reader.read(task + self.offsets.task.comm, &mut comm)?;
        let name = String::from_utf8_lossy(&comm)
            .trim_end_matches('\0')
            .to_string();

        let parent = reader.read_ptr(task + self.offsets.task.real_parent)?;
        let parent_id = if parent.is_null() || parent == task {
            0
        }
        else {
            reader.read_u32(parent + self.offsets.task.tgid)? as u64
        };

        let mm = reader.read_ptr(task + self.offsets.task.mm)?;

        let (dtb, user) = if mm.is_null() {
            // Kernel thread: it runs on whatever address space it borrowed.
            let active = reader.read_ptr(task + self.offsets.task.active_mm)?;
            if active.is_null() {
                (self.kernel_dtb, false)
            }
            else {
                (self.dtb_of(&reader, active)?, false)
            }
        }
        else {
            (self.dtb_of(&reader, mm)?, true)
        };

        Ok(Process {
            object: ProcessObject(task),
            id: ProcessId(tgid),
            parent_id: ProcessId(parent_id),
            name,
            dtb,
            user,
            arch: OsArchitecture::Amd64,
        })
    }

    /// Resolves an `mm_struct` to its directory table root: `pgd` is a
    /// kernel virtual address, its physical page is the root.
    fn dtb_of(&self, reader: &Reader<'_, C>, mm: Va) -> Result<Dtb, VmError> {
        let pgd = reader.read_ptr(mm + self.offsets.mm.pgd)?;
        let root = reader.translate(pgd)?;
        Ok(Dtb(root & arch::PAGE_MASK))
    }

    fn dentry_name(&self, reader: &Reader<'_, C>, file: Va) -> Result<String, VmError> {
        let dentry = reader.read_ptr(file + self.offsets.file.f_path + self.offsets.path.dentry)?;
        if dentry.is_null() {
            return Ok(String::new());
        }

        let name = reader.read_ptr(dentry + self.offsets.dentry.d_name + self.offsets.qstr.name)?;
        if name.is_null() {
            return Ok(String::new());
        }

        reader.read_cstring(name, 256)
    }
}

impl<C> GuestOs<C> for LinuxOs<C>
where
    C: Channel,
{
    fn kernel_image_base(&self) -> Va {
        self.kernel_base
    }

    fn kernel_information_string(&self, vm: &Vm<C>) -> Result<String, VmError> {
        let reader = self.kernel_reader(vm);
        reader.read_cstring(self.va_of(self.syms.linux_banner), 256)
    }

    fn processes(&self, vm: &Vm<C>) -> Result<Vec<Process>, VmError> {
        let reader = self.kernel_reader(vm);

        let init_task = self.va_of(self.syms.init_task);
        let head = init_task + self.offsets.task.tasks;

        let mut processes = vec![self.read_task(vm, init_task)?];

        self.walk_list(&reader, head, |entry| {
            let task = entry - self.offsets.task.tasks;
            processes.push(self.read_task(vm, task)?);
            Ok(true)
        })?;

        Ok(processes)
    }

    fn current_thread(&self, vm: &Vm<C>, registers: &Registers) -> Result<Thread, VmError> {
        let per_cpu = registers.kernel_gs_base();

        if per_cpu.0 < KERNEL_SPACE {
            return Err(LinuxError::CurrentTaskUndetermined.into());
        }

        let reader = self.kernel_reader(vm);

        // `current_task` is a per-CPU variable; its symbol value is the
        // offset within the per-CPU area, not a relocated address.
        let task = reader.read_ptr(per_cpu + self.syms.current_task)?;

        if task.is_null() {
            return Err(LinuxError::CurrentTaskUndetermined.into());
        }

        let id = reader.read_u32(task + self.offsets.task.pid)? as u64;
        let leader = reader.read_ptr(task + self.offsets.task.group_leader)?;

        Ok(Thread {
            object: ThreadObject(task),
            id: ThreadId(id),
            process: ProcessObject(if leader.is_null() { task } else { leader }),
        })
    }

    fn current_process(&self, vm: &Vm<C>, registers: &Registers) -> Result<Process, VmError> {
        let thread = self.current_thread(vm, registers)?;
        self.read_task(vm, thread.process.va())
    }

    fn modules(&self, vm: &Vm<C>, process: &Process) -> Result<Vec<Module>, VmError> {
        if !process.user {
            return Ok(Vec::new());
        }

        let reader = self.kernel_reader(vm);

        let mm = reader.read_ptr(process.object.va() + self.offsets.task.mm)?;
        if mm.is_null() {
            return Ok(Vec::new());
        }

        let mut modules: Vec<Module> = Vec::new();
        let mut current_file = Va(0);

        let mut vma = reader.read_ptr(mm + self.offsets.mm.mmap)?;

        for _ in 0..MAX_LIST_ENTRIES {
            if vma.is_null() {
                break;
            }

            let start = reader.read_ptr(vma + self.offsets.vma.vm_start)?;
            let end = reader.read_ptr(vma + self.offsets.vma.vm_end)?;
            let file = reader.read_ptr(vma + self.offsets.vma.vm_file)?;

            if !file.is_null() {
                if file == current_file {
                    // Contiguous mapping of the same file: extend.
                    if let Some(last) = modules.last_mut() {
                        last.size = end.0 - last.base.0;
                    }
                }
                else {
                    modules.push(Module {
                        object: ModuleObject(vma),
                        base: start,
                        size: end.0 - start.0,
                        name: self.dentry_name(&reader, file)?,
                    });
                    current_file = file;
                }
            }

            vma = reader.read_ptr(vma + self.offsets.vma.vm_next)?;
        }

        Ok(modules)
    }

    fn drivers(&self, vm: &Vm<C>) -> Result<Vec<Driver>, VmError> {
        let reader = self.kernel_reader(vm);
        let head = self.va_of(self.syms.modules);

        let mut drivers = Vec::new();

        self.walk_list(&reader, head, |entry| {
            let module = entry - self.offsets.module.list;

            let mut name = [0u8; MODULE_NAME_LEN];
            reader.read(module + self.offsets.module.name, &mut name)?;
            let name = String::from_utf8_lossy(&name)
                .trim_end_matches('\0')
                .to_string();

            let (base, size) = match self.offsets.module_core_layout {
                Some(core_layout) => {
                    let base = reader.read_ptr(module + core_layout)?;
                    let size = reader.read_u32(module + core_layout + 8)? as u64;
                    (base, size)
                }
                None => (Va(0), 0),
            };

            drivers.push(Driver {
                object: DriverObject(module),
                base,
                size,
                name,
            });
            Ok(true)
        })?;

        Ok(drivers)
    }

    fn reader<'a>(&self, vm: &'a Vm<C>, process: &Process) -> Reader<'a, C> {
        Reader::new(vm, process.dtb, PagingMode::Ia32e)
    }

    fn function_argument(
        &self,
        vm: &Vm<C>,
        registers: &Registers,
        index: u64,
    ) -> Result<u64, VmError> {
        match index {
            0 => Ok(registers.rdi),
            1 => Ok(registers.rsi),
            2 => Ok(registers.rdx),
            3 => Ok(registers.rcx),
            4 => Ok(registers.r8),
            5 => Ok(registers.r9),
            _ => {
                let reader = vm.reader(registers, registers.dtb());
                let stack = registers.rsp + (index - 6 + 1) * size_of::<u64>() as u64;
                reader.read_u64(Va(stack))
            }
        }
    }

    fn set_function_argument(
        &self,
        vm: &Vm<C>,
        registers: &mut Registers,
        index: u64,
        value: u64,
    ) -> Result<(), VmError> {
        match index {
            0 => registers.rdi = value,
            1 => registers.rsi = value,
            2 => registers.rdx = value,
            3 => registers.rcx = value,
            4 => registers.r8 = value,
            5 => registers.r9 = value,
            _ => {
                let reader = vm.reader(registers, registers.dtb());
                let stack = registers.rsp + (index - 6 + 1) * size_of::<u64>() as u64;
                reader.write_u64(Va(stack), value)?;
            }
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
        _vm: &Vm<C>,
        _process: &Process,
        module: &str,
        symbol: &str,
    ) -> Result<Va, VmError> {
        if !(module.eq_ignore_ascii_case("vmlinux") || module.eq_ignore_ascii_case("kernel")) {
            return Err(VmError::Symbol(Box::new(SymbolError::MissingModule {
                name: module.to_string(),
                build_id: String::new(),
            })));
        }

        let linked = self.symbols.symbol_offset(symbol).ok_or_else(|| {
            VmError::Symbol(Box::new(SymbolError::MissingSymbol {
                module: module.to_string(),
                symbol: symbol.to_string(),
            }))
        })?;

        Ok(self.va_of(linked))
    }
}
