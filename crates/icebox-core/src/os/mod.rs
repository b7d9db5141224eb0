//! Operating-system awareness.
//!
//! The kernel-identification step hands out a [`GuestOs`] implementation
//! (Windows/NT or Linux); everything above the session talks to the guest
//! through this capability set.

mod common;

pub use self::common::{
    Driver, DriverObject, Module, ModuleObject, OsArchitecture, Process, ProcessId, ProcessObject,
    Thread, ThreadId, ThreadObject,
};
use crate::{arch::Registers, Channel, Reader, Va, Vm, VmError};

/// The capability set shared by the OS backends.
pub trait GuestOs<C>
where
    C: Channel,
{
    /// Returns the base address of the kernel image.
    fn kernel_image_base(&self) -> Va;

    /// Retrieves an implementation-specific string describing the kernel
    /// build (`NtBuildLab` on Windows, `linux_banner` on Linux).
    fn kernel_information_string(&self, vm: &Vm<C>) -> Result<String, VmError>;

    /// Walks the kernel's process list.
    fn processes(&self, vm: &Vm<C>) -> Result<Vec<Process>, VmError>;

    /// Finds a process by its short name (case-insensitive).
    fn process_by_name(&self, vm: &Vm<C>, name: &str) -> Result<Option<Process>, VmError> {
        Ok(self
            .processes(vm)?
            .into_iter()
            .find(|process| process.name.eq_ignore_ascii_case(name)))
    }

    /// Locates the thread currently executing on the vCPU the registers were
    /// captured from.
    fn current_thread(&self, vm: &Vm<C>, registers: &Registers) -> Result<Thread, VmError>;

    /// Locates the process owning the currently executing thread.
    fn current_process(&self, vm: &Vm<C>, registers: &Registers) -> Result<Process, VmError>;

    /// Iterates the loader list of a process.
    fn modules(&self, vm: &Vm<C>, process: &Process) -> Result<Vec<Module>, VmError>;

    /// Iterates the kernel's module/driver list.
    fn drivers(&self, vm: &Vm<C>) -> Result<Vec<Driver>, VmError>;

    /// Builds a reader bound to a process's directory table.
    fn reader<'a>(&self, vm: &'a Vm<C>, process: &Process) -> Reader<'a, C>;

    /// Reads the `index`-th argument of the function whose prologue the
    /// instruction pointer currently sits on, per the OS calling convention.
    fn function_argument(
        &self,
        vm: &Vm<C>,
        registers: &Registers,
        index: u64,
    ) -> Result<u64, VmError>;

    /// Rewrites the `index`-th argument at a function entry.
    ///
    /// Register arguments are changed in the given register state (the
    /// caller flushes them to the vCPU); stack arguments are written through
    /// guest memory.
    fn set_function_argument(
        &self,
        vm: &Vm<C>,
        registers: &mut Registers,
        index: u64,
        value: u64,
    ) -> Result<(), VmError>;

    /// Returns the function result register at a return site.
    fn function_return_value(&self, registers: &Registers) -> u64 {
        registers.result()
    }

    /// Reads the return address from the stack slot at `RSP`, as seen at a
    /// function entry.
    fn return_address(&self, vm: &Vm<C>, registers: &Registers) -> Result<Va, VmError>;

    /// Resolves `(module, symbol)` to a virtual address inside a process.
    fn resolve_symbol(
        &self,
        vm: &Vm<C>,
        process: &Process,
        module: &str,
        symbol: &str,
    ) -> Result<Va, VmError>;
}
