use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{arch::Registers, Pa, VcpuId, VmError, VmEvent, VmInfo};

/// The kind of breakpoint a channel can install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakpointKind {
    /// Software execution breakpoint (byte overwrite).
    SoftExec,

    /// Hypervisor-assisted execution breakpoint.
    HardExec,

    /// Read watchpoint.
    Read,

    /// Write watchpoint.
    Write,

    /// Read/write watchpoint.
    ReadWrite,
}

/// A channel-side breakpoint slot identifier.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BreakpointId(pub u32);

impl std::fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The transport to a paused virtual machine.
///
/// A channel is a cooperative debug surface shared with the hypervisor: all
/// operations are synchronous, carry at most one outstanding request, and
/// never retry internally. Failures surface as [`VmError::Channel`] (or more
/// specific variants) and are the caller's problem.
///
/// After [`pause`] returns success, no guest progress occurs until
/// [`resume`], [`singlestep`] or a run-until-event.
///
/// [`pause`]: Self::pause
/// [`resume`]: Self::resume
/// [`singlestep`]: Self::singlestep
pub trait Channel: 'static {
    /// Returns static information about the virtual machine.
    fn info(&self) -> Result<VmInfo, VmError>;

    /// Halts all guest virtual CPUs. Idempotent.
    fn pause(&self) -> Result<(), VmError>;

    /// Resumes all guest virtual CPUs. Idempotent.
    fn resume(&self) -> Result<(), VmError>;

    /// Returns the registers of a specific virtual CPU.
    fn registers(&self, vcpu: VcpuId) -> Result<Registers, VmError>;

    /// Sets the registers of a specific virtual CPU.
    fn set_registers(&self, vcpu: VcpuId, registers: Registers) -> Result<(), VmError>;

    /// Reads a model-specific register.
    fn read_msr(&self, vcpu: VcpuId, msr: u32) -> Result<u64, VmError>;

    /// Writes a model-specific register.
    fn write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> Result<(), VmError>;

    /// Reads guest physical memory.
    fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), VmError>;

    /// Writes guest physical memory.
    fn write_physical(&self, pa: Pa, buffer: &[u8]) -> Result<(), VmError>;

    /// Installs a breakpoint at a physical address.
    ///
    /// For [`BreakpointKind::SoftExec`] the counterpart replaces the byte at
    /// the target with a breakpoint instruction; removal restores it.
    fn add_breakpoint(&self, pa: Pa, kind: BreakpointKind) -> Result<BreakpointId, VmError>;

    /// Removes a previously installed breakpoint.
    fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), VmError>;

    /// Retires a single instruction on the given virtual CPU.
    fn singlestep(&self, vcpu: VcpuId) -> Result<(), VmError>;

    /// Blocks until the guest reports an event, or the timeout elapses with
    /// [`VmError::Timeout`].
    fn wait_for_event(&self, timeout: Duration) -> Result<VmEvent, VmError>;
}
