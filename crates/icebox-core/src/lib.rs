//! Core introspection kernel.
//!
//! Everything above the hypervisor transport and below the OS backends:
//! address atoms, the [`Channel`] contract, the AMD64 register and paging
//! model, chunked virtual-memory readers, and the [`Session`] run-state
//! machine with its breakpoint registry.

pub mod arch;
mod channel;
mod core;
mod error;
mod event;
pub mod os;
mod reader;
mod session;
mod vm;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use self::{
    channel::{BreakpointId, BreakpointKind, Channel},
    core::{Dtb, Gfn, Hex, Pa, Va, VcpuId, VmInfo},
    error::{PageFault, PageFaults, VmError},
    event::{RunOutcome, VmEvent, VmEventKind},
    reader::Reader,
    session::{
        Breakpoint, BreakpointCallback, BreakpointGuard, RunControl, RunState, Session,
        SessionPauseGuard, ThreadResolver,
    },
    vm::Vm,
};
