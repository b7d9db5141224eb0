//! # Icebox
//!
//! Virtual machine introspection over a paused hypervisor debug surface.
//!
//! Icebox attaches to a cooperative shared-memory channel (FDP) exposed by a
//! debug-capable hypervisor and rebuilds guest-OS semantics from raw
//! physical memory and vCPU state: processes, threads, modules, drivers,
//! symbols, and system-call / library-function activity.
//!
//! # Layers
//!
//! The workspace follows the dependency order of the problem, leaves first:
//!
//! - **Channel** ([`Channel`], [`driver::fdp`]): the transport to a
//!   paused VM: registers, MSRs, physical memory, breakpoints, single-step
//!   and the event pump. Synchronous, one outstanding request, no internal
//!   retries.
//!
//! - **Memory** ([`Vm`], [`Reader`]): virtual reads through the guest page
//!   tables, parameterized by a directory table ([`Dtb`]); every paging mode
//!   the hardware can be in, chunked across page boundaries, cached only
//!   while the guest is paused.
//!
//! - **State** ([`Session`]): the run lifecycle (`Detached → Paused ⇄
//!   Running`), the breakpoint registry (shared physical slots, logical
//!   entries with thread filters and one-shot semantics) and
//!   [`run_until`](Session::run_until).
//!
//! - **Symbols** ([`symbols`]): per-module immutable indexes keyed by
//!   build-id, an on-disk store shaped like a symbol server, and RSDS
//!   CodeView identification.
//!
//! - **OS** ([`os`]): the Windows/NT and Linux backends behind one
//!   capability trait: process/thread/module discovery, calling-convention
//!   argument access, `(module, symbol)` resolution.
//!
//! - **Tracer** ([`tracer`]): declarative function schemas, entry hooks with
//!   typed argument marshalling, argument rewriting, and transparent
//!   one-shot return hooks keyed on `(return address, thread)`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::rc::Rc;
//!
//! use icebox::{
//!     driver::fdp::FdpChannel,
//!     os::{windows::WindowsOs, GuestOs as _},
//!     symbols::SymbolStore,
//!     Session, VcpuId,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Attach to the VM published as /fdp_win10; the session pauses it.
//!     let session = Session::attach(FdpChannel::attach("win10")?)?;
//!
//!     // Identify the guest kernel and load its symbols.
//!     let store = Rc::new(SymbolStore::from_env()?);
//!     let registers = session.vm().registers(VcpuId(0))?;
//!     let os = Rc::new(WindowsOs::new(session.vm(), &registers, store)?);
//!
//!     for process in os.processes(session.vm())? {
//!         println!("{:>6} {}", process.id, process.name);
//!     }
//!
//!     session.detach()?;
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency model
//!
//! Single-threaded and cooperative: the introspector holds the guest paused
//! while it reads or writes guest state, and all breakpoint callbacks run on
//! the one event pump. Consistency with the guest comes from pause/resume
//! discipline, not from locks.

pub use icebox_core::*;

pub mod symbols {
    //! Symbol indexes, CodeView identification and the on-disk store.

    pub use icebox_symbols::*;
}

pub mod driver {
    //! Channel implementations.

    #[cfg(feature = "driver-fdp")]
    pub mod fdp {
        //! The FDP shared-memory channel.

        pub use icebox_driver_fdp::*;
    }
}

pub mod os {
    //! Operating-system awareness.

    pub use icebox_core::os::*;

    #[cfg(feature = "os-linux")]
    pub mod linux {
        //! The Linux guest backend.

        pub use icebox_os_linux::*;
    }

    #[cfg(feature = "os-windows")]
    pub mod windows {
        //! The Windows/NT guest backend.

        pub use icebox_os_windows::*;
    }
}

#[cfg(feature = "tracer")]
pub mod tracer {
    //! Function-entry interception and argument marshalling.

    pub use icebox_tracer::*;
}
