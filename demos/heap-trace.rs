//! Traces NT heap allocations in a target process, padding every request by
//! 32 bytes and watching the returned blocks.
//!
//! ```text
//! cargo run --example heap-trace -- <vm-name> <process-name>
//! ```

use std::{rc::Rc, time::Duration};

use icebox::{
    driver::fdp::FdpChannel,
    os::{windows::WindowsOs, GuestOs as _},
    symbols::SymbolStore,
    tracer::Tracer,
    RunOutcome, Session, VcpuId,
};

icebox::tracer::functions! {
    /// The internal NT heap allocator.
    pub fn trace_rtlp_allocate_heap_internal(RTLP_ALLOCATE_HEAP_INTERNAL):
        "heap" stdcall "ntdll"!RtlpAllocateHeapInternal(
            HeapHandle: Handle,
            Size: U64,
        ) -> Ptr;
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let vm_name = std::env::args().nth(1).unwrap_or_else(|| "win10".into());
    let target = std::env::args().nth(2).unwrap_or_else(|| "notepad.exe".into());

    let session = Session::attach(FdpChannel::attach(&vm_name)?)?;

    let store = Rc::new(SymbolStore::from_env()?);
    let registers = session.vm().registers(VcpuId(0))?;
    let os = Rc::new(WindowsOs::new(session.vm(), &registers, store)?);

    let process = os
        .process_by_name(session.vm(), &target)?
        .ok_or("target process not running")?;

    let tracer = Tracer::new(session.clone(), os);

    trace_rtlp_allocate_heap_internal(&tracer, &process, |entry| {
        let heap = entry.arg(0).as_u64().unwrap_or(0);
        let size = entry.arg(1).as_u64().unwrap_or(0);
        println!("alloc heap={heap:#x} size={size:#x}");

        // Pad the request; the guest sees the shifted allocation.
        entry.set_arg(1, size + 32)?;

        entry.hook_return(move |ret| {
            println!("    -> block {:#x}", ret.return_value());
        });

        Ok(())
    })?;

    match session.run_until(Duration::from_secs(30), |_| false)? {
        RunOutcome::Timeout => println!("no more events"),
        RunOutcome::Event(event) => println!("stopped: {:?}", event.kind()),
    }

    println!(
        "entries={} returns={} skipped={}",
        tracer.stats().entries(),
        tracer.stats().returns(),
        tracer.stats().reentries_skipped(),
    );

    session.detach()?;
    Ok(())
}
