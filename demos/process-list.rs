//! Attaches to a paused VM over FDP, identifies the Windows kernel and
//! prints the process list.
//!
//! ```text
//! cargo run --example process-list -- <vm-name>
//! ```

use std::rc::Rc;

use icebox::{
    driver::fdp::FdpChannel,
    os::{windows::WindowsOs, GuestOs as _},
    symbols::SymbolStore,
    Session, VcpuId,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let vm_name = std::env::args().nth(1).unwrap_or_else(|| "win10".into());

    let session = Session::attach(FdpChannel::attach(&vm_name)?)?;
    tracing::info!(vm = %vm_name, "attached, guest paused");

    let store = Rc::new(SymbolStore::from_env()?);
    let registers = session.vm().registers(VcpuId(0))?;
    let os = Rc::new(WindowsOs::new(session.vm(), &registers, store)?);

    println!("{}", os.kernel_information_string(session.vm())?);

    for process in os.processes(session.vm())? {
        println!(
            "{:>6} {:<16} root @ {}",
            process.id, process.name, process.dtb
        );
    }

    let current = os.current_process(session.vm(), &registers)?;
    println!("current: {} [{}]", current.name, current.id);

    for module in os.modules(session.vm(), &current)? {
        println!("    {} @ {} ({:#x} bytes)", module.name, module.base, module.size);
    }

    session.detach()?;
    Ok(())
}
