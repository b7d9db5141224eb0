use crate::{arch::Registers, Pa, Va, VcpuId};

/// The reason an event was delivered by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEventKind {
    /// A software breakpoint fired.
    Breakpoint {
        /// The physical address of the breakpoint instruction.
        pa: Pa,
    },

    /// A previously requested single-step retired one instruction.
    Singlestep,

    /// The guest faulted on a monitored page.
    PageFault {
        /// The faulting virtual address.
        va: Va,
        /// Whether the access was a write.
        write: bool,
    },

    /// An interrupt was observed.
    Interrupt {
        /// The interrupt vector.
        vector: u8,
    },

    /// The channel transport collapsed; the session must be re-attached.
    Crash,
}

/// An event reported by the channel while the guest was running.
///
/// The counterpart pauses every virtual CPU before publishing an event, so
/// the register state captured here is stable until the next resume.
#[derive(Debug, Clone, Copy)]
pub struct VmEvent {
    vcpu: VcpuId,
    registers: Registers,
    kind: VmEventKind,
}

impl VmEvent {
    /// Creates a new event.
    pub fn new(vcpu: VcpuId, registers: Registers, kind: VmEventKind) -> Self {
        Self {
            vcpu,
            registers,
            kind,
        }
    }

    /// Returns the ID of the virtual CPU where the event occurred.
    pub fn vcpu(&self) -> VcpuId {
        self.vcpu
    }

    /// Returns the CPU register state at the time of the event.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Returns the reason for the event.
    pub fn kind(&self) -> VmEventKind {
        self.kind
    }

    /// Returns the breakpoint address if this event is a breakpoint hit.
    pub fn breakpoint_pa(&self) -> Option<Pa> {
        match self.kind {
            VmEventKind::Breakpoint { pa } => Some(pa),
            _ => None,
        }
    }
}

/// The outcome of running the guest until an event of interest.
#[derive(Debug)]
pub enum RunOutcome {
    /// An event matched the predicate, or a callback requested a stop.
    Event(VmEvent),

    /// No event arrived within the timeout. The guest has been paused; the
    /// caller decides whether to resume or detach.
    Timeout,
}

impl RunOutcome {
    /// Returns the event, if any.
    pub fn event(&self) -> Option<&VmEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Timeout => None,
        }
    }
}
