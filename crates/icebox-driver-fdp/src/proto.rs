//! The FDP shared-region layout.
//!
//! The region is a plain mailbox: the client fills [`RequestPacket`], bumps
//! `request_seq`, and spins until the counterpart echoes the sequence number
//! into `response_seq` with a status. Bulk payloads (physical memory,
//! register files) travel through the data window. Events are published into
//! a single-producer ring.

use icebox_core::{
    arch::{Cr0, Cr3, Cr4, Gdtr, Idtr, MsrEfer, Registers, Rflags, Segment, SegmentAccess, Selector},
    Pa, Va, VcpuId, VmEvent, VmEventKind,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// `"FDP1"` little-endian.
pub const FDP_MAGIC: u32 = 0x3150_4446;

/// The protocol version this client speaks.
pub const FDP_VERSION: u32 = 1;

/// Size of the bulk payload window.
pub const DATA_WINDOW: usize = 0x4000;

/// Number of slots in the event ring.
pub const EVENT_RING: usize = 64;

/// Request status: success.
pub const STATUS_OK: u32 = 0;
/// Request status: bad physical address.
pub const STATUS_INVALID_ADDRESS: u32 = 1;
/// Request status: bad vCPU index.
pub const STATUS_INVALID_VCPU: u32 = 2;
/// Request status: unknown breakpoint id.
pub const STATUS_UNKNOWN_BREAKPOINT: u32 = 3;
/// Request status: operation not supported.
pub const STATUS_NOT_SUPPORTED: u32 = 4;

/// Commands understood by the counterpart.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Halt all vCPUs.
    Pause = 1,
    /// Resume all vCPUs.
    Resume = 2,
    /// Copy a vCPU register file into the data window.
    ReadRegisters = 3,
    /// Load a vCPU register file from the data window.
    WriteRegisters = 4,
    /// Read an MSR; the value is returned through the data window.
    ReadMsr = 5,
    /// Write an MSR.
    WriteMsr = 6,
    /// Copy physical memory into the data window.
    ReadPhysical = 7,
    /// Copy the data window into physical memory.
    WritePhysical = 8,
    /// Install a breakpoint; the slot id is returned through the data window.
    AddBreakpoint = 9,
    /// Remove a breakpoint slot.
    RemoveBreakpoint = 10,
    /// Retire one instruction on a vCPU.
    SingleStep = 11,
}

/// The region header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RegionHeader {
    /// [`FDP_MAGIC`].
    pub magic: u32,
    /// [`FDP_VERSION`].
    pub version: u32,
    /// Number of vCPUs exposed by the counterpart.
    pub vcpu_count: u16,
    /// Padding.
    pub _pad: u16,
    /// Padding (alignment of `max_gfn`).
    pub _pad_align: u32,
    /// Highest guest frame number.
    pub max_gfn: u64,
    /// Client-incremented request sequence.
    pub request_seq: u32,
    /// Counterpart-echoed sequence; equality means the response is ready.
    pub response_seq: u32,
    /// Status of the last completed request.
    pub status: u32,
    /// Padding.
    pub _pad2: u32,
}

/// One synchronous request.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RequestPacket {
    /// A [`Command`] discriminant.
    pub command: u32,
    /// Target vCPU for register/MSR/step commands.
    pub vcpu: u16,
    /// Padding.
    pub _pad: u16,
    /// Physical address, MSR index or breakpoint id.
    pub arg0: u64,
    /// Length, value or breakpoint kind.
    pub arg1: u64,
}

/// One segment register in the wire format.
#[expect(missing_docs)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WireSegment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub attributes: u16,
}

impl From<WireSegment> for Segment {
    fn from(value: WireSegment) -> Self {
        Self {
            base: value.base,
            limit: value.limit,
            selector: Selector(value.selector),
            access: SegmentAccess(value.attributes),
        }
    }
}

impl From<Segment> for WireSegment {
    fn from(value: Segment) -> Self {
        Self {
            base: value.base,
            limit: value.limit,
            selector: value.selector.0,
            attributes: value.access.0,
        }
    }
}

/// A full vCPU register file in the wire format.
#[expect(missing_docs)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WireRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub cs: WireSegment,
    pub ds: WireSegment,
    pub es: WireSegment,
    pub fs: WireSegment,
    pub gs: WireSegment,
    pub ss: WireSegment,

    pub idtr_base: u64,
    pub gdtr_base: u64,
    pub idtr_limit: u16,
    pub gdtr_limit: u16,
    pub _pad: u32,

    pub shadow_gs: u64,
    pub msr_efer: u64,
    pub msr_lstar: u64,
    pub msr_star: u64,
}

impl From<WireRegisters> for Registers {
    fn from(value: WireRegisters) -> Self {
        Self {
            rax: value.rax,
            rbx: value.rbx,
            rcx: value.rcx,
            rdx: value.rdx,
            rbp: value.rbp,
            rsi: value.rsi,
            rdi: value.rdi,
            rsp: value.rsp,
            r8: value.r8,
            r9: value.r9,
            r10: value.r10,
            r11: value.r11,
            r12: value.r12,
            r13: value.r13,
            r14: value.r14,
            r15: value.r15,
            rip: value.rip,
            rflags: Rflags::from_bits_retain(value.rflags),
            cr0: Cr0(value.cr0),
            cr2: value.cr2,
            cr3: Cr3(value.cr3),
            cr4: Cr4(value.cr4),
            cs: value.cs.into(),
            ds: value.ds.into(),
            es: value.es.into(),
            fs: value.fs.into(),
            gs: value.gs.into(),
            ss: value.ss.into(),
            idtr: Idtr {
                base: value.idtr_base,
                limit: value.idtr_limit,
            },
            gdtr: Gdtr {
                base: value.gdtr_base,
                limit: value.gdtr_limit,
            },
            shadow_gs: value.shadow_gs,
            msr_efer: MsrEfer(value.msr_efer),
            msr_lstar: value.msr_lstar,
            msr_star: value.msr_star,
        }
    }
}

impl From<Registers> for WireRegisters {
    fn from(value: Registers) -> Self {
        Self {
            rax: value.rax,
            rbx: value.rbx,
            rcx: value.rcx,
            rdx: value.rdx,
            rbp: value.rbp,
            rsi: value.rsi,
            rdi: value.rdi,
            rsp: value.rsp,
            r8: value.r8,
            r9: value.r9,
            r10: value.r10,
            r11: value.r11,
            r12: value.r12,
            r13: value.r13,
            r14: value.r14,
            r15: value.r15,
            rip: value.rip,
            rflags: value.rflags.bits(),
            cr0: value.cr0.0,
            cr2: value.cr2,
            cr3: value.cr3.0,
            cr4: value.cr4.0,
            cs: value.cs.into(),
            ds: value.ds.into(),
            es: value.es.into(),
            fs: value.fs.into(),
            gs: value.gs.into(),
            ss: value.ss.into(),
            idtr_base: value.idtr.base,
            gdtr_base: value.gdtr.base,
            idtr_limit: value.idtr.limit,
            gdtr_limit: value.gdtr.limit,
            _pad: 0,
            shadow_gs: value.shadow_gs,
            msr_efer: value.msr_efer.0,
            msr_lstar: value.msr_lstar,
            msr_star: value.msr_star,
        }
    }
}

/// Event kinds in the wire format.
pub const EVENT_BREAKPOINT: u32 = 1;
/// Single-step completion.
pub const EVENT_SINGLESTEP: u32 = 2;
/// Page fault on a monitored page.
pub const EVENT_PAGE_FAULT: u32 = 3;
/// Interrupt observed.
pub const EVENT_INTERRUPT: u32 = 4;
/// The counterpart is going away.
pub const EVENT_CRASH: u32 = 5;

/// One published event.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EventRecord {
    /// An `EVENT_*` discriminant.
    pub kind: u32,
    /// The vCPU the event was raised on.
    pub vcpu: u16,
    /// Padding.
    pub _pad: u16,
    /// Breakpoint physical address or faulting physical address.
    pub pa: u64,
    /// Faulting virtual address.
    pub va: u64,
    /// Interrupt vector or fault flags.
    pub detail: u64,
    /// Register state at the time of the event.
    pub registers: WireRegisters,
}

impl EventRecord {
    /// Converts a wire event into the channel event type.
    ///
    /// Unknown kinds map to [`VmEventKind::Crash`]: a counterpart speaking a
    /// newer protocol is indistinguishable from a broken one.
    pub fn decode(&self) -> VmEvent {
        let kind = match self.kind {
            EVENT_BREAKPOINT => VmEventKind::Breakpoint { pa: Pa(self.pa) },
            EVENT_SINGLESTEP => VmEventKind::Singlestep,
            EVENT_PAGE_FAULT => VmEventKind::PageFault {
                va: Va(self.va),
                write: self.detail & 1 != 0,
            },
            EVENT_INTERRUPT => VmEventKind::Interrupt {
                vector: self.detail as u8,
            },
            _ => VmEventKind::Crash,
        };

        VmEvent::new(VcpuId(self.vcpu), self.registers.into(), kind)
    }
}

/// The event ring indices.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RingIndices {
    /// Producer index, owned by the counterpart.
    pub head: u32,
    /// Consumer index, owned by the client.
    pub tail: u32,
}

/// Byte offsets of the region components.
pub mod layout {
    use super::*;

    /// Offset of the region header.
    pub const HEADER: usize = 0;
    /// Offset of the request packet.
    pub const REQUEST: usize = size_of::<RegionHeader>();
    /// Offset of the event ring indices.
    pub const RING: usize = REQUEST + size_of::<RequestPacket>();
    /// Offset of the event slots.
    pub const EVENTS: usize = RING + size_of::<RingIndices>();
    /// Offset of the bulk data window.
    pub const DATA: usize = EVENTS + EVENT_RING * size_of::<EventRecord>();
    /// Total region size.
    pub const TOTAL: usize = DATA + DATA_WINDOW;
}
