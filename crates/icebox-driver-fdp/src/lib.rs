//! FDP shared-memory channel.
//!
//! The Fast Debug Protocol surface is a shared-memory region published by a
//! cooperative hypervisor. [`FdpChannel`] implements the
//! [`Channel`](icebox_core::Channel) contract over it: synchronous
//! register/MSR/memory access, a breakpoint table, single-step, and an event
//! ring.

mod client;
mod error;
pub mod proto;

use std::time::Duration;

use icebox_core::{
    arch::Registers, BreakpointId, BreakpointKind, Channel, Gfn, Pa, VcpuId, VmError, VmEvent,
    VmInfo,
};

pub use self::error::Error;
use self::{client::FdpClient, proto::Command};

/// A channel over an FDP shared-memory region.
pub struct FdpChannel {
    client: FdpClient,
}

impl FdpChannel {
    /// Attaches to the VM published under `/fdp_<name>`.
    ///
    /// Attaching does not pause the guest; that is the session's first move.
    pub fn attach(name: &str) -> Result<Self, VmError> {
        Ok(Self {
            client: FdpClient::open(name)?,
        })
    }

    fn breakpoint_kind_code(kind: BreakpointKind) -> u64 {
        match kind {
            BreakpointKind::SoftExec => 0,
            BreakpointKind::HardExec => 1,
            BreakpointKind::Read => 2,
            BreakpointKind::Write => 3,
            BreakpointKind::ReadWrite => 4,
        }
    }
}

impl Channel for FdpChannel {
    fn info(&self) -> Result<VmInfo, VmError> {
        Ok(VmInfo {
            page_size: icebox_core::arch::PAGE_SIZE,
            page_shift: icebox_core::arch::PAGE_SHIFT,
            max_gfn: Gfn(self.client.max_gfn()),
            vcpus: self.client.vcpu_count(),
        })
    }

    fn pause(&self) -> Result<(), VmError> {
        Ok(self.client.request(Command::Pause, 0, 0, 0)?)
    }

    fn resume(&self) -> Result<(), VmError> {
        Ok(self.client.request(Command::Resume, 0, 0, 0)?)
    }

    fn registers(&self, vcpu: VcpuId) -> Result<Registers, VmError> {
        self.client.request(Command::ReadRegisters, vcpu.0, 0, 0)?;
        let wire: proto::WireRegisters = self.client.read_data_struct().map_err(Error::from)?;
        Ok(wire.into())
    }

    fn set_registers(&self, vcpu: VcpuId, registers: Registers) -> Result<(), VmError> {
        let wire = proto::WireRegisters::from(registers);
        self.client
            .write_data(zerocopy::IntoBytes::as_bytes(&wire))
            .map_err(Error::from)?;
        Ok(self.client.request(Command::WriteRegisters, vcpu.0, 0, 0)?)
    }

    fn read_msr(&self, vcpu: VcpuId, msr: u32) -> Result<u64, VmError> {
        self.client
            .request(Command::ReadMsr, vcpu.0, msr as u64, 0)?;
        let value: u64 = self.client.read_data_struct().map_err(Error::from)?;
        Ok(value)
    }

    fn write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> Result<(), VmError> {
        Ok(self
            .client
            .request(Command::WriteMsr, vcpu.0, msr as u64, value)?)
    }

    fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), VmError> {
        let mut position = 0usize;

        while position < buffer.len() {
            let chunk = std::cmp::min(buffer.len() - position, proto::DATA_WINDOW);

            self.client.request(
                Command::ReadPhysical,
                0,
                pa.0 + position as u64,
                chunk as u64,
            )?;
            self.client
                .read_data(&mut buffer[position..position + chunk])
                .map_err(Error::from)?;

            position += chunk;
        }

        Ok(())
    }

    fn write_physical(&self, pa: Pa, buffer: &[u8]) -> Result<(), VmError> {
        let mut position = 0usize;

        while position < buffer.len() {
            let chunk = std::cmp::min(buffer.len() - position, proto::DATA_WINDOW);

            self.client
                .write_data(&buffer[position..position + chunk])
                .map_err(Error::from)?;
            self.client.request(
                Command::WritePhysical,
                0,
                pa.0 + position as u64,
                chunk as u64,
            )?;

            position += chunk;
        }

        Ok(())
    }

    fn add_breakpoint(&self, pa: Pa, kind: BreakpointKind) -> Result<BreakpointId, VmError> {
        self.client.request(
            Command::AddBreakpoint,
            0,
            pa.0,
            Self::breakpoint_kind_code(kind),
        )?;
        let id: u32 = self.client.read_data_struct().map_err(Error::from)?;
        Ok(BreakpointId(id))
    }

    fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), VmError> {
        Ok(self
            .client
            .request(Command::RemoveBreakpoint, 0, id.0 as u64, 0)?)
    }

    fn singlestep(&self, vcpu: VcpuId) -> Result<(), VmError> {
        Ok(self.client.request(Command::SingleStep, vcpu.0, 0, 0)?)
    }

    fn wait_for_event(&self, timeout: Duration) -> Result<VmEvent, VmError> {
        let record = self.client.wait_for_event(timeout)?;
        Ok(record.decode())
    }
}
