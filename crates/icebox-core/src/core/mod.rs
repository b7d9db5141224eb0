mod address;
mod hex;
mod info;
pub(crate) mod macros;
mod vcpu_id;

pub use self::{
    address::{Dtb, Gfn, Pa, Va},
    hex::Hex,
    info::VmInfo,
    vcpu_id::VcpuId,
};
