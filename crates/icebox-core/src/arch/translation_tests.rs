use super::{translate, PagingMode};
use crate::{testkit::MockChannel, Dtb, Gfn, Pa, Va, Vm, VmError};

#[test]
fn four_level_walk() {
    let channel = MockChannel::new();
    let dtb = channel.new_dtb();
    let gfn = Gfn(0x42);
    channel.map_page(dtb, Va(0x7fff_1234_5000), gfn);

    let vm = Vm::new(channel);
    let pa = translate(&vm, Va(0x7fff_1234_5678), dtb, PagingMode::Ia32e).unwrap();
    assert_eq!(pa, Pa((0x42 << 12) | 0x678));
}

#[test]
fn two_megabyte_large_page() {
    let channel = MockChannel::new();
    let dtb = channel.new_dtb();
    channel.map_page_2m(dtb, Va(0x4020_0000), Gfn(0x800));

    let vm = Vm::new(channel);
    let pa = translate(&vm, Va(0x4021_2345), dtb, PagingMode::Ia32e).unwrap();
    assert_eq!(pa, Pa((0x800 << 12) | 0x1_2345));
}

#[test]
fn non_present_entry_faults_with_the_address() {
    let channel = MockChannel::new();
    let dtb = channel.new_dtb();
    channel.map_page(dtb, Va(0x1000), Gfn(0x42));

    let vm = Vm::new(channel);
    let err = translate(&vm, Va(0x2000), dtb, PagingMode::Ia32e).unwrap_err();

    match err {
        VmError::Translation(pfs) => {
            assert_eq!(pfs[0].address, Va(0x2000));
            assert_eq!(pfs[0].root, dtb);
        }
        other => panic!("expected a translation error, got {other:?}"),
    }
}

#[test]
fn pae_walk() {
    let channel = MockChannel::new();

    // Hand-built three-level tables: PDPT[0] -> PD -> PT -> data.
    let pdpt = Pa(0x10_0000);
    let pd = Pa(0x11_0000);
    let pt = Pa(0x12_0000);
    let data = Pa(0x13_0000);

    channel.write_bytes(pdpt, &((pd.0) | 1u64).to_le_bytes());
    channel.write_bytes(pd + 8 * ((0x40_3000u64 >> 21) & 0x1ff), &(pt.0 | 0b11).to_le_bytes());
    channel.write_bytes(pt + 8 * ((0x40_3000u64 >> 12) & 0x1ff), &(data.0 | 0b11).to_le_bytes());
    channel.insert_page(super::gfn_from_pa(data));

    let vm = Vm::new(channel);
    let pa = translate(&vm, Va(0x40_3123), Dtb(pdpt), PagingMode::Pae).unwrap();
    assert_eq!(pa, data + 0x123);
}

#[test]
fn legacy_walk_with_4mb_page() {
    let channel = MockChannel::new();

    let pd = Pa(0x20_0000);

    // PDE for VA 0x0040_0000 (index 1): 4MB page at 0x0080_0000.
    let pde: u32 = 0x0080_0000 | (1 << 7) | 0b11;
    channel.write_bytes(pd + 4u64, &pde.to_le_bytes());

    let vm = Vm::new(channel);
    let pa = translate(&vm, Va(0x0047_6543), Dtb(pd), PagingMode::Legacy).unwrap();
    assert_eq!(pa, Pa(0x0087_6543));
}

#[test]
fn legacy_two_level_walk() {
    let channel = MockChannel::new();

    let pd = Pa(0x20_0000);
    let pt = Pa(0x21_0000);
    let data = Pa(0x22_0000);

    let pde: u32 = (pt.0 as u32) | 0b11;
    let pte: u32 = (data.0 as u32) | 0b11;

    // VA 0x0080_1000: PD index 2, PT index 1.
    channel.write_bytes(pd + 4 * 2u64, &pde.to_le_bytes());
    channel.write_bytes(pt + 4u64, &pte.to_le_bytes());

    let vm = Vm::new(channel);
    let pa = translate(&vm, Va(0x0080_1abc), Dtb(pd), PagingMode::Legacy).unwrap();
    assert_eq!(pa, data + 0xabc);
}
