use std::rc::Rc;

use icebox_core::{
    arch::{Cr0, Cr3, Cr4, MsrEfer, Registers, SegmentAccess},
    os::{GuestOs as _, OsArchitecture, ProcessId},
    testkit::MockChannel,
    Dtb, Va, Vm,
};
use icebox_symbols::{ModuleId, SymbolModule, SymbolStore};

use crate::{find_kernel, WindowsOs};

const KERNEL_BASE: Va = Va(0xFFFF_F800_0000_0000);
const KPCR: Va = Va(0xFFFF_F801_0000_0000);
const IDT: Va = Va(0xFFFF_F801_0001_0000);

const IDLE_EPROCESS: Va = Va(0xFFFF_E000_0000_0000);
const SYSTEM_EPROCESS: Va = Va(0xFFFF_E000_0000_1000);
const NOTEPAD_EPROCESS: Va = Va(0xFFFF_E000_0000_2000);
const SYSTEM_ETHREAD: Va = Va(0xFFFF_E000_0001_0000);

const PEB: Va = Va(0x0000_0000_7FFD_0000);
const LDR_DATA: Va = Va(0x0000_0000_7FFE_0000);
const NOTEPAD_LDR_ENTRY: Va = Va(0x0000_0000_7FF0_0000);
const NTDLL_LDR_ENTRY: Va = Va(0x0000_0000_7FF0_1000);
const NTDLL_BASE: Va = Va(0x0000_7FFA_0000_0000);

// Image-relative kernel globals.
const OFF_KI_SYSTEM_CALL64: u64 = 0x1000;
const OFF_NT_BUILD_LAB: u64 = 0x3000;
const OFF_ACTIVE_PROCESS_HEAD: u64 = 0x4000;
const OFF_INITIAL_SYSTEM_PROCESS: u64 = 0x4100;
const OFF_LOADED_MODULE_LIST: u64 = 0x4200;
const OFF_EX_ALLOCATE: u64 = 0x8000;

// EPROCESS layout used by the synthetic guest.
const EP_UNIQUE_PROCESS_ID: u64 = 0x440;
const EP_ACTIVE_PROCESS_LINKS: u64 = 0x448;
const EP_INHERITED_FROM: u64 = 0x548;
const EP_PEB: u64 = 0x550;
const EP_WOW64: u64 = 0x580;
const EP_IMAGE_FILE_NAME: u64 = 0x5a8;
const KP_DIRECTORY_TABLE_BASE: u64 = 0x28;

const KPCR_PRCB: u64 = 0x180;
const KPRCB_CURRENT_THREAD: u64 = 0x8;
const KT_APC_STATE: u64 = 0x98;
const KT_TEB: u64 = 0xf0;
const APC_PROCESS: u64 = 0x20;
const ET_CID: u64 = 0x478;

const LDR_DLL_BASE: u64 = 0x30;
const LDR_SIZE_OF_IMAGE: u64 = 0x40;
const LDR_BASE_DLL_NAME: u64 = 0x58;

const GUID: [u8; 16] = [
    0x78, 0x56, 0x34, 0x12, 0xbc, 0x9a, 0xf0, 0xde, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
    0x88,
];
const IDENTITY: &str = "123456789ABCDEF011223344556677881";

fn kernel_symbols() -> SymbolModule {
    let mut builder = SymbolModule::builder(ModuleId::new("ntkrnlmp.pdb", IDENTITY));
    builder
        .symbol("KiSystemCall64", OFF_KI_SYSTEM_CALL64)
        .symbol("NtBuildLab", OFF_NT_BUILD_LAB)
        .symbol("PsActiveProcessHead", OFF_ACTIVE_PROCESS_HEAD)
        .symbol("PsInitialSystemProcess", OFF_INITIAL_SYSTEM_PROCESS)
        .symbol("PsLoadedModuleList", OFF_LOADED_MODULE_LIST)
        .symbol("ExAllocatePoolWithTag", OFF_EX_ALLOCATE);

    builder.structure("_LIST_ENTRY", 0x10, |s| {
        s.member("Flink", 0).member("Blink", 8);
    });
    builder.structure("_KPCR", 0x200, |s| {
        s.member("Prcb", KPCR_PRCB);
    });
    builder.structure("_KPRCB", 0x100, |s| {
        s.member("CurrentThread", KPRCB_CURRENT_THREAD);
    });
    builder.structure("_KTHREAD", 0x500, |s| {
        s.member("ApcState", KT_APC_STATE).member("Teb", KT_TEB);
    });
    builder.structure("_KAPC_STATE", 0x30, |s| {
        s.member("Process", APC_PROCESS);
    });
    builder.structure("_ETHREAD", 0x600, |s| {
        s.member("Cid", ET_CID);
    });
    builder.structure("_CLIENT_ID", 0x10, |s| {
        s.member("UniqueProcess", 0).member("UniqueThread", 8);
    });
    builder.structure("_KPROCESS", 0x2e0, |s| {
        s.member("DirectoryTableBase", KP_DIRECTORY_TABLE_BASE);
    });
    builder.structure("_EPROCESS", 0x700, |s| {
        s.member("UniqueProcessId", EP_UNIQUE_PROCESS_ID)
            .member("InheritedFromUniqueProcessId", EP_INHERITED_FROM)
            .member("ActiveProcessLinks", EP_ACTIVE_PROCESS_LINKS)
            .member("ImageFileName", EP_IMAGE_FILE_NAME)
            .member("Peb", EP_PEB)
            .member("Wow64Process", EP_WOW64);
    });
    builder.structure("_PEB", 0x300, |s| {
        s.member("Ldr", 0x18).member("ImageBaseAddress", 0x10);
    });
    builder.structure("_PEB_LDR_DATA", 0x60, |s| {
        s.member("InLoadOrderModuleList", 0x10);
    });
    builder.structure("_LDR_DATA_TABLE_ENTRY", 0x100, |s| {
        s.member("InLoadOrderLinks", 0)
            .member("DllBase", LDR_DLL_BASE)
            .member("SizeOfImage", LDR_SIZE_OF_IMAGE)
            .member("BaseDllName", LDR_BASE_DLL_NAME);
    });
    builder.structure("_UNICODE_STRING", 0x10, |s| {
        s.member("Length", 0).member("Buffer", 8);
    });

    builder.build()
}

fn long_mode_registers(cr3: u64) -> Registers {
    let mut registers = Registers {
        cr0: Cr0(1 << 31),
        cr3: Cr3(cr3),
        cr4: Cr4(1 << 5),
        msr_efer: MsrEfer((1 << 8) | (1 << 10)),
        ..Default::default()
    };
    registers.cs.access = SegmentAccess(1 << 9);
    registers.gs.base = KPCR.0;
    registers.idtr.base = IDT.0;
    registers
}

/// A CodeView blob naming the kernel PDB.
fn rsds_blob() -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(b"RSDS");
    blob.extend_from_slice(&GUID);
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(b"ntkrnlmp.pdb\0");
    blob
}

/// Builds one header page of a PE32+ image with optional debug and export
/// data directories.
fn pe_header_page(debug: Option<(u32, u32)>, export: Option<(u32, u32)>) -> Vec<u8> {
    let mut page = vec![0u8; 0x1000];

    page[0] = b'M';
    page[1] = b'Z';
    page[0x3c..0x40].copy_from_slice(&0x80u32.to_le_bytes());

    // NT headers at 0x80.
    page[0x80..0x84].copy_from_slice(b"PE\0\0");
    // Optional header at 0x98 (file header is 20 bytes).
    page[0x98..0x9a].copy_from_slice(&0x20bu16.to_le_bytes());
    // SizeOfImage.
    page[0x98 + 56..0x98 + 60].copy_from_slice(&0x0010_0000u32.to_le_bytes());
    // NumberOfRvaAndSizes.
    page[0x98 + 108..0x98 + 112].copy_from_slice(&16u32.to_le_bytes());

    let mut write_dir = |index: usize, entry: Option<(u32, u32)>| {
        if let Some((rva, size)) = entry {
            let at = 0x108 + index * 8;
            page[at..at + 4].copy_from_slice(&rva.to_le_bytes());
            page[at + 4..at + 8].copy_from_slice(&size.to_le_bytes());
        }
    };

    write_dir(0, export);
    write_dir(6, debug);

    page
}

struct NtGuest {
    vm: Vm<MockChannel>,
    os: Rc<WindowsOs<MockChannel>>,
    kernel_dtb: Dtb,
    user_dtb: Dtb,
    registers: Registers,
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    for unit in s.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes.extend_from_slice(&[0, 0]);
    bytes
}

fn build_guest() -> NtGuest {
    let channel = MockChannel::new();
    let kernel_dtb = channel.new_dtb();
    let user_dtb = channel.new_dtb();

    let w = |va: Va, data: &[u8]| channel.write_virtual(kernel_dtb, va, data);
    let wu = |va: Va, data: &[u8]| channel.write_virtual(user_dtb, va, data);
    let ptr = |va: Va| va.0.to_le_bytes();

    // Kernel image: PE headers with a CodeView entry at RVA 0x300.
    let mut cv = rsds_blob();
    cv.resize(64, 0);
    let header = pe_header_page(Some((0x200, 28)), None);
    w(KERNEL_BASE, &header);

    let mut debug_dir = vec![0u8; 28];
    debug_dir[12..16].copy_from_slice(&2u32.to_le_bytes()); // CODEVIEW
    debug_dir[16..20].copy_from_slice(&(cv.len() as u32).to_le_bytes());
    debug_dir[20..24].copy_from_slice(&0x300u32.to_le_bytes());
    w(KERNEL_BASE + 0x200u64, &debug_dir);
    w(KERNEL_BASE + 0x300u64, &cv);

    // IDT[0] points into the kernel image.
    let handler = KERNEL_BASE + 0x500u64;
    let mut gate = [0u8; 16];
    gate[0..2].copy_from_slice(&(handler.0 as u16).to_le_bytes());
    gate[6..8].copy_from_slice(&((handler.0 >> 16) as u16).to_le_bytes());
    gate[8..12].copy_from_slice(&((handler.0 >> 32) as u32).to_le_bytes());
    w(IDT, &gate);

    // NtBuildLab.
    w(
        KERNEL_BASE + OFF_NT_BUILD_LAB,
        b"22621.1.amd64fre.ni_release.220506-1250\0",
    );

    // Process list ring: head -> Idle -> System -> notepad -> head.
    let head = KERNEL_BASE + OFF_ACTIVE_PROCESS_HEAD;
    let links = |eprocess: Va| eprocess + EP_ACTIVE_PROCESS_LINKS;

    w(head, &ptr(links(IDLE_EPROCESS)));
    w(links(IDLE_EPROCESS), &ptr(links(SYSTEM_EPROCESS)));
    w(links(SYSTEM_EPROCESS), &ptr(links(NOTEPAD_EPROCESS)));
    w(links(NOTEPAD_EPROCESS), &ptr(head));

    let process = |eprocess: Va, pid: u64, parent: u64, name: &str, dtb: Dtb, peb: Va| {
        w(eprocess + EP_UNIQUE_PROCESS_ID, &pid.to_le_bytes());
        w(eprocess + EP_INHERITED_FROM, &parent.to_le_bytes());
        w(eprocess + EP_IMAGE_FILE_NAME, name.as_bytes());
        w(eprocess + KP_DIRECTORY_TABLE_BASE, &dtb.root().0.to_le_bytes());
        w(eprocess + EP_PEB, &ptr(peb));
    };

    process(IDLE_EPROCESS, 0, 0, "Idle\0", kernel_dtb, Va(0));
    process(SYSTEM_EPROCESS, 4, 0, "System\0", kernel_dtb, Va(0));
    process(NOTEPAD_EPROCESS, 1234, 4, "notepad.exe\0", user_dtb, PEB);

    // PsInitialSystemProcess.
    w(
        KERNEL_BASE + OFF_INITIAL_SYSTEM_PROCESS,
        &ptr(SYSTEM_EPROCESS),
    );

    // Current thread: KPCR -> PRCB -> KTHREAD -> System.
    w(
        KPCR + KPCR_PRCB + KPRCB_CURRENT_THREAD,
        &ptr(SYSTEM_ETHREAD),
    );
    w(
        SYSTEM_ETHREAD + KT_APC_STATE + APC_PROCESS,
        &ptr(SYSTEM_EPROCESS),
    );
    w(SYSTEM_ETHREAD + ET_CID + 8, &0x1c8u64.to_le_bytes());

    // Notepad loader list: PEB -> Ldr -> [notepad.exe, ntdll.dll].
    wu(PEB + 0x18u64, &ptr(LDR_DATA));
    let ldr_head = LDR_DATA + 0x10u64;
    wu(ldr_head, &ptr(NOTEPAD_LDR_ENTRY));
    wu(NOTEPAD_LDR_ENTRY, &ptr(NTDLL_LDR_ENTRY));
    wu(NTDLL_LDR_ENTRY, &ptr(ldr_head));

    let ldr_entry = |entry: Va, base: Va, size: u32, name: &str, name_at: Va| {
        wu(entry + LDR_DLL_BASE, &ptr(base));
        wu(entry + LDR_SIZE_OF_IMAGE, &size.to_le_bytes());
        let name_bytes = utf16_bytes(name);
        wu(name_at, &name_bytes);
        let length = ((name_bytes.len() - 2) as u16).to_le_bytes();
        wu(entry + LDR_BASE_DLL_NAME, &length);
        wu(entry + LDR_BASE_DLL_NAME + 8, &ptr(name_at));
    };

    ldr_entry(
        NOTEPAD_LDR_ENTRY,
        Va(0x0000_0000_0040_0000),
        0x30000,
        "notepad.exe",
        Va(0x0000_0000_7FF2_0000),
    );
    ldr_entry(
        NTDLL_LDR_ENTRY,
        NTDLL_BASE,
        0x1F0000,
        "ntdll.dll",
        Va(0x0000_0000_7FF2_1000),
    );

    // ntdll image with one export.
    let ntdll_header = pe_header_page(None, Some((0x400, 0x100)));
    wu(NTDLL_BASE, &ntdll_header);

    let mut export_dir = vec![0u8; 40];
    export_dir[20..24].copy_from_slice(&1u32.to_le_bytes()); // NumberOfFunctions
    export_dir[24..28].copy_from_slice(&1u32.to_le_bytes()); // NumberOfNames
    export_dir[28..32].copy_from_slice(&0x580u32.to_le_bytes()); // AddressOfFunctions
    export_dir[32..36].copy_from_slice(&0x500u32.to_le_bytes()); // AddressOfNames
    export_dir[36..40].copy_from_slice(&0x540u32.to_le_bytes()); // AddressOfNameOrdinals
    wu(NTDLL_BASE + 0x400u64, &export_dir);
    wu(NTDLL_BASE + 0x500u64, &0x600u32.to_le_bytes());
    wu(NTDLL_BASE + 0x540u64, &0u16.to_le_bytes());
    wu(NTDLL_BASE + 0x580u64, &0x5_a3c0u32.to_le_bytes());
    wu(NTDLL_BASE + 0x600u64, b"RtlpAllocateHeapInternal\0");

    let registers = long_mode_registers(kernel_dtb.root().0);

    let store = Rc::new(SymbolStore::new("/nonexistent"));
    store.insert(kernel_symbols());

    let vm = Vm::new(channel);
    let os = Rc::new(WindowsOs::new(&vm, &registers, store).unwrap());

    NtGuest {
        vm,
        os,
        kernel_dtb,
        user_dtb,
        registers,
    }
}

#[test]
fn kernel_is_found_below_the_idt_handler() {
    let guest = build_guest();

    let mut registers = guest.registers;
    registers.idtr.base = IDT.0;

    let kernel = find_kernel(&guest.vm, &registers).unwrap();
    assert_eq!(kernel.base, KERNEL_BASE);
    assert_eq!(kernel.codeview.name, "ntkrnlmp.pdb");
    assert_eq!(kernel.codeview.identity.len(), 33);
    assert_eq!(kernel.codeview.identity, IDENTITY);
}

#[test]
fn build_lab_string_is_read_from_the_kernel() {
    let guest = build_guest();
    let info = guest.os.kernel_information_string(&guest.vm).unwrap();
    assert!(info.starts_with("22621.1.amd64fre"));
}

#[test]
fn process_walk_finds_system_and_idle() {
    let guest = build_guest();
    let processes = guest.os.processes(&guest.vm).unwrap();

    assert_eq!(processes.len(), 3);

    let system = processes.iter().find(|p| p.name == "System").unwrap();
    assert_eq!(system.id, ProcessId(4));
    assert!(!system.user);
    assert_eq!(system.dtb, guest.kernel_dtb);

    let idle = processes.iter().find(|p| p.name == "Idle").unwrap();
    assert_eq!(idle.id, ProcessId(0));

    let notepad = processes.iter().find(|p| p.name == "notepad.exe").unwrap();
    assert_eq!(notepad.id, ProcessId(1234));
    assert_eq!(notepad.parent_id, ProcessId(4));
    assert!(notepad.user);
    assert_eq!(notepad.dtb, guest.user_dtb);
    assert_eq!(notepad.arch, OsArchitecture::Amd64);
}

#[test]
fn current_thread_resolves_through_the_kpcr() {
    let guest = build_guest();

    let thread = guest
        .os
        .current_thread(&guest.vm, &guest.registers)
        .unwrap();
    assert_eq!(thread.object.va(), SYSTEM_ETHREAD);
    assert_eq!(thread.id.0, 0x1c8);
    assert_eq!(thread.process.va(), SYSTEM_EPROCESS);

    let process = guest
        .os
        .current_process(&guest.vm, &guest.registers)
        .unwrap();
    assert_eq!(process.name, "System");
}

#[test]
fn current_thread_fails_outside_kernel_space() {
    let guest = build_guest();

    let mut registers = guest.registers;
    registers.gs.base = 0x1000;
    registers.shadow_gs = 0x2000;

    assert!(guest.os.current_thread(&guest.vm, &registers).is_err());
}

#[test]
fn loader_list_yields_modules() {
    let guest = build_guest();

    let processes = guest.os.processes(&guest.vm).unwrap();
    let notepad = processes.iter().find(|p| p.name == "notepad.exe").unwrap();

    let modules = guest.os.modules(&guest.vm, notepad).unwrap();
    assert_eq!(modules.len(), 2);
    assert_eq!(modules[0].name, "notepad.exe");
    assert_eq!(modules[1].name, "ntdll.dll");
    assert_eq!(modules[1].base, NTDLL_BASE);
    assert_eq!(modules[1].size, 0x1F0000);

    // Kernel-only processes have no loader list.
    let system = processes.iter().find(|p| p.name == "System").unwrap();
    assert!(guest.os.modules(&guest.vm, system).unwrap().is_empty());
}

#[test]
fn x64_arguments_come_from_registers_then_stack() {
    let guest = build_guest();

    let stack = Va(0x0000_0000_7FF3_0000);
    guest
        .vm
        .channel()
        .write_virtual(guest.user_dtb, stack + 5 * 8u64, &0xdeadu64.to_le_bytes());

    let mut registers = long_mode_registers(guest.user_dtb.root().0);
    registers.rcx = 1;
    registers.rdx = 2;
    registers.r8 = 3;
    registers.r9 = 4;
    registers.rsp = stack.0;

    for (index, expected) in [(0u64, 1u64), (1, 2), (2, 3), (3, 4), (4, 0xdead)] {
        assert_eq!(
            guest
                .os
                .function_argument(&guest.vm, &registers, index)
                .unwrap(),
            expected
        );
    }
}

#[test]
fn argument_rewrite_hits_registers_and_stack() {
    let guest = build_guest();

    let stack = Va(0x0000_0000_7FF3_0000);
    guest
        .vm
        .channel()
        .write_virtual(guest.user_dtb, stack + 5 * 8u64, &0u64.to_le_bytes());

    let mut registers = long_mode_registers(guest.user_dtb.root().0);
    registers.rsp = stack.0;

    guest
        .os
        .set_function_argument(&guest.vm, &mut registers, 1, 0x41)
        .unwrap();
    assert_eq!(registers.rdx, 0x41);

    guest
        .os
        .set_function_argument(&guest.vm, &mut registers, 4, 0x42)
        .unwrap();
    assert_eq!(
        guest
            .os
            .function_argument(&guest.vm, &registers, 4)
            .unwrap(),
        0x42
    );
}

#[test]
fn return_address_is_the_top_of_stack() {
    let guest = build_guest();

    let stack = Va(0x0000_0000_7FF3_0000);
    guest.vm.channel().write_virtual(
        guest.user_dtb,
        stack,
        &0x0000_7FFA_0001_2345u64.to_le_bytes(),
    );

    let mut registers = long_mode_registers(guest.user_dtb.root().0);
    registers.rsp = stack.0;

    assert_eq!(
        guest.os.return_address(&guest.vm, &registers).unwrap(),
        Va(0x0000_7FFA_0001_2345)
    );
}

#[test]
fn kernel_symbols_resolve_against_the_image_base() {
    let guest = build_guest();

    let processes = guest.os.processes(&guest.vm).unwrap();
    let system = processes.iter().find(|p| p.name == "System").unwrap();

    let va = guest
        .os
        .resolve_symbol(&guest.vm, system, "nt", "ExAllocatePoolWithTag")
        .unwrap();
    assert_eq!(va, KERNEL_BASE + OFF_EX_ALLOCATE);
}

#[test]
fn user_symbols_fall_back_to_exports() {
    let guest = build_guest();

    let processes = guest.os.processes(&guest.vm).unwrap();
    let notepad = processes.iter().find(|p| p.name == "notepad.exe").unwrap();

    let va = guest
        .os
        .resolve_symbol(&guest.vm, notepad, "ntdll", "RtlpAllocateHeapInternal")
        .unwrap();
    assert_eq!(va, NTDLL_BASE + 0x5_a3c0u64);

    let missing = guest
        .os
        .resolve_symbol(&guest.vm, notepad, "ntdll", "RtlMissing")
        .unwrap_err();
    assert!(matches!(missing, icebox_core::VmError::Symbol(_)));
}
