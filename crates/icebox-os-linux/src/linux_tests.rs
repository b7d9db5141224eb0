use std::rc::Rc;

use icebox_core::{
    arch::{Cr0, Cr3, Cr4, MsrEfer, Registers, SegmentAccess},
    os::{GuestOs as _, ProcessId},
    testkit::MockChannel,
    Dtb, Va, Vm,
};
use icebox_symbols::{ModuleId, SymbolModule};

use crate::{find_banner, find_build_id, LinuxOs};

// Linked (pre-KASLR) vmlinux addresses.
const TEXT: u64 = 0xFFFF_FFFF_8100_0000;
const ENTRY_SYSCALL_64: u64 = 0xFFFF_FFFF_8180_0000;
const LINUX_BANNER: u64 = 0xFFFF_FFFF_8190_0000;
const INIT_TASK: u64 = 0xFFFF_FFFF_81A0_0000;
const MODULES: u64 = 0xFFFF_FFFF_81B0_0000;
const SYS_OPENAT: u64 = 0xFFFF_FFFF_8120_0000;

/// The guest boots with this KASLR slide.
const KASLR: u64 = 0x0000_0000_1600_0000;

// Per-CPU area; `current_task` is an offset within it.
const PER_CPU: Va = Va(0xFFFF_8880_3000_0000);
const CURRENT_TASK_OFFSET: u64 = 0x15d00;

const BASH_TASK: Va = Va(0xFFFF_8880_1000_0000);
const WORKER_TASK: Va = Va(0xFFFF_8880_1000_4000);
const BASH_MM: Va = Va(0xFFFF_8880_2000_0000);
const BASH_PGD: Va = Va(0xFFFF_8880_2100_0000);

const EXT4_MODULE: Va = Va(0xFFFF_FFFF_C000_0000);

// task_struct layout used by the synthetic guest.
const T_TASKS: u64 = 0x3f8;
const T_PID: u64 = 0x560;
const T_TGID: u64 = 0x564;
const T_COMM: u64 = 0x740;
const T_MM: u64 = 0x470;
const T_ACTIVE_MM: u64 = 0x478;
const T_REAL_PARENT: u64 = 0x588;
const T_GROUP_LEADER: u64 = 0x598;

const MM_PGD: u64 = 0x48;
const MM_MMAP: u64 = 0x0;

const VMA_START: u64 = 0x0;
const VMA_END: u64 = 0x8;
const VMA_NEXT: u64 = 0x10;
const VMA_FILE: u64 = 0x98;

const FILE_F_PATH: u64 = 0x10;
const PATH_DENTRY: u64 = 0x8;
const DENTRY_D_NAME: u64 = 0x20;
const QSTR_NAME: u64 = 0x8;

const MOD_LIST: u64 = 0x8;
const MOD_NAME: u64 = 0x18;
const MOD_CORE_LAYOUT: u64 = 0x160;

fn vmlinux_symbols() -> SymbolModule {
    let mut builder = SymbolModule::builder(ModuleId::new("vmlinux", "ab12cd34"));
    builder
        .symbol("_text", TEXT)
        .symbol("entry_SYSCALL_64", ENTRY_SYSCALL_64)
        .symbol("linux_banner", LINUX_BANNER)
        .symbol("init_task", INIT_TASK)
        .symbol("current_task", CURRENT_TASK_OFFSET)
        .symbol("modules", MODULES)
        .symbol("__x64_sys_openat", SYS_OPENAT);

    builder.structure("list_head", 0x10, |s| {
        s.member("next", 0).member("prev", 8);
    });
    builder.structure("task_struct", 0x2600, |s| {
        s.member("tasks", T_TASKS)
            .member("pid", T_PID)
            .member("tgid", T_TGID)
            .member("comm", T_COMM)
            .member("mm", T_MM)
            .member("active_mm", T_ACTIVE_MM)
            .member("real_parent", T_REAL_PARENT)
            .member("group_leader", T_GROUP_LEADER);
    });
    builder.structure("mm_struct", 0x500, |s| {
        s.member("pgd", MM_PGD).member("mmap", MM_MMAP);
    });
    builder.structure("vm_area_struct", 0xa8, |s| {
        s.member("vm_start", VMA_START)
            .member("vm_end", VMA_END)
            .member("vm_next", VMA_NEXT)
            .member("vm_file", VMA_FILE);
    });
    builder.structure("file", 0x100, |s| {
        s.member("f_path", FILE_F_PATH);
    });
    builder.structure("path", 0x10, |s| {
        s.member("dentry", PATH_DENTRY);
    });
    builder.structure("dentry", 0x100, |s| {
        s.member("d_name", DENTRY_D_NAME);
    });
    builder.structure("qstr", 0x10, |s| {
        s.member("name", QSTR_NAME);
    });
    builder.structure("module", 0x300, |s| {
        s.member("list", MOD_LIST)
            .member("name", MOD_NAME)
            .member("core_layout", MOD_CORE_LAYOUT);
    });

    builder.build()
}

fn long_mode_registers(cr3: u64) -> Registers {
    let mut registers = Registers {
        cr0: Cr0(1 << 31),
        cr3: Cr3(cr3),
        cr4: Cr4(1 << 5),
        msr_efer: MsrEfer((1 << 8) | (1 << 10)),
        msr_lstar: ENTRY_SYSCALL_64 + KASLR,
        ..Default::default()
    };
    registers.cs.access = SegmentAccess(1 << 9);
    registers.gs.base = PER_CPU.0;
    registers
}

struct LinuxGuest {
    vm: Vm<MockChannel>,
    os: Rc<LinuxOs<MockChannel>>,
    kernel_dtb: Dtb,
    user_dtb: Dtb,
    registers: Registers,
}

fn build_guest() -> LinuxGuest {
    let channel = MockChannel::new();
    let kernel_dtb = channel.new_dtb();
    let user_dtb = channel.new_dtb();

    let w = |va: Va, data: &[u8]| channel.write_virtual(kernel_dtb, va, data);
    let ptr = |va: Va| va.0.to_le_bytes();
    let slide = |linked: u64| Va(linked + KASLR);

    // Banner, reachable from the LSTAR scan.
    w(
        slide(LINUX_BANNER),
        b"Linux version 6.1.55 (gcc 12.2.0) #1 SMP\n\0",
    );

    // Build-id note near the kernel base.
    let mut note = vec![
        0x04, 0x00, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, b'G', b'N', b'U',
        0x00,
    ];
    note.extend_from_slice(&[
        0xab, 0x12, 0xcd, 0x34, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa,
        0xbb, 0xcc, 0xdd, 0xee, 0xff,
    ]);
    w(slide(TEXT) + 0x400u64, &note);

    // Make the LSTAR page itself mapped so the scans make progress.
    w(slide(ENTRY_SYSCALL_64), &[0x0f, 0x01, 0xf8]);

    // Task ring: init_task -> bash -> kworker -> init_task.
    let init_task = slide(INIT_TASK);
    let tasks = |task: Va| task + T_TASKS;

    w(tasks(init_task), &ptr(tasks(BASH_TASK)));
    w(tasks(BASH_TASK), &ptr(tasks(WORKER_TASK)));
    w(tasks(WORKER_TASK), &ptr(tasks(init_task)));

    let task = |va: Va, pid: u32, name: &str, mm: Va, parent: Va| {
        w(va + T_PID, &pid.to_le_bytes());
        w(va + T_TGID, &pid.to_le_bytes());
        w(va + T_COMM, name.as_bytes());
        w(va + T_MM, &ptr(mm));
        w(va + T_REAL_PARENT, &ptr(parent));
        w(va + T_GROUP_LEADER, &ptr(va));
    };

    task(init_task, 0, "swapper/0\0", Va(0), init_task);
    task(BASH_TASK, 1000, "bash\0", BASH_MM, init_task);
    task(WORKER_TASK, 57, "kworker/0:1\0", Va(0), init_task);
    w(WORKER_TASK + T_ACTIVE_MM, &ptr(BASH_MM));

    // bash address space: mm -> pgd (a kernel VA whose physical page is the
    // user directory table).
    w(BASH_MM + MM_PGD, &ptr(BASH_PGD));
    let pgd_gfn = icebox_core::arch::gfn_from_pa(user_dtb.root());
    channel.map_page(kernel_dtb, BASH_PGD, pgd_gfn);

    // Current task on this vCPU.
    w(PER_CPU + CURRENT_TASK_OFFSET, &ptr(BASH_TASK));

    // bash VMAs: two file-backed mappings of /bin/bash, one of libc.
    let vma1 = Va(0xFFFF_8880_2200_0000);
    let vma2 = Va(0xFFFF_8880_2200_1000);
    let vma3 = Va(0xFFFF_8880_2200_2000);
    let bash_file = Va(0xFFFF_8880_2300_0000);
    let libc_file = Va(0xFFFF_8880_2300_1000);
    let bash_dentry = Va(0xFFFF_8880_2400_0000);
    let libc_dentry = Va(0xFFFF_8880_2400_1000);
    let bash_name = Va(0xFFFF_8880_2500_0000);
    let libc_name = Va(0xFFFF_8880_2500_1000);

    w(BASH_MM + MM_MMAP, &ptr(vma1));

    let vma = |va: Va, start: u64, end: u64, next: Va, file: Va| {
        w(va + VMA_START, &start.to_le_bytes());
        w(va + VMA_END, &end.to_le_bytes());
        w(va + VMA_NEXT, &ptr(next));
        w(va + VMA_FILE, &ptr(file));
    };

    vma(vma1, 0x40_0000, 0x46_0000, vma2, bash_file);
    vma(vma2, 0x46_0000, 0x4A_0000, vma3, bash_file);
    vma(vma3, 0x7F00_0000_0000, 0x7F00_0020_0000, Va(0), libc_file);

    let file = |file_va: Va, dentry: Va, name_at: Va, name: &str| {
        w(file_va + FILE_F_PATH + PATH_DENTRY, &ptr(dentry));
        w(dentry + DENTRY_D_NAME + QSTR_NAME, &ptr(name_at));
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        w(name_at, &bytes);
    };

    file(bash_file, bash_dentry, bash_name, "bash");
    file(libc_file, libc_dentry, libc_name, "libc.so.6");

    // Kernel module list with one entry.
    let modules_head = slide(MODULES);
    w(modules_head, &ptr(EXT4_MODULE + MOD_LIST));
    w(EXT4_MODULE + MOD_LIST, &ptr(modules_head));
    w(EXT4_MODULE + MOD_NAME, b"ext4\0");
    w(EXT4_MODULE + MOD_CORE_LAYOUT, &ptr(Va(0xFFFF_FFFF_C100_0000)));
    w(
        EXT4_MODULE + MOD_CORE_LAYOUT + 8,
        &0x8_0000u32.to_le_bytes(),
    );

    let registers = long_mode_registers(kernel_dtb.root().0);

    let vm = Vm::new(channel);
    let os = Rc::new(LinuxOs::with_profile(&registers, Rc::new(vmlinux_symbols())).unwrap());

    LinuxGuest {
        vm,
        os,
        kernel_dtb,
        user_dtb,
        registers,
    }
}

#[test]
fn banner_and_build_id_are_found_near_the_syscall_entry() {
    let guest = build_guest();

    let banner = find_banner(&guest.vm, &guest.registers).unwrap().unwrap();
    assert!(banner.starts_with("Linux version 6.1.55"));

    let build_id = find_build_id(&guest.vm, &guest.registers)
        .unwrap()
        .unwrap();
    assert_eq!(build_id.len(), 40);
    assert!(build_id.starts_with("ab12cd34"));
}

#[test]
fn kaslr_slide_is_recovered_from_lstar() {
    let guest = build_guest();
    assert_eq!(guest.os.kaslr_offset(), KASLR);
    assert_eq!(guest.os.kernel_image_base(), Va(TEXT + KASLR));
}

#[test]
fn banner_string_is_read_through_the_slide() {
    let guest = build_guest();
    let banner = guest.os.kernel_information_string(&guest.vm).unwrap();
    assert!(banner.starts_with("Linux version 6.1.55"));
}

#[test]
fn task_walk_reconstructs_processes() {
    let guest = build_guest();
    let processes = guest.os.processes(&guest.vm).unwrap();

    assert_eq!(processes.len(), 3);

    let swapper = &processes[0];
    assert_eq!(swapper.id, ProcessId(0));
    assert_eq!(swapper.name, "swapper/0");
    assert!(!swapper.user);
    assert_eq!(swapper.dtb, guest.kernel_dtb);

    let bash = processes.iter().find(|p| p.name == "bash").unwrap();
    assert_eq!(bash.id, ProcessId(1000));
    assert_eq!(bash.parent_id, ProcessId(0));
    assert!(bash.user);
    assert_eq!(bash.dtb, guest.user_dtb);

    // Kernel threads borrow the address space of their last user host.
    let worker = guest
        .os
        .process_by_name(&guest.vm, "kworker/0:1")
        .unwrap()
        .unwrap();
    assert!(!worker.user);
    assert_eq!(worker.dtb, guest.user_dtb);
}

#[test]
fn current_task_comes_from_the_per_cpu_area() {
    let guest = build_guest();

    let thread = guest
        .os
        .current_thread(&guest.vm, &guest.registers)
        .unwrap();
    assert_eq!(thread.object.va(), BASH_TASK);
    assert_eq!(thread.id.0, 1000);
    assert_eq!(thread.process.va(), BASH_TASK);

    let process = guest
        .os
        .current_process(&guest.vm, &guest.registers)
        .unwrap();
    assert_eq!(process.name, "bash");
}

#[test]
fn vma_walk_groups_file_mappings_into_modules() {
    let guest = build_guest();

    let bash = guest
        .os
        .process_by_name(&guest.vm, "bash")
        .unwrap()
        .unwrap();
    let modules = guest.os.modules(&guest.vm, &bash).unwrap();

    assert_eq!(modules.len(), 2);
    assert_eq!(modules[0].name, "bash");
    assert_eq!(modules[0].base, Va(0x40_0000));
    assert_eq!(modules[0].size, 0xA_0000);
    assert_eq!(modules[1].name, "libc.so.6");
    assert_eq!(modules[1].size, 0x20_0000);
}

#[test]
fn module_list_yields_drivers() {
    let guest = build_guest();
    let drivers = guest.os.drivers(&guest.vm).unwrap();

    assert_eq!(drivers.len(), 1);
    assert_eq!(drivers[0].name, "ext4");
    assert_eq!(drivers[0].base, Va(0xFFFF_FFFF_C100_0000));
    assert_eq!(drivers[0].size, 0x8_0000);
}

#[test]
fn sysv_arguments_come_from_registers_then_stack() {
    let guest = build_guest();

    let stack = Va(0x7FFD_0000_0000);
    guest
        .vm
        .channel()
        .write_virtual(guest.user_dtb, stack + 8u64, &0xfeedu64.to_le_bytes());

    let mut registers = long_mode_registers(guest.user_dtb.root().0);
    registers.rdi = 1;
    registers.rsi = 2;
    registers.rdx = 3;
    registers.rcx = 4;
    registers.r8 = 5;
    registers.r9 = 6;
    registers.rsp = stack.0;

    for (index, expected) in [(0u64, 1u64), (1, 2), (2, 3), (3, 4), (4, 5), (5, 6), (6, 0xfeed)] {
        assert_eq!(
            guest
                .os
                .function_argument(&guest.vm, &registers, index)
                .unwrap(),
            expected
        );
    }

    guest
        .os
        .set_function_argument(&guest.vm, &mut registers, 0, 0x99)
        .unwrap();
    assert_eq!(registers.rdi, 0x99);
}

#[test]
fn kernel_symbols_resolve_through_the_slide() {
    let guest = build_guest();

    let bash = guest
        .os
        .process_by_name(&guest.vm, "bash")
        .unwrap()
        .unwrap();

    let va = guest
        .os
        .resolve_symbol(&guest.vm, &bash, "vmlinux", "__x64_sys_openat")
        .unwrap();
    assert_eq!(va, Va(SYS_OPENAT + KASLR));

    assert!(guest
        .os
        .resolve_symbol(&guest.vm, &bash, "libc", "open")
        .is_err());
}
