//! `vmlinux` structure layouts and globals, resolved once from the kernel's
//! symbol module.

use icebox_symbols::SymbolModule;

use crate::LinuxError;

macro_rules! layouts {
    (
        $(
            $(#[$meta:meta])*
            struct $rust:ident = $structure:literal {
                $( $field:ident = $member:literal; )*
            }
        )*
    ) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy)]
            pub(crate) struct $rust {
                $( pub $field: u64, )*
            }

            impl $rust {
                pub fn load(module: &SymbolModule) -> Result<Self, LinuxError> {
                    Ok(Self {
                        $(
                            $field: module
                                .member_offset($structure, $member)
                                .ok_or(LinuxError::MissingMember {
                                    structure: $structure,
                                    member: $member,
                                })?,
                        )*
                    })
                }
            }
        )*
    };
}

macro_rules! kernel_symbols {
    (
        struct $rust:ident {
            $( $field:ident = $symbol:literal; )*
        }
    ) => {
        /// Addresses of the `vmlinux` globals the model reads (as linked,
        /// before KASLR relocation).
        #[derive(Debug, Clone, Copy)]
        pub(crate) struct $rust {
            $( pub $field: u64, )*
        }

        impl $rust {
            pub fn load(module: &SymbolModule) -> Result<Self, LinuxError> {
                Ok(Self {
                    $(
                        $field: module
                            .symbol_offset($symbol)
                            .ok_or(LinuxError::MissingSymbol($symbol))?,
                    )*
                })
            }
        }
    };
}

layouts! {
    /// `list_head`; the walkers only follow the forward links.
    struct ListHead = "list_head" {
        next = "next";
    }

    /// `task_struct`.
    struct TaskStruct = "task_struct" {
        tasks = "tasks";
        pid = "pid";
        tgid = "tgid";
        comm = "comm";
        mm = "mm";
        active_mm = "active_mm";
        real_parent = "real_parent";
        group_leader = "group_leader";
    }

    /// `mm_struct`.
    struct MmStruct = "mm_struct" {
        pgd = "pgd";
        mmap = "mmap";
    }

    /// `vm_area_struct` (pre-maple-tree kernels carry the `vm_next` chain).
    struct VmAreaStruct = "vm_area_struct" {
        vm_start = "vm_start";
        vm_end = "vm_end";
        vm_next = "vm_next";
        vm_file = "vm_file";
    }

    /// `file`.
    struct File = "file" {
        f_path = "f_path";
    }

    /// `path`.
    struct Path = "path" {
        dentry = "dentry";
    }

    /// `dentry`.
    struct Dentry = "dentry" {
        d_name = "d_name";
    }

    /// `qstr`; the name pointer sits in the second word.
    struct Qstr = "qstr" {
        name = "name";
    }

    /// `module`.
    struct ModuleLayout = "module" {
        list = "list";
        name = "name";
    }
}

kernel_symbols! {
    struct KernelSymbols {
        text = "_text";
        entry_syscall_64 = "entry_SYSCALL_64";
        linux_banner = "linux_banner";
        init_task = "init_task";
        current_task = "current_task";
        modules = "modules";
    }
}

/// All structure layouts the model needs, loaded together.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Offsets {
    pub list: ListHead,
    pub task: TaskStruct,
    pub mm: MmStruct,
    pub vma: VmAreaStruct,
    pub file: File,
    pub path: Path,
    pub dentry: Dentry,
    pub qstr: Qstr,
    pub module: ModuleLayout,
    /// `module::core_layout` start, when this kernel has one. `base` sits at
    /// offset 0 and `size` at offset 8 within the layout.
    pub module_core_layout: Option<u64>,
}

impl Offsets {
    pub fn load(module: &SymbolModule) -> Result<Self, LinuxError> {
        Ok(Self {
            list: ListHead::load(module)?,
            task: TaskStruct::load(module)?,
            mm: MmStruct::load(module)?,
            vma: VmAreaStruct::load(module)?,
            file: File::load(module)?,
            path: Path::load(module)?,
            dentry: Dentry::load(module)?,
            qstr: Qstr::load(module)?,
            module: ModuleLayout::load(module)?,
            module_core_layout: module.member_offset("module", "core_layout"),
        })
    }
}
