//! Kernel structure layouts and global symbols, resolved once from the
//! kernel's symbol module at identification time.

use icebox_symbols::SymbolModule;

use crate::WindowsError;

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
                pub fn load(module: &SymbolModule) -> Result<Self, WindowsError> {
                    Ok(Self {
                        $(
                            $field: module
                                .member_offset($structure, $member)
                                .ok_or(WindowsError::MissingMember {
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
        /// Image-relative offsets of the kernel globals the model reads.
        #[derive(Debug, Clone, Copy)]
        pub(crate) struct $rust {
            $( pub $field: u64, )*
        }

        impl $rust {
            pub fn load(module: &SymbolModule) -> Result<Self, WindowsError> {
                Ok(Self {
                    $(
                        $field: module
                            .symbol_offset($symbol)
                            .ok_or(WindowsError::MissingSymbol($symbol))?,
                    )*
                })
            }
        }
    };
}

layouts! {
    /// `LIST_ENTRY`; the walkers only follow the forward links.
    struct ListEntry = "_LIST_ENTRY" {
        flink = "Flink";
    }

    /// `KPCR`, anchored in `GS` on x64.
    struct Kpcr = "_KPCR" {
        prcb = "Prcb";
    }

    /// `KPRCB`.
    struct Kprcb = "_KPRCB" {
        current_thread = "CurrentThread";
    }

    /// `KTHREAD`.
    struct Kthread = "_KTHREAD" {
        apc_state = "ApcState";
    }

    /// `KAPC_STATE`.
    struct KapcState = "_KAPC_STATE" {
        process = "Process";
    }

    /// `ETHREAD`.
    struct Ethread = "_ETHREAD" {
        cid = "Cid";
    }

    /// `CLIENT_ID`.
    struct ClientId = "_CLIENT_ID" {
        unique_thread = "UniqueThread";
    }

    /// `KPROCESS`; sits at offset 0 of `EPROCESS`.
    struct Kprocess = "_KPROCESS" {
        directory_table_base = "DirectoryTableBase";
    }

    /// `EPROCESS`.
    struct Eprocess = "_EPROCESS" {
        unique_process_id = "UniqueProcessId";
        inherited_from_unique_process_id = "InheritedFromUniqueProcessId";
        active_process_links = "ActiveProcessLinks";
        image_file_name = "ImageFileName";
        peb = "Peb";
        wow64_process = "Wow64Process";
    }

    /// `PEB`.
    struct Peb = "_PEB" {
        ldr = "Ldr";
    }

    /// `PEB_LDR_DATA`.
    struct PebLdrData = "_PEB_LDR_DATA" {
        in_load_order_module_list = "InLoadOrderModuleList";
    }

    /// `LDR_DATA_TABLE_ENTRY` / `KLDR_DATA_TABLE_ENTRY`; the fields the
    /// model reads share offsets between the two.
    struct LdrDataTableEntry = "_LDR_DATA_TABLE_ENTRY" {
        in_load_order_links = "InLoadOrderLinks";
        dll_base = "DllBase";
        size_of_image = "SizeOfImage";
        base_dll_name = "BaseDllName";
    }

    /// `UNICODE_STRING`.
    struct UnicodeString = "_UNICODE_STRING" {
        length = "Length";
        buffer = "Buffer";
    }
}

kernel_symbols! {
    struct KernelSymbols {
        ps_active_process_head = "PsActiveProcessHead";
        ps_initial_system_process = "PsInitialSystemProcess";
        ps_loaded_module_list = "PsLoadedModuleList";
        ki_system_call64 = "KiSystemCall64";
        nt_build_lab = "NtBuildLab";
    }
}

/// All structure layouts the model needs, loaded together.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Offsets {
    pub list: ListEntry,
    pub kpcr: Kpcr,
    pub kprcb: Kprcb,
    pub kthread: Kthread,
    pub kapc_state: KapcState,
    pub ethread: Ethread,
    pub client_id: ClientId,
    pub kprocess: Kprocess,
    pub eprocess: Eprocess,
    pub peb: Peb,
    pub peb_ldr_data: PebLdrData,
    pub ldr_entry: LdrDataTableEntry,
    pub unicode_string: UnicodeString,
}

impl Offsets {
    pub fn load(module: &SymbolModule) -> Result<Self, WindowsError> {
        Ok(Self {
            list: ListEntry::load(module)?,
            kpcr: Kpcr::load(module)?,
            kprcb: Kprcb::load(module)?,
            kthread: Kthread::load(module)?,
            kapc_state: KapcState::load(module)?,
            ethread: Ethread::load(module)?,
            client_id: ClientId::load(module)?,
            kprocess: Kprocess::load(module)?,
            eprocess: Eprocess::load(module)?,
            peb: Peb::load(module)?,
            peb_ldr_data: PebLdrData::load(module)?,
            ldr_entry: LdrDataTableEntry::load(module)?,
            unicode_string: UnicodeString::load(module)?,
        })
    }
}
