use serde::{Deserialize, Serialize};

use crate::{Dtb, Va};

macro_rules! impl_object {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Debug,
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub Va);

        impl $name {
            /// Checks if the object is a null reference.
            pub fn is_null(&self) -> bool {
                self.0.0 == 0
            }

            /// Returns the kernel virtual address of the object.
            pub fn va(&self) -> Va {
                self.0
            }
        }

        impl From<Va> for $name {
            fn from(va: Va) -> Self {
                Self(va)
            }
        }

        impl From<$name> for Va {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_object!(
    ProcessObject,
    "A process object (`EPROCESS*` / `task_struct*`). Compared by address only."
);
impl_object!(
    ThreadObject,
    "A thread object (`ETHREAD*` / `task_struct*`). Compared by address only."
);
impl_object!(
    ModuleObject,
    "A loader entry for a user module. Compared by address only."
);
impl_object!(
    DriverObject,
    "A loader entry for a kernel module or driver. Compared by address only."
);

/// A process ID within the guest.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProcessId(pub u64);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A thread ID within the guest.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ThreadId(pub u64);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The architecture a process executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsArchitecture {
    /// Unknown.
    Unknown,

    /// 32-bit x86 (including WoW64 processes on a 64-bit kernel).
    X86,

    /// 64-bit x86.
    Amd64,
}

/// A process in the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// The process object address.
    pub object: ProcessObject,

    /// The PID.
    pub id: ProcessId,

    /// The parent PID.
    pub parent_id: ProcessId,

    /// The short process name (16 characters on both NT and Linux).
    pub name: String,

    /// The directory table of the process address space.
    pub dtb: Dtb,

    /// Whether the process has a user-mode address space.
    pub user: bool,

    /// The pointer width the process runs with.
    pub arch: OsArchitecture,
}

/// A thread in the guest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thread {
    /// The thread object address.
    pub object: ThreadObject,

    /// The TID.
    pub id: ThreadId,

    /// The process the thread belongs to.
    pub process: ProcessObject,
}

/// A module mapped into a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    /// The loader entry address.
    pub object: ModuleObject,

    /// The module base address.
    pub base: Va,

    /// The module size in bytes.
    pub size: u64,

    /// The short module name.
    pub name: String,
}

/// A kernel module or driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    /// The loader entry address.
    pub object: DriverObject,

    /// The image base address.
    pub base: Va,

    /// The image size in bytes.
    pub size: u64,

    /// The short image name.
    pub name: String,
}
