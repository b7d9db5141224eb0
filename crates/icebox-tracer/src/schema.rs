//! The declarative tracing schema.
//!
//! Each traced function is described once: module, name, calling-convention
//! tag, function family (for re-entrancy filtering) and a typed argument
//! list. The [`functions!`](crate::functions) macro turns a table of such
//! entries into static descriptors plus one registration stub per entry.

use icebox_core::Va;

/// The calling convention a traced function uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// Microsoft x64 (`RCX`, `RDX`, `R8`, `R9`, then stack).
    Stdcall,

    /// System V AMD64 (`RDI`, `RSI`, `RDX`, `RCX`, `R8`, `R9`, then stack).
    SysV,
}

/// The type of one declared argument (or return value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// A raw guest pointer; passed through undereferenced.
    Ptr,
    /// An opaque kernel handle.
    Handle,
    /// A NUL-terminated UTF-16 guest string, dereferenced and bounded.
    WStr {
        /// Maximum number of UTF-16 units read.
        max_chars: usize,
    },
    /// An enumeration value; the tag names the guest-side type.
    Enum(&'static str),
}

/// One declared argument.
#[derive(Debug, Clone, Copy)]
pub struct ArgDef {
    /// The argument name from the schema.
    pub name: &'static str,

    /// The declared type.
    pub kind: ArgKind,
}

/// A traced function descriptor, built once from the declarative schema.
#[derive(Debug, Clone, Copy)]
pub struct FunctionDef {
    /// The module exporting the function.
    pub module: &'static str,

    /// The symbolic function name.
    pub name: &'static str,

    /// The function family re-entrancy is filtered on (e.g. all heap
    /// entry points share one family).
    pub family: &'static str,

    /// The calling convention tag.
    pub convention: CallingConvention,

    /// The declared return type.
    pub ret: ArgKind,

    /// The ordered argument list.
    pub args: &'static [ArgDef],
}

/// A decoded argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// Signed 32-bit integer.
    I32(i32),
    /// Signed 64-bit integer.
    I64(i64),
    /// A raw guest pointer.
    Ptr(Va),
    /// An opaque kernel handle.
    Handle(u64),
    /// A dereferenced UTF-16 string.
    WStr(String),
    /// An enumeration value with its guest-side type tag.
    Enum {
        /// The guest-side type name.
        tag: &'static str,
        /// The raw value.
        value: u64,
    },
    /// The argument could not be read.
    Absent,
}

impl ArgValue {
    /// Returns the value as an integer, if it has one.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v as u64),
            Self::U16(v) => Some(v as u64),
            Self::U32(v) => Some(v as u64),
            Self::U64(v) => Some(v),
            Self::I32(v) => Some(v as u64),
            Self::I64(v) => Some(v as u64),
            Self::Ptr(va) => Some(va.0),
            Self::Handle(v) => Some(v),
            Self::Enum { value, .. } => Some(value),
            Self::WStr(_) | Self::Absent => None,
        }
    }

    /// Returns the value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::WStr(s) => Some(s),
            _ => None,
        }
    }

    /// Checks whether the argument failed to decode.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Declares traced functions and generates their registration stubs.
///
/// Each entry names the generated stub function and descriptor static, the
/// function family, calling convention, module and symbol, and the typed
/// argument list:
///
/// ```ignore
/// icebox_tracer::functions! {
///     /// The internal NT heap allocator.
///     pub fn trace_rtlp_allocate_heap_internal(RTLP_ALLOCATE_HEAP_INTERNAL):
///         "heap" stdcall "ntdll"!RtlpAllocateHeapInternal(
///             HeapHandle: Handle,
///             Size: U64,
///         ) -> Ptr;
/// }
/// ```
#[macro_export]
macro_rules! functions {
    (@conv stdcall) => { $crate::CallingConvention::Stdcall };
    (@conv sysv) => { $crate::CallingConvention::SysV };

    (
        $(
            $(#[$meta:meta])*
            pub fn $stub:ident ( $def:ident ):
                $family:literal $conv:ident $module:literal ! $name:ident (
                    $(
                        $arg:ident : $kind:ident
                        $( ( $($pargs:tt)* ) )?
                        $( { $($kargs:tt)* } )?
                    ),* $(,)?
                ) -> $ret:ident $( { $($rargs:tt)* } )? ;
        )*
    ) => {
        $(
            $(#[$meta])*
            pub static $def: $crate::FunctionDef = $crate::FunctionDef {
                module: $module,
                name: stringify!($name),
                family: $family,
                convention: $crate::functions!(@conv $conv),
                ret: $crate::ArgKind::$ret $( { $($rargs)* } )?,
                args: &[
                    $(
                        $crate::ArgDef {
                            name: stringify!($arg),
                            kind: $crate::ArgKind::$kind
                                $( ( $($pargs)* ) )?
                                $( { $($kargs)* } )?,
                        },
                    )*
                ],
            };

            #[doc = concat!(
                "Installs an entry hook on `",
                $module, "!", stringify!($name),
                "` in the given process."
            )]
            pub fn $stub<C, Os>(
                tracer: &$crate::Tracer<C, Os>,
                process: &$crate::__private::Process,
                callback: impl FnMut(
                    &mut $crate::EntryEvent<'_, C, Os>,
                ) -> Result<(), $crate::__private::VmError>
                    + 'static,
            ) -> Result<(), $crate::__private::VmError>
            where
                C: $crate::__private::Channel,
                Os: $crate::__private::GuestOs<C> + 'static,
            {
                tracer.trace(&$def, process, callback)
            }
        )*
    };
}
