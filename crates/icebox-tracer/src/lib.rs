//! Function-entry interception and argument marshalling.
//!
//! Plugins describe the kernel API calls they care about in a declarative
//! schema ([`functions!`]); the tracer resolves each target through the OS
//! model, installs entry breakpoints, materializes typed arguments on a hit
//! and manages transparent one-shot return hooks.

mod schema;
mod tracer;


pub use self::{
    schema::{ArgDef, ArgKind, ArgValue, CallingConvention, FunctionDef},
    tracer::{EntryEvent, ReturnEvent, Tracer, TracerError, TracerStats},
};

#[doc(hidden)]
pub mod __private {
    pub use icebox_core::{
        os::{GuestOs, Process},
        Channel, VmError,
    };
}
