// Native code produced by numjit is entered through raw function pointers.
// Everything that maps code pages or transmutes entry points lives here so the
// compiler crate never has to.

pub mod invoke;
pub mod memory;

pub use invoke::{MAX_ARGS, call_numeric};
pub use memory::{ExecutableRegion, MemoryError, WritableRegion};
