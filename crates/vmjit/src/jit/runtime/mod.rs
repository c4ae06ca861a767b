//! Runtime support for compiled code: entry contract, helper routines,
//! the shared code memory and the code cache.

pub mod code_cache;
pub mod helpers;
pub mod jit_runtime;
pub mod trampoline;

pub use code_cache::CodeCache;
pub use jit_runtime::JitRuntime;
pub use trampoline::{CompiledFunction, JitEntryFn};
