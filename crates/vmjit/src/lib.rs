//! Register-VM bytecode JIT
//!
//! Compiles register-based bytecode functions to native code with Cranelift,
//! with a reference interpreter sharing the same frame layout, calling
//! contract and abort semantics.
//!
//! - [`bytecode`]: instruction set, function descriptors, assembler, verifier
//! - [`vm`]: values, frames, exceptions, the interpreter and call dispatch
//! - [`jit`]: translation, runtime support and the JIT engine

pub mod bytecode;
pub mod jit;
pub mod vm;

pub use bytecode::{Assembler, Instr, Opcode, RegClass, ScriptFunction};
pub use jit::{CompiledFunction, JitConfig, JitEngine, JitError, OptLevel};
pub use vm::{AbortReason, ReturnBuffer, ScriptException, VmError, VmFunction, VmValue};
