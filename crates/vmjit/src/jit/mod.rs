//! Bytecode to native code compilation
//!
//! This module compiles verified [`ScriptFunction`]s to machine code with
//! Cranelift. It includes:
//! - Opcode translation with inline abort and propagation checks
//! - Virtual register mapping
//! - The native ABI shared with the runtime and its helper routines
//! - The shared code runtime and the code cache
//! - Profiling for hot function detection

pub mod backend;
pub mod error;
pub mod profiling;
pub mod regmap;
pub mod runtime;
mod translate;

mod engine;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use cranelift_codegen::ir::UserFuncName;
use cranelift_frontend::FunctionBuilderContext;
use cranelift_module::{Module, ModuleError};
use tracing::{debug, error, trace};

use crate::bytecode::ScriptFunction;
use crate::vm::exception::VmError;

pub use engine::{JitConfig, JitEngine, OptLevel};
pub use error::JitError;
pub use runtime::{CodeCache, CompiledFunction, JitEntryFn, JitRuntime};

/// Compile `func` into `runtime`'s code memory.
///
/// Verifies the function first. On failure nothing is left defined in the
/// runtime and the caller keeps interpreting.
pub fn compile_function(
    runtime: &Arc<JitRuntime>,
    func: &Arc<ScriptFunction>,
    capture_listing: bool,
) -> Result<CompiledFunction, JitError> {
    func.verify().map_err(|e| JitError::from(e.clone()))?;

    let call_conv = runtime.call_conv();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        runtime.with_module(|module| {
            let mut ctx = module.make_context();
            ctx.func.signature = backend::abi::entry_signature(call_conv);
            ctx.func.name = UserFuncName::user(0, func.id().as_u32());

            let mut fctx = FunctionBuilderContext::new();
            let listing = translate::translate(func, &mut ctx.func, &mut fctx, call_conv, capture_listing)?;

            let id = module
                .declare_anonymous_function(&ctx.func.signature)
                .map_err(|e| JitError::Module(e.to_string()))?;
            if let Err(e) = module.define_function(id, &mut ctx) {
                error!(function = %func.name(), error = %e, "code generation failed:\n{}", ctx.func.display());
                module.clear_context(&mut ctx);
                return Err(match e {
                    ModuleError::Compilation(e) => JitError::Codegen(e.to_string()),
                    other => JitError::Module(other.to_string()),
                });
            }
            let code_size = ctx.compiled_code().map_or(0, |code| code.code_buffer().len());
            module.clear_context(&mut ctx);

            module
                .finalize_definitions()
                .map_err(|e| JitError::Module(e.to_string()))?;
            let ptr = module.get_finalized_function(id);
            let entry = unsafe { std::mem::transmute::<*const u8, JitEntryFn>(ptr) };
            Ok((entry, code_size, listing))
        })
    }));

    let (entry, code_size, listing) = match outcome {
        Ok(result) => result?,
        Err(panic) => {
            let error = VmError::from_panic(panic);
            return Err(JitError::Codegen(format!("panic while compiling {}: {}", func.name(), error)));
        }
    };

    debug!(
        function = %func.name(),
        instructions = func.code().len(),
        code_size,
        "compiled function"
    );
    if let Some(listing) = listing.as_ref() {
        trace!(function = %func.name(), "listing:\n{}", listing.join("\n"));
    }

    Ok(CompiledFunction::new(entry, code_size, listing, func.clone(), runtime.clone()))
}
