//! Cranelift code generation backend
//!
//! Host ISA selection, the native ABI contract shared with the runtime, and
//! the emitter the opcode translator drives.

pub mod abi;
pub mod emitter;

use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use target_lexicon::{Architecture, PointerWidth};

use crate::jit::engine::OptLevel;
use crate::jit::error::JitError;

pub use emitter::Emitter;

/// Build the ISA for the host machine.
pub fn host_isa(opt_level: OptLevel) -> Result<OwnedTargetIsa, JitError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", opt_level.as_str())
        .map_err(|e| JitError::Isa(format!("Failed to set opt_level: {}", e)))?;
    // Helper addresses are embedded as immediates; no relocations are needed.
    flag_builder
        .set("is_pic", "false")
        .map_err(|e| JitError::Isa(format!("Failed to set is_pic: {}", e)))?;

    let flags = settings::Flags::new(flag_builder);

    let isa = cranelift_native::builder()
        .map_err(|e| JitError::Isa(format!("Failed to create native ISA builder: {}", e)))?
        .finish(flags)
        .map_err(|e| JitError::Isa(format!("Failed to finish ISA: {}", e)))?;

    let triple = isa.triple();
    if triple.pointer_width() != Ok(PointerWidth::U64) {
        return Err(JitError::Isa(format!("{} is not a 64-bit target", triple)));
    }
    match triple.architecture {
        Architecture::X86_64 | Architecture::Aarch64(_) | Architecture::Riscv64(_) | Architecture::S390x => {}
        other => return Err(JitError::Isa(format!("unsupported architecture {}", other))),
    }
    Ok(isa)
}
