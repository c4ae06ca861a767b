//! Entry-point calling convention
//!
//! Compiled functions and the interpreter share one native contract, so a
//! caller never needs to know which mode a callee runs in.

use std::fmt;
use std::sync::Arc;

use crate::bytecode::ScriptFunction;
use crate::jit::runtime::jit_runtime::JitRuntime;
use crate::vm::exception::{JitExceptionInfo, ScriptException};
use crate::vm::value::{ReturnBuffer, VmReturn, VmValue};

/// Entry point signature for compiled functions
///
/// Returns the number of values written to `rets`, or 0 after an abort
/// recorded in `exc`.
pub type JitEntryFn = unsafe extern "C" fn(
    args: *const VmValue,
    numargs: i32,
    rets: *mut VmReturn,
    numret: i32,
    exc: *mut JitExceptionInfo,
) -> i32;

/// A finalized, callable compiled function.
///
/// Holds the function it was compiled from, since the code embeds addresses
/// of its instructions and constants, and the runtime owning the code memory.
pub struct CompiledFunction {
    entry: JitEntryFn,
    code_size: usize,
    listing: Option<Vec<String>>,
    func: Arc<ScriptFunction>,
    _runtime: Arc<JitRuntime>,
}

impl CompiledFunction {
    pub(crate) fn new(
        entry: JitEntryFn,
        code_size: usize,
        listing: Option<Vec<String>>,
        func: Arc<ScriptFunction>,
        runtime: Arc<JitRuntime>,
    ) -> Self {
        CompiledFunction { entry, code_size, listing, func, _runtime: runtime }
    }

    pub fn function(&self) -> &Arc<ScriptFunction> {
        &self.func
    }

    /// Size of the machine code in bytes
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Per-instruction annotations, when listing capture was enabled
    pub fn listing(&self) -> Option<&[String]> {
        self.listing.as_deref()
    }

    pub fn entry(&self) -> JitEntryFn {
        self.entry
    }

    /// Call the compiled code with the native contract.
    ///
    /// # Safety
    /// String arguments must point at live strings and return slots at
    /// storage valid for their class.
    pub unsafe fn call_raw(&self, args: &[VmValue], rets: &mut [VmReturn], exc: &mut JitExceptionInfo) -> i32 {
        (self.entry)(args.as_ptr(), args.len() as i32, rets.as_mut_ptr(), rets.len() as i32, exc)
    }

    /// Call the compiled code directly, bypassing any dispatcher for this call.
    pub fn call(&self, args: &[VmValue], rets: &mut ReturnBuffer) -> Result<usize, ScriptException> {
        let mut exc = JitExceptionInfo::new();
        let count = unsafe { self.call_raw(args, rets.slots_mut(), &mut exc) };
        match exc.take() {
            Some(exception) => Err(exception),
            None => Ok(count as usize),
        }
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("func", &self.func.name())
            .field("code_size", &self.code_size)
            .finish()
    }
}
