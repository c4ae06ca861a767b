//! Call dispatch between native functions, compiled code and the interpreter

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::bytecode::ScriptFunction;
use crate::jit::CompiledFunction;
use crate::vm::exception::{Abort, JitExceptionInfo, ScriptException, VmError};
use crate::vm::function::{NativeFunction, VmFunction};
use crate::vm::interpreter;
use crate::vm::value::{ReturnBuffer, ReturnSlots, VmReturn, VmValue};

/// Supplies compiled code for script functions.
pub trait ScriptDispatch: Send + Sync {
    /// Compiled code for `func`, compiling it first when the dispatcher
    /// decides it is worth it. `None` means "interpret".
    fn compiled(&self, func: &Arc<ScriptFunction>) -> Option<Arc<CompiledFunction>>;
}

thread_local! {
    static DISPATCH: RefCell<Option<Arc<dyn ScriptDispatch>>> = const { RefCell::new(None) };
}

/// Restores the previously installed dispatcher on drop.
pub struct DispatchGuard {
    previous: Option<Arc<dyn ScriptDispatch>>,
}

/// Route script calls made on this thread through `dispatch`.
pub fn install_dispatch(dispatch: Arc<dyn ScriptDispatch>) -> DispatchGuard {
    let previous = DISPATCH.with(|slot| slot.replace(Some(dispatch)));
    DispatchGuard { previous }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        DISPATCH.with(|slot| *slot.borrow_mut() = previous);
    }
}

fn current_dispatch() -> Option<Arc<dyn ScriptDispatch>> {
    DISPATCH.with(|slot| slot.borrow().clone())
}

/// Invoke any function with the native calling contract.
pub fn invoke(func: &VmFunction, args: &[VmValue], rets: &mut [VmReturn], exc: &mut JitExceptionInfo) -> i32 {
    match func {
        VmFunction::Script(script) => invoke_script(script, args, rets, exc),
        VmFunction::Native(native) => invoke_native(native, args, rets, exc),
    }
}

pub fn invoke_script(
    func: &Arc<ScriptFunction>,
    args: &[VmValue],
    rets: &mut [VmReturn],
    exc: &mut JitExceptionInfo,
) -> i32 {
    func.profile().record_call();
    match current_dispatch().and_then(|dispatch| dispatch.compiled(func)) {
        Some(compiled) => unsafe { compiled.call_raw(args, rets, exc) },
        None => interpreter::run(func, args, rets, exc),
    }
}

fn invoke_native(
    native: &NativeFunction,
    args: &[VmValue],
    rets: &mut [VmReturn],
    exc: &mut JitExceptionInfo,
) -> i32 {
    let capacity = rets.len();
    let mut slots = ReturnSlots::new(rets);
    let outcome = catch_unwind(AssertUnwindSafe(|| (native.body)(args, &mut slots)));
    let error = match outcome {
        Ok(Ok(count)) => return count.min(capacity) as i32,
        Ok(Err(error)) => error,
        Err(panic) => VmError::from_panic(panic),
    };
    tracing::debug!(function = %native.name, %error, "native function failed");
    exc.raise(Abort::error(error), std::ptr::null());
    0
}

/// Call `func` and collect its results into `rets`.
pub fn call(func: &VmFunction, args: &[VmValue], rets: &mut ReturnBuffer) -> Result<usize, ScriptException> {
    let mut exc = JitExceptionInfo::new();
    let count = invoke(func, args, rets.slots_mut(), &mut exc);
    match exc.take() {
        Some(exception) => Err(exception),
        None => Ok(count as usize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::RegClass;
    use crate::vm::exception::AbortReason;

    #[test]
    fn test_native_results_and_errors() {
        let double = VmFunction::native("double", |args, rets| {
            rets.set_int(0, args[0].as_int() * 2)?;
            Ok(1)
        });
        let mut rets = ReturnBuffer::new(&[RegClass::Int]);
        assert_eq!(call(&double, &[VmValue::int(21)], &mut rets).unwrap(), 1);
        assert_eq!(rets.int(0), Some(42));

        let failing = VmFunction::native("failing", |_, _| Err(VmError::Native("nope".into())));
        let err = call(&failing, &[], &mut ReturnBuffer::empty()).unwrap_err();
        assert_eq!(err.reason, AbortReason::Other);
        assert!(matches!(err.payload, Some(VmError::Native(_))));
    }

    #[test]
    fn test_native_panic_is_contained() {
        let panicking = VmFunction::native("panicking", |_, _| panic!("native bug"));
        let err = call(&panicking, &[], &mut ReturnBuffer::empty()).unwrap_err();
        assert!(matches!(err.payload, Some(VmError::Panic(_))));
    }

    #[test]
    fn test_count_clamped_to_capacity() {
        let many = VmFunction::native("many", |_, _| Ok(5));
        let mut rets = ReturnBuffer::new(&[RegClass::Int]);
        assert_eq!(call(&many, &[], &mut rets).unwrap(), 1);
    }
}
