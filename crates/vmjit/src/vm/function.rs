//! Callable function objects

use std::fmt;
use std::sync::Arc;

use crate::bytecode::ScriptFunction;
use crate::vm::exception::VmError;
use crate::vm::value::{ReturnSlots, VmValue};

/// Body of a native function: receives the arguments and the caller's return
/// slots, reports how many values it produced.
pub type NativeFn = dyn Fn(&[VmValue], &mut ReturnSlots<'_>) -> Result<usize, VmError> + Send + Sync;

#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub body: Arc<NativeFn>,
}

/// A function reachable from bytecode through CALL or CALL_K.
#[derive(Clone)]
pub enum VmFunction {
    Script(Arc<ScriptFunction>),
    Native(NativeFunction),
}

impl VmFunction {
    pub fn native<F>(name: impl Into<String>, body: F) -> Arc<VmFunction>
    where
        F: Fn(&[VmValue], &mut ReturnSlots<'_>) -> Result<usize, VmError> + Send + Sync + 'static,
    {
        Arc::new(VmFunction::Native(NativeFunction { name: name.into(), body: Arc::new(body) }))
    }

    pub fn script(func: Arc<ScriptFunction>) -> Arc<VmFunction> {
        Arc::new(VmFunction::Script(func))
    }

    pub fn name(&self) -> &str {
        match self {
            VmFunction::Script(func) => func.name(),
            VmFunction::Native(native) => &native.name,
        }
    }
}

impl fmt::Debug for VmFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmFunction::Script(func) => f.debug_tuple("Script").field(func).finish(),
            VmFunction::Native(native) => f.debug_tuple("Native").field(&native.name).finish(),
        }
    }
}
