//! Out-of-band abort signalling shared by interpreted and generated code

use std::fmt;

use thiserror::Error;

use crate::bytecode::{Instr, ScriptFunction, VerifyError};

/// `JitExceptionInfo::reason` value meaning "no exception".
pub const NO_EXCEPTION: i32 = -1;

/// Why a function invocation terminated abnormally.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    Other = 0,
    ReadNil = 1,
    WriteNil = 2,
    ArrayOutOfBounds = 3,
    DivisionByZero = 4,
    ArrayTooLarge = 5,
}

impl AbortReason {
    pub fn from_raw(raw: i32) -> Option<AbortReason> {
        Some(match raw {
            0 => AbortReason::Other,
            1 => AbortReason::ReadNil,
            2 => AbortReason::WriteNil,
            3 => AbortReason::ArrayOutOfBounds,
            4 => AbortReason::DivisionByZero,
            5 => AbortReason::ArrayTooLarge,
            _ => return None,
        })
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::Other => "script error",
            AbortReason::ReadNil => "read from null pointer",
            AbortReason::WriteNil => "write to null pointer",
            AbortReason::ArrayOutOfBounds => "array index out of bounds",
            AbortReason::DivisionByZero => "division by zero",
            AbortReason::ArrayTooLarge => "allocation too large",
        };
        f.write_str(text)
    }
}

/// Failure payload carried alongside an abort reason.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("script threw object {object:#x}")]
    Thrown { object: usize },

    #[error("native function failed: {0}")]
    Native(String),

    #[error("frame stack overflow at depth {depth}")]
    StackOverflow { depth: usize },

    #[error("malformed bytecode: {0}")]
    Verify(#[from] VerifyError),

    #[error("malformed call: {0}")]
    Malformed(String),

    #[error("native code panicked: {0}")]
    Panic(String),
}

impl VmError {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> VmError {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        VmError::Panic(message)
    }
}

/// A synchronous abort raised while executing one instruction.
#[derive(Debug)]
pub struct Abort {
    pub reason: AbortReason,
    pub arg: i32,
    pub payload: Option<VmError>,
}

impl Abort {
    pub fn new(reason: AbortReason) -> Self {
        Abort { reason, arg: 0, payload: None }
    }

    pub fn with_arg(reason: AbortReason, arg: i32) -> Self {
        Abort { reason, arg, payload: None }
    }

    pub fn error(error: VmError) -> Self {
        Abort { reason: AbortReason::Other, arg: 0, payload: Some(error) }
    }
}

impl From<AbortReason> for Abort {
    fn from(reason: AbortReason) -> Self {
        Abort::new(reason)
    }
}

/// Exception record filled in by aborting code, caller-allocated.
///
/// Generated code writes `reason`, `arg` and `pc` directly; the offsets are
/// mirrored in `jit::backend::abi`.
#[repr(C)]
#[derive(Debug)]
pub struct JitExceptionInfo {
    pub reason: i32,
    pub arg: i32,
    pub pc: *const Instr,
    pub payload: Option<Box<VmError>>,
}

impl JitExceptionInfo {
    pub fn new() -> Self {
        JitExceptionInfo {
            reason: NO_EXCEPTION,
            arg: 0,
            pc: std::ptr::null(),
            payload: None,
        }
    }

    pub fn is_raised(&self) -> bool {
        self.reason != NO_EXCEPTION
    }

    pub fn reason(&self) -> Option<AbortReason> {
        if self.is_raised() {
            Some(AbortReason::from_raw(self.reason).unwrap_or(AbortReason::Other))
        } else {
            None
        }
    }

    pub fn raise(&mut self, abort: Abort, pc: *const Instr) {
        self.reason = abort.reason as i32;
        self.arg = abort.arg;
        self.pc = pc;
        self.payload = abort.payload.map(Box::new);
    }

    /// Attribute an exception that carries no address to `pc`.
    pub fn attribute_to(&mut self, pc: *const Instr) {
        if self.is_raised() && self.pc.is_null() {
            self.pc = pc;
        }
    }

    /// Convert a raised record into an error, resetting the record.
    pub fn take(&mut self) -> Option<ScriptException> {
        let reason = self.reason()?;
        let exception = ScriptException {
            reason,
            arg: self.arg,
            pc: self.pc as usize,
            payload: self.payload.take().map(|b| *b),
        };
        *self = JitExceptionInfo::new();
        Some(exception)
    }
}

impl Default for JitExceptionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// A script invocation that ended in an abort.
#[derive(Debug, Error)]
#[error("{reason} (arg {arg})")]
pub struct ScriptException {
    pub reason: AbortReason,
    pub arg: i32,
    /// Address of the faulting instruction, 0 when unknown.
    pub pc: usize,
    #[source]
    pub payload: Option<VmError>,
}

impl ScriptException {
    /// Index of the faulting instruction within `func`, if it belongs to it.
    pub fn instruction_index(&self, func: &ScriptFunction) -> Option<usize> {
        func.instruction_index(self.pc)
    }
}
