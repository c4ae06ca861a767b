//! Native routines called from generated code
//!
//! Every routine is `extern "C"` and is reached through `call_indirect` on its
//! address. Routines that can fail take the caller's exception record, run
//! their body under `catch_unwind` and report failures by raising it; the
//! generated code checks the record after the call.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use cranelift_codegen::ir::types::{F64, I32, I64};
use cranelift_codegen::ir::Type;

use crate::bytecode::{Instr, ScriptFunction};
use crate::vm::call;
use crate::vm::exception::{Abort, JitExceptionInfo, VmError};
use crate::vm::frame::FrameStack;
use crate::vm::function::VmFunction;
use crate::vm::heap;
use crate::vm::ops;
use crate::vm::value::{VmReturn, VmValue};

/// Runtime routines available to generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    PushFrame,
    PopFrame,
    Call,
    AllocObject,
    ThrowObject,
    StringAssign,
    StringConcat,
    StringLen,
    StringCompare,
    StringFromInt,
    StringFromUint,
    StringFromFloat,
    StringToInt,
    StringToFloat,
    SetReturnString,
    FloatPow,
    FloatAtan2,
    FloatOp,
}

impl Helper {
    pub const COUNT: usize = 18;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Helper::PushFrame => "push_frame",
            Helper::PopFrame => "pop_frame",
            Helper::Call => "call",
            Helper::AllocObject => "alloc_object",
            Helper::ThrowObject => "throw_object",
            Helper::StringAssign => "string_assign",
            Helper::StringConcat => "string_concat",
            Helper::StringLen => "string_len",
            Helper::StringCompare => "string_compare",
            Helper::StringFromInt => "string_from_int",
            Helper::StringFromUint => "string_from_uint",
            Helper::StringFromFloat => "string_from_float",
            Helper::StringToInt => "string_to_int",
            Helper::StringToFloat => "string_to_float",
            Helper::SetReturnString => "set_return_string",
            Helper::FloatPow => "float_pow",
            Helper::FloatAtan2 => "float_atan2",
            Helper::FloatOp => "float_op",
        }
    }

    /// Address of the routine.
    pub fn address(self) -> usize {
        match self {
            Helper::PushFrame => push_frame as *const () as usize,
            Helper::PopFrame => pop_frame as *const () as usize,
            Helper::Call => call_function as *const () as usize,
            Helper::AllocObject => alloc_object as *const () as usize,
            Helper::ThrowObject => throw_object as *const () as usize,
            Helper::StringAssign => string_assign as *const () as usize,
            Helper::StringConcat => string_concat as *const () as usize,
            Helper::StringLen => string_len as *const () as usize,
            Helper::StringCompare => string_compare as *const () as usize,
            Helper::StringFromInt => string_from_int as *const () as usize,
            Helper::StringFromUint => string_from_uint as *const () as usize,
            Helper::StringFromFloat => string_from_float as *const () as usize,
            Helper::StringToInt => string_to_int as *const () as usize,
            Helper::StringToFloat => string_to_float as *const () as usize,
            Helper::SetReturnString => set_return_string as *const () as usize,
            Helper::FloatPow => float_pow as *const () as usize,
            Helper::FloatAtan2 => float_atan2 as *const () as usize,
            Helper::FloatOp => float_op as *const () as usize,
        }
    }

    /// Cranelift parameter types, pointers as `I64`.
    pub fn params(self) -> &'static [Type] {
        match self {
            Helper::PushFrame => &[I64, I64, I32, I64],
            Helper::PopFrame => &[I64, I64],
            Helper::Call => &[I64, I64, I32, I64, I32, I64, I64],
            Helper::AllocObject => &[I32, I64, I64],
            Helper::ThrowObject => &[I64, I64, I64],
            Helper::StringAssign | Helper::SetReturnString => &[I64, I64],
            Helper::StringConcat => &[I64, I64, I64],
            Helper::StringLen | Helper::StringToInt | Helper::StringToFloat => &[I64],
            Helper::StringCompare => &[I32, I64, I64],
            Helper::StringFromInt | Helper::StringFromUint => &[I64, I32],
            Helper::StringFromFloat => &[I64, F64],
            Helper::FloatPow | Helper::FloatAtan2 => &[F64, F64],
            Helper::FloatOp => &[I32, F64],
        }
    }

    pub fn returns(self) -> &'static [Type] {
        match self {
            Helper::PushFrame | Helper::AllocObject => &[I64],
            Helper::Call | Helper::StringLen | Helper::StringCompare | Helper::StringToInt => &[I32],
            Helper::StringToFloat | Helper::FloatPow | Helper::FloatAtan2 | Helper::FloatOp => &[F64],
            _ => &[],
        }
    }
}

/// Run `body` against the exception record, converting a panic into an abort.
///
/// # Safety
/// `exc` must point at a live exception record.
unsafe fn guarded<R>(
    exc: *mut JitExceptionInfo,
    pc: *const Instr,
    fallback: R,
    body: impl FnOnce(&mut JitExceptionInfo) -> R,
) -> R {
    let exc = &mut *exc;
    match catch_unwind(AssertUnwindSafe(|| body(&mut *exc))) {
        Ok(result) => result,
        Err(panic) => {
            exc.raise(Abort::error(VmError::from_panic(panic)), pc);
            fallback
        }
    }
}

unsafe fn slice<'a, T>(data: *const T, len: i32) -> &'a [T] {
    if data.is_null() || len <= 0 {
        &[]
    } else {
        std::slice::from_raw_parts(data, len as usize)
    }
}

unsafe fn slice_mut<'a, T>(data: *mut T, len: i32) -> &'a mut [T] {
    if data.is_null() || len <= 0 {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(data, len as usize)
    }
}

/// Push a frame for `func` on the calling thread's frame stack.
/// Returns the frame stack, or null after raising `exc`.
pub unsafe extern "C" fn push_frame(
    func: *const ScriptFunction,
    args: *const VmValue,
    argc: i32,
    exc: *mut JitExceptionInfo,
) -> *const FrameStack {
    guarded(exc, ptr::null(), ptr::null(), |exc| {
        let args = slice(args, argc);
        FrameStack::with(|stack| match stack.push(&*func, args) {
            Ok(_) => stack as *const FrameStack,
            Err(e) => {
                exc.raise(Abort::error(e), ptr::null());
                ptr::null()
            }
        })
    })
}

/// Pop the innermost frame. A null stack (failed push) is ignored.
pub unsafe extern "C" fn pop_frame(stack: *const FrameStack, exc: *mut JitExceptionInfo) {
    if stack.is_null() {
        return;
    }
    guarded(exc, ptr::null(), (), |exc| {
        if let Err(e) = (&*stack).pop() {
            if !exc.is_raised() {
                exc.raise(Abort::error(e), ptr::null());
            }
        }
    })
}

/// CALL / CALL_K. Exceptions without an address are attributed to `pc`.
pub unsafe extern "C" fn call_function(
    func: *const VmFunction,
    params: *const VmValue,
    nparams: i32,
    rets: *mut VmReturn,
    nrets: i32,
    pc: *const Instr,
    exc: *mut JitExceptionInfo,
) -> i32 {
    guarded(exc, pc, 0, |exc| {
        let count = call::invoke(&*func, slice(params, nparams), slice_mut(rets, nrets), exc);
        exc.attribute_to(pc);
        count
    })
}

/// NEW / NEW_K
pub unsafe extern "C" fn alloc_object(size: i32, pc: *const Instr, exc: *mut JitExceptionInfo) -> *mut u8 {
    guarded(exc, pc, ptr::null_mut(), |exc| match heap::alloc(size) {
        Ok(object) => object,
        Err(abort) => {
            exc.raise(abort, pc);
            ptr::null_mut()
        }
    })
}

pub unsafe extern "C" fn throw_object(object: *mut u8, pc: *const Instr, exc: *mut JitExceptionInfo) {
    let error = VmError::Thrown { object: object as usize };
    (&mut *exc).raise(Abort::error(error), pc);
}

pub unsafe extern "C" fn string_assign(dst: *mut String, src: *const String) {
    if !ptr::eq(dst, src) {
        (&mut *dst).clone_from(&*src);
    }
}

pub unsafe extern "C" fn string_concat(dst: *mut String, l: *const String, r: *const String) {
    let joined = format!("{}{}", &*l, &*r);
    *dst = joined;
}

pub unsafe extern "C" fn string_len(s: *const String) -> i32 {
    (&*s).len() as i32
}

pub unsafe extern "C" fn string_compare(flags: i32, l: *const String, r: *const String) -> i32 {
    ops::string_compare(flags as u8, &*l, &*r) as i32
}

pub unsafe extern "C" fn string_from_int(dst: *mut String, value: i32) {
    *dst = ops::int_to_string(value);
}

pub unsafe extern "C" fn string_from_uint(dst: *mut String, value: i32) {
    *dst = ops::uint_to_string(value);
}

pub unsafe extern "C" fn string_from_float(dst: *mut String, value: f64) {
    *dst = ops::float_to_string(value);
}

pub unsafe extern "C" fn string_to_int(s: *const String) -> i32 {
    ops::string_to_int(&*s)
}

pub unsafe extern "C" fn string_to_float(s: *const String) -> f64 {
    ops::string_to_float(&*s)
}

/// Store a string result into a caller's `String` return location.
pub unsafe extern "C" fn set_return_string(location: *mut u8, src: *const String) {
    VmReturn { location, reg_type: crate::bytecode::opcode::REGT_STRING }.set_string(&*src);
}

pub extern "C" fn float_pow(l: f64, r: f64) -> f64 {
    l.powf(r)
}

pub extern "C" fn float_atan2(y: f64, x: f64) -> f64 {
    ops::atan2_deg(y, x)
}

pub extern "C" fn float_op(code: i32, x: f64) -> f64 {
    ops::flop(code as u8, x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::{CMP_APPROX, CMP_LT, FLOP_ROUND};
    use crate::vm::exception::AbortReason;

    const ALL: [Helper; Helper::COUNT] = [
        Helper::PushFrame,
        Helper::PopFrame,
        Helper::Call,
        Helper::AllocObject,
        Helper::ThrowObject,
        Helper::StringAssign,
        Helper::StringConcat,
        Helper::StringLen,
        Helper::StringCompare,
        Helper::StringFromInt,
        Helper::StringFromUint,
        Helper::StringFromFloat,
        Helper::StringToInt,
        Helper::StringToFloat,
        Helper::SetReturnString,
        Helper::FloatPow,
        Helper::FloatAtan2,
        Helper::FloatOp,
    ];

    #[test]
    fn test_helper_table_is_dense() {
        for (i, helper) in ALL.iter().enumerate() {
            assert_eq!(helper.index(), i);
            assert_ne!(helper.address(), 0, "{}", helper.name());
            assert!(helper.returns().len() <= 1);
        }
    }

    #[test]
    fn test_string_helpers() {
        let mut dst = String::from("old");
        let l = String::from("Foo");
        let r = String::from("bar");
        unsafe {
            string_concat(&mut dst, &l, &r);
            assert_eq!(dst, "Foobar");
            assert_eq!(string_len(&dst), 6);
            // self-concatenation reads both operands before assigning
            let p = &mut dst as *mut String;
            string_concat(p, p, p);
            assert_eq!(dst, "FoobarFoobar");
            assert_eq!(string_compare(CMP_LT as i32, &r, &l), 0);
            assert_eq!(string_compare((CMP_LT | CMP_APPROX) as i32, &r, &l), 1);
            string_from_uint(&mut dst, -1);
            assert_eq!(dst, "4294967295");
        }
    }

    #[test]
    fn test_alloc_failure_raises_with_pc() {
        let code = [Instr::default()];
        let mut exc = JitExceptionInfo::new();
        let object = unsafe { alloc_object(-4, &code[0], &mut exc) };
        assert!(object.is_null());
        assert_eq!(exc.reason(), Some(AbortReason::ArrayTooLarge));
        assert_eq!(exc.arg, -4);
        assert_eq!(exc.pc, &code[0] as *const Instr);
    }

    #[test]
    fn test_pop_of_failed_push_is_ignored() {
        let mut exc = JitExceptionInfo::new();
        unsafe { pop_frame(ptr::null(), &mut exc) };
        assert!(!exc.is_raised());
    }

    #[test]
    fn test_float_op_round_half_away_from_zero() {
        assert_eq!(float_op(FLOP_ROUND as i32, 2.5), 3.0);
        assert_eq!(float_op(FLOP_ROUND as i32, -2.5), -3.0);
        assert_eq!(float_atan2(1.0, 1.0), 45.0);
    }
}
