//! Native ABI shared by generated code and the runtime
//!
//! Signatures of the entry point and of every helper routine, plus the byte
//! offsets of the `#[repr(C)]` structures generated code reads and writes.

use std::mem::{offset_of, size_of};

use cranelift_codegen::ir::{types, AbiParam, MemFlags, Signature};
use cranelift_codegen::isa::CallConv;

use crate::bytecode::opcode::MAX_RETURNS;
use crate::jit::runtime::helpers::Helper;
use crate::vm::exception::JitExceptionInfo;
use crate::vm::value::{VmReturn, VmValue};

pub const EXC_REASON: i32 = offset_of!(JitExceptionInfo, reason) as i32;
pub const EXC_ARG: i32 = offset_of!(JitExceptionInfo, arg) as i32;
pub const EXC_PC: i32 = offset_of!(JitExceptionInfo, pc) as i32;

pub const VALUE_BITS: i32 = offset_of!(VmValue, bits) as i32;
pub const VALUE_TAG: i32 = offset_of!(VmValue, tag) as i32;
pub const VALUE_SIZE: usize = size_of::<VmValue>();

pub const RETURN_LOCATION: i32 = offset_of!(VmReturn, location) as i32;
pub const RETURN_TYPE: i32 = offset_of!(VmReturn, reg_type) as i32;
pub const RETURN_SIZE: usize = size_of::<VmReturn>();

/// Scratch stack slot: `MAX_RETURNS` return records followed by one 8-byte
/// value cell per record.
pub const SCRATCH_RETURNS: u32 = 0;
pub const SCRATCH_CELLS: u32 = (MAX_RETURNS * RETURN_SIZE) as u32;
pub const SCRATCH_SIZE: u32 = SCRATCH_CELLS + (MAX_RETURNS * 8) as u32;
pub const SCRATCH_ALIGN_SHIFT: u8 = 4;

/// Entry point signature:
/// `(args: *const VmValue, numargs: i32, rets: *mut VmReturn, numret: i32, exc: *mut JitExceptionInfo) -> i32`
pub fn entry_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // args
    sig.params.push(AbiParam::new(types::I32)); // numargs
    sig.params.push(AbiParam::new(types::I64)); // rets
    sig.params.push(AbiParam::new(types::I32)); // numret
    sig.params.push(AbiParam::new(types::I64)); // exc
    sig.returns.push(AbiParam::new(types::I32));
    sig
}

pub fn helper_signature(helper: Helper, call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.extend(helper.params().iter().map(|ty| AbiParam::new(*ty)));
    sig.returns.extend(helper.returns().iter().map(|ty| AbiParam::new(*ty)));
    sig
}

/// Frame slots, exception records and return records: always valid and aligned.
pub fn trusted() -> MemFlags {
    MemFlags::trusted()
}

/// Script-controlled addresses: non-null after the guard, alignment unknown.
pub fn user() -> MemFlags {
    MemFlags::new()
}
