//! Abort and propagation primitives
//!
//! The only two ways generated code leaves a function abnormally: an
//! unconditional abort that fills in the exception record, and the check
//! after a fallible helper call. Both end in the unwind block, which pops
//! the frame and returns 0.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, InstBuilder, Value};

use super::Translator;
use crate::jit::backend::abi;
use crate::vm::exception::{AbortReason, NO_EXCEPTION};

impl Translator<'_, '_> {
    /// Abort with `reason` at the current instruction.
    pub(super) fn emit_throw(&mut self, reason: AbortReason) {
        let zero = self.iconst_i32(0);
        self.emit_throw_with_arg(reason, zero);
    }

    /// Abort with `reason` and an auxiliary argument at the current instruction.
    pub(super) fn emit_throw_with_arg(&mut self, reason: AbortReason, arg: Value) {
        let exc = self.exc();
        let reason = self.iconst_i32(reason as i32);
        let pc = self.pc_addr();
        self.e.b.ins().store(abi::trusted(), reason, exc, abi::EXC_REASON);
        self.e.b.ins().store(abi::trusted(), arg, exc, abi::EXC_ARG);
        self.e.b.ins().store(abi::trusted(), pc, exc, abi::EXC_PC);
        let unwind = self.e.unwind_block();
        self.e.jump(unwind);
    }

    /// Abort when `cond` is non-zero; code continues in a fresh block.
    pub(super) fn emit_abort_if(&mut self, cond: Value, reason: AbortReason, arg: Option<Value>) {
        let abort = self.e.b.create_block();
        let cont = self.e.b.create_block();
        self.e.b.ins().brif(cond, abort, &[], cont, &[]);

        self.e.b.switch_to_block(abort);
        match arg {
            Some(arg) => self.emit_throw_with_arg(reason, arg),
            None => self.emit_throw(reason),
        }
        self.e.b.switch_to_block(cont);
    }

    /// Leave through the unwind block if a helper raised the exception record.
    pub(super) fn emit_check_for_exception(&mut self) {
        let exc = self.exc();
        let reason = self.e.b.ins().load(types::I32, abi::trusted(), exc, abi::EXC_REASON);
        let none = self.iconst_i32(NO_EXCEPTION);
        let raised = self.e.b.ins().icmp(IntCC::NotEqual, reason, none);
        let unwind = self.e.unwind_block();
        let cont = self.e.b.create_block();
        self.e.b.ins().brif(raised, unwind, &[], cont, &[]);
        self.e.b.switch_to_block(cont);
    }

    /// Abort with `reason` when `ptr` is null.
    pub(super) fn emit_null_guard(&mut self, ptr: Value, reason: AbortReason) {
        let is_null = self.e.b.ins().icmp_imm(IntCC::Equal, ptr, 0);
        self.emit_abort_if(is_null, reason, None);
    }
}
