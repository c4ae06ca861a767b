//! Jumps, tests, returns, THROW and bounds checks

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, InstBuilder, Value};

use super::Translator;
use crate::bytecode::opcode::*;
use crate::bytecode::RegClass;
use crate::jit::backend::abi;
use crate::jit::runtime::helpers::Helper;
use crate::vm::exception::{AbortReason, NO_EXCEPTION};

impl Translator<'_, '_> {
    pub(super) fn emit_jmp(&mut self, ins: Instr) {
        let target = (self.pc as i64 + 1 + ins.abc() as i64) as usize;
        let block = self.e.label(target);
        self.e.jump(block);
    }

    /// Compare-and-skip: skip the next instruction when `test != check`.
    pub(super) fn emit_compare_skip(&mut self, test: Value, check: bool) {
        let next = self.next_label();
        let skip = self.skip_label();
        if check {
            self.e.branch(test, next, skip);
        } else {
            self.e.branch(test, skip, next);
        }
    }

    pub(super) fn emit_test(&mut self, ins: Instr, negate: bool) {
        let mut value = self.use_d(ins.a as usize);
        if negate {
            value = self.e.b.ins().ineg(value);
        }
        let differs = self.e.b.ins().icmp_imm(IntCC::NotEqual, value, ins.bc() as i64);
        let next = self.next_label();
        let skip = self.skip_label();
        self.e.branch(differs, skip, next);
    }

    /// Pop the frame and return `count`, or 0 if popping raised an exception.
    fn emit_return(&mut self, count: Value) {
        let stack = self.e.b.use_var(self.env.stack);
        let exc = self.exc();
        self.call(Helper::PopFrame, &[stack, exc]);
        let reason = self.e.b.ins().load(types::I32, abi::trusted(), exc, abi::EXC_REASON);
        let none = self.iconst_i32(NO_EXCEPTION);
        let clean = self.e.b.ins().icmp(IntCC::Equal, reason, none);
        let zero = self.iconst_i32(0);
        let result = self.e.b.ins().select(clean, count, zero);
        self.e.b.ins().return_(&[result]);
    }

    pub(super) fn emit_ret(&mut self, ins: Instr) {
        if ins.b == REGT_NIL {
            let zero = self.iconst_i32(0);
            self.emit_return(zero);
            return;
        }
        let class = RegClass::from_regtype(ins.b);
        let from_konst = ins.b & REGT_KONST != 0;
        let index = ins.c as usize;
        self.emit_return_value(ins.a, class, |t| match (class, from_konst) {
            (RegClass::Int, false) => t.use_d(index),
            (RegClass::Int, true) => t.konst_d(index),
            (RegClass::Float, false) => t.use_f(index),
            (RegClass::Float, true) => t.konst_f(index),
            (RegClass::String, false) => t.use_s(index),
            (RegClass::String, true) => t.konst_s(index),
            (RegClass::Pointer, false) => t.use_a(index),
            (RegClass::Pointer, true) => t.konst_a(index),
        });
    }

    pub(super) fn emit_reti(&mut self, ins: Instr) {
        let value = ins.bc_signed() as i32;
        self.emit_return_value(ins.a, RegClass::Int, |t| t.iconst_i32(value));
    }

    /// Store one return value into slot `retnum` if the caller provided it;
    /// a final return then leaves with `min(retnum + 1, numret)`.
    fn emit_return_value(&mut self, a: u8, class: RegClass, value: impl FnOnce(&mut Self) -> Value) {
        let retnum = (a & !RET_FINAL) as i64;
        let numret = self.e.b.use_var(self.env.numret);

        let write = self.e.b.create_block();
        let after = self.e.b.create_block();
        let present = self.e.b.ins().icmp_imm(IntCC::SignedGreaterThan, numret, retnum);
        self.e.b.ins().brif(present, write, &[], after, &[]);

        self.e.b.switch_to_block(write);
        let rets = self.e.b.use_var(self.env.rets);
        let slot = self.e.b.ins().iadd_imm(rets, retnum * abi::RETURN_SIZE as i64);
        let tag = self.e.b.ins().uload8(types::I32, abi::trusted(), slot, abi::RETURN_TYPE);
        let slot_class = self.e.b.ins().band_imm(tag, REGT_TYPE as i64);
        let mismatch = self.e.b.ins().icmp_imm(IntCC::NotEqual, slot_class, class.regtype() as i64);
        self.emit_abort_if(mismatch, AbortReason::Other, None);

        let location = self.e.b.ins().load(types::I64, abi::trusted(), slot, abi::RETURN_LOCATION);
        let value = value(self);
        match class {
            RegClass::String => {
                self.call(Helper::SetReturnString, &[location, value]);
            }
            _ => {
                self.e.b.ins().store(abi::user(), value, location, 0);
            }
        }
        self.e.jump(after);
        self.e.b.switch_to_block(after);

        if a & RET_FINAL != 0 {
            let numret = self.e.b.use_var(self.env.numret);
            let written = self.iconst_i32(retnum as i32 + 1);
            let short = self.e.b.ins().icmp(IntCC::SignedLessThan, numret, written);
            let count = self.e.b.ins().select(short, numret, written);
            self.emit_return(count);
        }
    }

    pub(super) fn emit_throw_object(&mut self, ins: Instr) {
        let index = ins.bc() as usize;
        let object = if ins.a == 0 { self.use_a(index) } else { self.konst_a(index) };
        let pc = self.pc_addr();
        let exc = self.exc();
        self.call(Helper::ThrowObject, &[object, pc, exc]);
        let unwind = self.e.unwind_block();
        self.e.jump(unwind);
    }

    pub(super) fn emit_bound(&mut self, ins: Instr, op: Opcode) {
        let index = self.use_d(ins.a as usize);
        let limit = match op {
            Opcode::Bound => self.iconst_i32(ins.bc() as i32),
            Opcode::BoundK => self.konst_d(ins.bc() as usize),
            _ => self.use_d(ins.b as usize),
        };
        let out = self.e.b.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, index, limit);
        self.emit_abort_if(out, AbortReason::ArrayOutOfBounds, Some(index));
    }
}
