//! Integer arithmetic, integer compares and CAST

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, InstBuilder, Value};

use super::Translator;
use crate::bytecode::opcode::*;
use crate::bytecode::RegClass;
use crate::jit::error::JitError;
use crate::jit::runtime::helpers::Helper;
use crate::vm::exception::AbortReason;

impl Translator<'_, '_> {
    /// Source operands; `dst` is the register the result goes to, if any.
    fn int_operands(&mut self, ins: Instr, form: OperandForm, immediate: i32, dst: Option<usize>) -> (Value, Value) {
        let (b, c) = (ins.b as usize, ins.c as usize);
        match form {
            OperandForm::RR => match dst {
                Some(a) => {
                    let l = self.check_reg_d(b, a);
                    let r = self.check_reg_d(c, a);
                    (l, r)
                }
                None => {
                    let l = self.use_d(b);
                    (l, self.use_d(c))
                }
            },
            OperandForm::RK => {
                let l = self.use_d(b);
                (l, self.konst_d(c))
            }
            OperandForm::KR => {
                let l = self.konst_d(b);
                (l, self.use_d(c))
            }
            OperandForm::RI => {
                let l = self.use_d(b);
                (l, self.iconst_i32(immediate))
            }
        }
    }

    fn abort_on_zero_divisor(&mut self, r: Value) {
        let zero = self.e.b.ins().icmp_imm(IntCC::Equal, r, 0);
        self.emit_abort_if(zero, AbortReason::DivisionByZero, None);
    }

    /// Divisor for signed division: `MIN / -1` wraps, so divide by 1 instead.
    fn overflow_safe_divisor(&mut self, l: Value, r: Value) -> Value {
        let min = self.iconst_i32(i32::MIN);
        let minus_one = self.iconst_i32(-1);
        let one = self.iconst_i32(1);
        let l_min = self.e.b.ins().icmp(IntCC::Equal, l, min);
        let r_neg = self.e.b.ins().icmp(IntCC::Equal, r, minus_one);
        let overflow = self.e.b.ins().band(l_min, r_neg);
        self.e.b.ins().select(overflow, one, r)
    }

    pub(super) fn emit_int_binop(&mut self, ins: Instr, op: IntBinOp, form: OperandForm, immediate: i32) {
        let (l, r) = self.int_operands(ins, form, immediate, Some(ins.a as usize));
        let value = match op {
            IntBinOp::Add => self.e.b.ins().iadd(l, r),
            IntBinOp::Sub => self.e.b.ins().isub(l, r),
            IntBinOp::Mul => self.e.b.ins().imul(l, r),
            IntBinOp::And => self.e.b.ins().band(l, r),
            IntBinOp::Or => self.e.b.ins().bor(l, r),
            IntBinOp::Xor => self.e.b.ins().bxor(l, r),
            // shift counts are taken modulo 32
            IntBinOp::Shl => self.e.b.ins().ishl(l, r),
            IntBinOp::Shr => self.e.b.ins().ushr(l, r),
            IntBinOp::Sar => self.e.b.ins().sshr(l, r),
            IntBinOp::Div | IntBinOp::Mod => {
                self.abort_on_zero_divisor(r);
                let r = self.overflow_safe_divisor(l, r);
                if op == IntBinOp::Div {
                    self.e.b.ins().sdiv(l, r)
                } else {
                    self.e.b.ins().srem(l, r)
                }
            }
            IntBinOp::Divu => {
                self.abort_on_zero_divisor(r);
                self.e.b.ins().udiv(l, r)
            }
            IntBinOp::Modu => {
                self.abort_on_zero_divisor(r);
                self.e.b.ins().urem(l, r)
            }
            IntBinOp::Min => {
                let less = self.e.b.ins().icmp(IntCC::SignedLessThan, l, r);
                self.e.b.ins().select(less, l, r)
            }
            IntBinOp::Max => {
                let greater = self.e.b.ins().icmp(IntCC::SignedGreaterThan, l, r);
                self.e.b.ins().select(greater, l, r)
            }
        };
        self.def_reg(RegClass::Int, ins.a as usize, value);
    }

    pub(super) fn emit_int_unary(&mut self, ins: Instr, op: Opcode) {
        let x = self.use_d(ins.b as usize);
        let value = match op {
            Opcode::Abs => self.e.b.ins().iabs(x),
            Opcode::Neg => self.e.b.ins().ineg(x),
            Opcode::Not => self.e.b.ins().bnot(x),
            _ if ins.c >= 32 => x,
            _ => {
                let shift = 32 - ins.c as i64;
                let high = self.e.b.ins().ishl_imm(x, shift);
                self.e.b.ins().sshr_imm(high, shift)
            }
        };
        self.def_reg(RegClass::Int, ins.a as usize, value);
    }

    pub(super) fn emit_int_compare(&mut self, ins: Instr, cmp: IntCmp, form: OperandForm) {
        let (l, r) = self.int_operands(ins, form, 0, None);
        let cc = match cmp {
            IntCmp::Eq => IntCC::Equal,
            IntCmp::Lt => IntCC::SignedLessThan,
            IntCmp::Le => IntCC::SignedLessThanOrEqual,
            IntCmp::Ltu => IntCC::UnsignedLessThan,
            IntCmp::Leu => IntCC::UnsignedLessThanOrEqual,
        };
        let test = self.e.b.ins().icmp(cc, l, r);
        self.emit_compare_skip(test, ins.a & CMP_CHECK != 0);
    }

    pub(super) fn emit_cast(&mut self, ins: Instr) -> Result<(), JitError> {
        let (a, b) = (ins.a as usize, ins.b as usize);
        match ins.c {
            CAST_I2F | CAST_U2F => {
                let x = self.use_d(b);
                let value = if ins.c == CAST_I2F {
                    self.e.b.ins().fcvt_from_sint(types::F64, x)
                } else {
                    self.e.b.ins().fcvt_from_uint(types::F64, x)
                };
                self.def_reg(RegClass::Float, a, value);
            }
            CAST_F2I | CAST_F2U => {
                // saturating, NaN converts to 0
                let x = self.use_f(b);
                let value = if ins.c == CAST_F2I {
                    self.e.b.ins().fcvt_to_sint_sat(types::I32, x)
                } else {
                    self.e.b.ins().fcvt_to_uint_sat(types::I32, x)
                };
                self.def_reg(RegClass::Int, a, value);
            }
            CAST_I2S | CAST_U2S => {
                let dst = self.use_s(a);
                let x = self.use_d(b);
                let helper = if ins.c == CAST_I2S { Helper::StringFromInt } else { Helper::StringFromUint };
                self.call(helper, &[dst, x]);
            }
            CAST_F2S => {
                let dst = self.use_s(a);
                let x = self.use_f(b);
                self.call(Helper::StringFromFloat, &[dst, x]);
            }
            CAST_S2I => {
                let src = self.use_s(b);
                let value = self.call(Helper::StringToInt, &[src]);
                self.def_reg(RegClass::Int, a, value);
            }
            CAST_S2F => {
                let src = self.use_s(b);
                let value = self.call(Helper::StringToFloat, &[src]);
                self.def_reg(RegClass::Float, a, value);
            }
            other => return Err(self.malformed(format!("unknown cast kind {other}"))),
        }
        Ok(())
    }
}
