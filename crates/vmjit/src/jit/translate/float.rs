//! Float arithmetic, FLOP and float compares

use cranelift_codegen::ir::condcodes::FloatCC;
use cranelift_codegen::ir::{InstBuilder, Value};

use super::Translator;
use crate::bytecode::opcode::*;
use crate::bytecode::RegClass;
use crate::jit::runtime::helpers::Helper;
use crate::vm::exception::AbortReason;

impl Translator<'_, '_> {
    fn float_operands(&mut self, ins: Instr, form: OperandForm, dst: Option<usize>) -> (Value, Value) {
        let (b, c) = (ins.b as usize, ins.c as usize);
        match form {
            OperandForm::RK => {
                let l = self.use_f(b);
                (l, self.konst_f(c))
            }
            OperandForm::KR => {
                let l = self.konst_f(b);
                (l, self.use_f(c))
            }
            _ => match dst {
                Some(a) => {
                    let l = self.check_reg_f(b, a);
                    let r = self.check_reg_f(c, a);
                    (l, r)
                }
                None => {
                    let l = self.use_f(b);
                    (l, self.use_f(c))
                }
            },
        }
    }

    fn abort_on_zero_float(&mut self, r: Value) {
        let zero = self.e.b.ins().f64const(0.0);
        let is_zero = self.e.b.ins().fcmp(FloatCC::Equal, r, zero);
        self.emit_abort_if(is_zero, AbortReason::DivisionByZero, None);
    }

    pub(super) fn emit_float_binop(&mut self, ins: Instr, op: FloatBinOp, form: OperandForm) {
        let (l, r) = self.float_operands(ins, form, Some(ins.a as usize));
        let value = match op {
            FloatBinOp::Add => self.e.b.ins().fadd(l, r),
            FloatBinOp::Sub => self.e.b.ins().fsub(l, r),
            FloatBinOp::Mul => self.e.b.ins().fmul(l, r),
            FloatBinOp::Div => {
                self.abort_on_zero_float(r);
                self.e.b.ins().fdiv(l, r)
            }
            FloatBinOp::Mod => {
                // l - floor(l / r) * r
                self.abort_on_zero_float(r);
                let quotient = self.e.b.ins().fdiv(l, r);
                let floored = self.e.b.ins().floor(quotient);
                let product = self.e.b.ins().fmul(floored, r);
                self.e.b.ins().fsub(l, product)
            }
            FloatBinOp::Pow => self.call(Helper::FloatPow, &[l, r]),
            FloatBinOp::Atan2 => self.call(Helper::FloatAtan2, &[l, r]),
            // unordered operands select the right-hand side
            FloatBinOp::Min => {
                let less = self.e.b.ins().fcmp(FloatCC::LessThan, l, r);
                self.e.b.ins().select(less, l, r)
            }
            FloatBinOp::Max => {
                let greater = self.e.b.ins().fcmp(FloatCC::GreaterThan, l, r);
                self.e.b.ins().select(greater, l, r)
            }
        };
        self.def_reg(RegClass::Float, ins.a as usize, value);
    }

    pub(super) fn emit_flop(&mut self, ins: Instr) {
        let x = self.use_f(ins.b as usize);
        let value = match ins.c {
            FLOP_ABS => self.e.b.ins().fabs(x),
            FLOP_NEG => self.e.b.ins().fneg(x),
            FLOP_SQRT => self.e.b.ins().sqrt(x),
            FLOP_CEIL => self.e.b.ins().ceil(x),
            FLOP_FLOOR => self.e.b.ins().floor(x),
            code => {
                let code = self.iconst_i32(code as i32);
                self.call(Helper::FloatOp, &[code, x])
            }
        };
        self.def_reg(RegClass::Float, ins.a as usize, value);
    }

    pub(super) fn emit_float_compare(&mut self, ins: Instr, cmp: FloatCmp, form: OperandForm) {
        let (l, r) = self.float_operands(ins, form, None);
        let test = match cmp {
            FloatCmp::Eq if ins.a & CMP_APPROX != 0 => {
                let diff = self.e.b.ins().fsub(l, r);
                let distance = self.e.b.ins().fabs(diff);
                let epsilon = self.e.b.ins().f64const(VM_EPSILON);
                self.e.b.ins().fcmp(FloatCC::LessThan, distance, epsilon)
            }
            FloatCmp::Eq => self.e.b.ins().fcmp(FloatCC::Equal, l, r),
            FloatCmp::Lt => self.e.b.ins().fcmp(FloatCC::LessThan, l, r),
            FloatCmp::Le => self.e.b.ins().fcmp(FloatCC::LessThanOrEqual, l, r),
        };
        self.emit_compare_skip(test, ins.a & CMP_CHECK != 0);
    }
}
