//! PARAM, CALL and NEW
//!
//! Parameters are written into the frame's parameter area as tagged values.
//! A call hands the callee the last `b` of them and a table of return records
//! built in the scratch slot. Int, float and pointer results land in scratch
//! cells and are copied back into registers after the call; string results go
//! straight to the string register's frame slot.

use cranelift_codegen::ir::{types, InstBuilder, MemFlags, Value};

use super::Translator;
use crate::bytecode::opcode::*;
use crate::bytecode::RegClass;
use crate::jit::backend::abi;
use crate::jit::error::JitError;
use crate::jit::regmap::native_type;
use crate::jit::runtime::helpers::Helper;
use crate::vm::exception::AbortReason;

impl Translator<'_, '_> {
    fn param_slot(&mut self, index: usize) -> Value {
        let frame = self.frame();
        let offset = self.layout.params + index * abi::VALUE_SIZE;
        self.e.b.ins().iadd_imm(frame, offset as i64)
    }

    fn push_param(&mut self, bits: Value, tag: u8) -> Result<(), JitError> {
        if self.num_param >= self.func.max_param() {
            return Err(self.malformed(format!("parameter area of {} values overflowed", self.func.max_param())));
        }
        let slot = self.param_slot(self.num_param);
        let tag = self.e.b.ins().iconst(types::I8, tag as i64);
        self.e.b.ins().store(abi::trusted(), bits, slot, abi::VALUE_BITS);
        self.e.b.ins().store(abi::trusted(), tag, slot, abi::VALUE_TAG);
        self.num_param += 1;
        Ok(())
    }

    pub(super) fn emit_param(&mut self, ins: Instr) -> Result<(), JitError> {
        let flags = ins.a;
        if flags == REGT_NIL {
            let null = self.e.iconst_ptr(0);
            return self.push_param(null, REGT_POINTER);
        }
        let index = ins.bc() as usize;
        let class = RegClass::from_regtype(flags);
        let from_konst = flags & REGT_KONST != 0;
        let bits = match class {
            RegClass::Int => {
                let value = if from_konst { self.konst_d(index) } else { self.use_d(index) };
                self.e.b.ins().sextend(types::I64, value)
            }
            RegClass::Float => {
                let value = if from_konst { self.konst_f(index) } else { self.use_f(index) };
                self.e.b.ins().bitcast(types::I64, MemFlags::new(), value)
            }
            RegClass::String if from_konst => self.konst_s(index),
            RegClass::String => self.use_s(index),
            RegClass::Pointer if from_konst => self.konst_a(index),
            RegClass::Pointer => self.use_a(index),
        };
        self.push_param(bits, class.regtype())
    }

    pub(super) fn emit_param_imm(&mut self, ins: Instr) -> Result<(), JitError> {
        let bits = self.e.b.ins().iconst(types::I64, ins.abc() as i64);
        self.push_param(bits, REGT_INT)
    }

    pub(super) fn emit_call(&mut self, ins: Instr, op: Opcode) -> Result<(), JitError> {
        let (nparams, nrets) = (ins.b as usize, ins.c as usize);
        if nrets > MAX_RETURNS {
            return Err(self.malformed(format!("{nrets} results exceed the limit of {MAX_RETURNS}")));
        }
        let first = self
            .num_param
            .checked_sub(nparams)
            .ok_or_else(|| self.malformed(format!("call wants {nparams} parameters, {} pushed", self.num_param)))?;

        let callee = if op == Opcode::Call { self.use_a(ins.a as usize) } else { self.konst_a(ins.a as usize) };
        self.emit_null_guard(callee, AbortReason::ReadNil);

        let mut cells = Vec::with_capacity(nrets);
        for i in 0..nrets {
            let result = self.func.code()[self.pc + 1 + i];
            let class = RegClass::from_regtype(result.b);
            let index = result.c as usize;
            let location = match class {
                RegClass::String => self.use_s(index),
                _ => {
                    // The callee may return fewer values; keep the old one.
                    let offset = abi::SCRATCH_CELLS + (i * 8) as u32;
                    let cell = self.e.scratch_addr(offset);
                    let current = self.use_reg(class, index);
                    self.e.b.ins().store(abi::trusted(), current, cell, 0);
                    cells.push((class, index, offset));
                    cell
                }
            };
            let record = self.e.scratch_addr(abi::SCRATCH_RETURNS + (i * abi::RETURN_SIZE) as u32);
            let reg_type = self.e.b.ins().iconst(types::I8, class.regtype() as i64);
            self.e.b.ins().store(abi::trusted(), location, record, abi::RETURN_LOCATION);
            self.e.b.ins().store(abi::trusted(), reg_type, record, abi::RETURN_TYPE);
        }

        let params = self.param_slot(first);
        let nparams = self.iconst_i32(nparams as i32);
        let rets = self.e.scratch_addr(abi::SCRATCH_RETURNS);
        let nrets = self.iconst_i32(nrets as i32);
        let pc = self.pc_addr();
        let exc = self.exc();
        self.call(Helper::Call, &[callee, params, nparams, rets, nrets, pc, exc]);
        self.num_param = first;
        self.emit_check_for_exception();

        for (class, index, offset) in cells {
            let cell = self.e.scratch_addr(offset);
            let value = self.e.b.ins().load(native_type(class), abi::trusted(), cell, 0);
            self.def_reg(class, index, value);
        }
        Ok(())
    }

    pub(super) fn emit_new(&mut self, ins: Instr, op: Opcode) {
        let size = if op == Opcode::New { self.use_d(ins.b as usize) } else { self.konst_d(ins.bc() as usize) };
        let pc = self.pc_addr();
        let exc = self.exc();
        let object = self.call(Helper::AllocObject, &[size, pc, exc]);
        self.emit_check_for_exception();
        self.def_reg(RegClass::Pointer, ins.a as usize, object);
    }
}
