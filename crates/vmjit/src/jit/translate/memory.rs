//! Loads, stores, constants, moves and pointer arithmetic

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, InstBuilder, Value};

use super::Translator;
use crate::bytecode::opcode::*;
use crate::bytecode::RegClass;
use crate::jit::backend::abi;
use crate::jit::runtime::helpers::Helper;
use crate::vm::exception::AbortReason;

impl Translator<'_, '_> {
    /// `base + offset`, the offset taken from int register `c` or int constant `c`.
    fn effective_address(&mut self, base: Value, c: usize, from_register: bool) -> Value {
        if from_register {
            let offset = self.use_d(c);
            let offset = self.e.b.ins().sextend(types::I64, offset);
            self.e.b.ins().iadd(base, offset)
        } else {
            let offset = self.func.konst().ints[c] as i64;
            self.e.b.ins().iadd_imm(base, offset)
        }
    }

    pub(super) fn emit_load(&mut self, ins: Instr, kind: MemKind, from_register: bool) {
        let base = self.use_a(ins.b as usize);
        self.emit_null_guard(base, AbortReason::ReadNil);
        let addr = self.effective_address(base, ins.c as usize, from_register);

        let dst = ins.a as usize;
        let flags = abi::user();
        let ins_b = self.e.b.ins();
        let (class, value) = match kind {
            MemKind::I8 => (RegClass::Int, ins_b.sload8(types::I32, flags, addr, 0)),
            MemKind::U8 => (RegClass::Int, ins_b.uload8(types::I32, flags, addr, 0)),
            MemKind::I16 => (RegClass::Int, ins_b.sload16(types::I32, flags, addr, 0)),
            MemKind::U16 => (RegClass::Int, ins_b.uload16(types::I32, flags, addr, 0)),
            MemKind::I32 => (RegClass::Int, ins_b.load(types::I32, flags, addr, 0)),
            MemKind::F32 => {
                let narrow = ins_b.load(types::F32, flags, addr, 0);
                (RegClass::Float, self.e.b.ins().fpromote(types::F64, narrow))
            }
            MemKind::F64 => (RegClass::Float, ins_b.load(types::F64, flags, addr, 0)),
            MemKind::Ptr => (RegClass::Pointer, ins_b.load(types::I64, flags, addr, 0)),
        };
        self.def_reg(class, dst, value);
    }

    pub(super) fn emit_store(&mut self, ins: Instr, kind: MemKind, from_register: bool) {
        let base = self.use_a(ins.a as usize);
        self.emit_null_guard(base, AbortReason::WriteNil);
        let addr = self.effective_address(base, ins.c as usize, from_register);

        let src = ins.b as usize;
        let flags = abi::user();
        match kind {
            MemKind::I8 | MemKind::U8 => {
                let value = self.use_d(src);
                self.e.b.ins().istore8(flags, value, addr, 0);
            }
            MemKind::I16 | MemKind::U16 => {
                let value = self.use_d(src);
                self.e.b.ins().istore16(flags, value, addr, 0);
            }
            MemKind::I32 => {
                let value = self.use_d(src);
                self.e.b.ins().store(flags, value, addr, 0);
            }
            MemKind::F32 => {
                let value = self.use_f(src);
                let narrow = self.e.b.ins().fdemote(types::F32, value);
                self.e.b.ins().store(flags, narrow, addr, 0);
            }
            MemKind::F64 => {
                let value = self.use_f(src);
                self.e.b.ins().store(flags, value, addr, 0);
            }
            MemKind::Ptr => {
                let value = self.use_a(src);
                self.e.b.ins().store(flags, value, addr, 0);
            }
        }
    }

    pub(super) fn emit_load_konst(&mut self, ins: Instr, op: Opcode) {
        let dst = ins.a as usize;
        let index = ins.bc() as usize;
        match op {
            Opcode::Li => {
                let value = self.iconst_i32(ins.bc_signed() as i32);
                self.def_reg(RegClass::Int, dst, value);
            }
            Opcode::Lk => {
                let value = self.konst_d(index);
                self.def_reg(RegClass::Int, dst, value);
            }
            Opcode::Lkf => {
                let value = self.konst_f(index);
                self.def_reg(RegClass::Float, dst, value);
            }
            Opcode::Lks => {
                let target = self.use_s(dst);
                let source = self.konst_s(index);
                self.call(Helper::StringAssign, &[target, source]);
            }
            _ => {
                let value = self.konst_a(index);
                self.def_reg(RegClass::Pointer, dst, value);
            }
        }
    }

    pub(super) fn emit_move(&mut self, ins: Instr, op: Opcode) {
        let (dst, src) = (ins.a as usize, ins.b as usize);
        let class = match op {
            Opcode::Mov => RegClass::Int,
            Opcode::Movf => RegClass::Float,
            Opcode::Movs => {
                let target = self.use_s(dst);
                let source = self.use_s(src);
                self.call(Helper::StringAssign, &[target, source]);
                return;
            }
            _ => RegClass::Pointer,
        };
        let value = self.use_reg(class, src);
        self.def_reg(class, dst, value);
    }

    /// ADDA: null stays null, otherwise add a signed offset.
    pub(super) fn emit_adda(&mut self, ins: Instr, op: Opcode) {
        let dst = ins.a as usize;
        let base = self.check_reg_a(ins.b as usize, dst);
        let offset = if op == Opcode::AddaRR { self.use_d(ins.c as usize) } else { self.konst_d(ins.c as usize) };
        let offset = self.e.b.ins().sextend(types::I64, offset);
        let moved = self.e.b.ins().iadd(base, offset);
        let is_null = self.e.b.ins().icmp_imm(IntCC::Equal, base, 0);
        let value = self.e.b.ins().select(is_null, base, moved);
        self.def_reg(RegClass::Pointer, dst, value);
    }

    pub(super) fn emit_suba(&mut self, ins: Instr) {
        let l = self.use_a(ins.b as usize);
        let r = self.use_a(ins.c as usize);
        let diff = self.e.b.ins().isub(l, r);
        let value = self.e.b.ins().ireduce(types::I32, diff);
        self.def_reg(RegClass::Int, ins.a as usize, value);
    }

    pub(super) fn emit_eqa(&mut self, ins: Instr, op: Opcode) {
        let l = self.use_a(ins.b as usize);
        let r = if op == Opcode::EqaR { self.use_a(ins.c as usize) } else { self.konst_a(ins.c as usize) };
        let test = self.e.b.ins().icmp(IntCC::Equal, l, r);
        self.emit_compare_skip(test, ins.a & CMP_CHECK != 0);
    }
}
