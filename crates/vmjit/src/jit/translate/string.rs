//! CONCAT, LENS and CMPS through the string helpers

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::InstBuilder;

use super::Translator;
use crate::bytecode::opcode::*;
use crate::bytecode::RegClass;
use crate::jit::runtime::helpers::Helper;

impl Translator<'_, '_> {
    pub(super) fn emit_concat(&mut self, ins: Instr) {
        let dst = self.use_s(ins.a as usize);
        let l = self.use_s(ins.b as usize);
        let r = self.use_s(ins.c as usize);
        self.call(Helper::StringConcat, &[dst, l, r]);
    }

    pub(super) fn emit_lens(&mut self, ins: Instr) {
        let s = self.use_s(ins.b as usize);
        let len = self.call(Helper::StringLen, &[s]);
        self.def_reg(RegClass::Int, ins.a as usize, len);
    }

    pub(super) fn emit_cmps(&mut self, ins: Instr) {
        let (b, c) = (ins.b as usize, ins.c as usize);
        let l = if ins.a & CMP_BK != 0 { self.konst_s(b) } else { self.use_s(b) };
        let r = if ins.a & CMP_CK != 0 { self.konst_s(c) } else { self.use_s(c) };
        let flags = self.iconst_i32(ins.a as i32);
        let result = self.call(Helper::StringCompare, &[flags, l, r]);
        let test = self.e.b.ins().icmp_imm(IntCC::NotEqual, result, 0);
        self.emit_compare_skip(test, ins.a & CMP_CHECK != 0);
    }
}
