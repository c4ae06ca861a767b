//! Bytecode assembler
//!
//! Small fluent builder used by embedders and tests to produce
//! [`ScriptFunction`]s without a front-end compiler.

use std::sync::Arc;

use super::opcode::*;
use super::verify::VerifyError;
use super::{ConstantPool, RegClass, RegisterCounts, ScriptFunction};
use crate::vm::function::VmFunction;

/// Forward-referenceable jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

pub struct Assembler {
    name: String,
    code: Vec<Instr>,
    lines: Vec<u32>,
    line: u32,
    konst: ConstantPool,
    regs: RegisterCounts,
    max_param: u16,
    num_args: u16,
    callees: Vec<Arc<VmFunction>>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl Assembler {
    pub fn new(name: impl Into<String>) -> Self {
        Assembler {
            name: name.into(),
            code: Vec::new(),
            lines: Vec::new(),
            line: 0,
            konst: ConstantPool::default(),
            regs: RegisterCounts::default(),
            max_param: 0,
            num_args: 0,
            callees: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn registers(&mut self, int: u16, float: u16, string: u16, pointer: u16) -> &mut Self {
        self.regs = RegisterCounts::new(int, float, string, pointer);
        self
    }

    pub fn max_param(&mut self, count: u16) -> &mut Self {
        self.max_param = count;
        self
    }

    pub fn num_args(&mut self, count: u16) -> &mut Self {
        self.num_args = count;
        self
    }

    /// Source line attached to subsequently emitted instructions.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    pub fn konst_int(&mut self, value: i32) -> u16 {
        self.konst.ints.push(value);
        (self.konst.ints.len() - 1) as u16
    }

    pub fn konst_float(&mut self, value: f64) -> u16 {
        self.konst.floats.push(value);
        (self.konst.floats.len() - 1) as u16
    }

    pub fn konst_string(&mut self, value: impl Into<String>) -> u16 {
        self.konst.strings.push(value.into());
        (self.konst.strings.len() - 1) as u16
    }

    pub fn konst_pointer(&mut self, addr: usize) -> u16 {
        self.konst.pointers.push(addr);
        (self.konst.pointers.len() - 1) as u16
    }

    /// Add a callable constant. The function is retained by the descriptor.
    pub fn konst_function(&mut self, func: Arc<VmFunction>) -> u16 {
        let addr = Arc::as_ptr(&func) as usize;
        self.callees.push(func);
        self.konst_pointer(addr)
    }

    /// Index of the next instruction.
    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn raw(&mut self, ins: Instr) -> usize {
        self.code.push(ins);
        self.lines.push(self.line);
        self.code.len() - 1
    }

    pub fn op(&mut self, op: Opcode, a: u8, b: u8, c: u8) -> usize {
        self.raw(Instr::new(op, a, b, c))
    }

    pub fn op_bc(&mut self, op: Opcode, a: u8, bc: u16) -> usize {
        self.raw(Instr::with_bc(op, a, bc))
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    pub fn jmp(&mut self, label: Label) -> usize {
        let pc = self.raw(Instr::with_abc(Opcode::Jmp, 0));
        self.fixups.push((pc, label));
        pc
    }

    pub fn li(&mut self, reg: u8, value: i16) -> usize {
        self.op_bc(Opcode::Li, reg, value as u16)
    }

    pub fn ret_reg(&mut self, retnum: u8, class: RegClass, reg: u8, last: bool) -> usize {
        self.op(Opcode::Ret, ret_flags(retnum, last), class.regtype(), reg)
    }

    pub fn ret_konst(&mut self, retnum: u8, class: RegClass, konst: u8, last: bool) -> usize {
        self.op(Opcode::Ret, ret_flags(retnum, last), class.regtype() | REGT_KONST, konst)
    }

    pub fn ret_imm(&mut self, retnum: u8, value: i16, last: bool) -> usize {
        self.op_bc(Opcode::RetI, ret_flags(retnum, last), value as u16)
    }

    pub fn ret_nil(&mut self) -> usize {
        self.op(Opcode::Ret, RET_FINAL, REGT_NIL, 0)
    }

    pub fn param_reg(&mut self, class: RegClass, reg: u8) -> usize {
        self.op_bc(Opcode::Param, class.regtype(), reg as u16)
    }

    pub fn param_konst(&mut self, class: RegClass, konst: u16) -> usize {
        self.op_bc(Opcode::Param, class.regtype() | REGT_KONST, konst)
    }

    pub fn param_nil(&mut self) -> usize {
        self.op_bc(Opcode::Param, REGT_NIL, 0)
    }

    pub fn param_imm(&mut self, value: i32) -> usize {
        self.raw(Instr::with_abc(Opcode::ParamI, value))
    }

    /// CALL through a pointer register, followed by its RESULT instructions.
    pub fn call(&mut self, func_reg: u8, nparams: u8, results: &[(RegClass, u8)]) -> usize {
        let pc = self.op(Opcode::Call, func_reg, nparams, results.len() as u8);
        self.results(results);
        pc
    }

    /// CALL of a function constant, followed by its RESULT instructions.
    pub fn call_konst(&mut self, konst: u8, nparams: u8, results: &[(RegClass, u8)]) -> usize {
        let pc = self.op(Opcode::CallK, konst, nparams, results.len() as u8);
        self.results(results);
        pc
    }

    fn results(&mut self, results: &[(RegClass, u8)]) {
        for (class, reg) in results {
            self.op(Opcode::Result, 0, class.regtype(), *reg);
        }
    }

    /// Resolve labels and produce the descriptor.
    ///
    /// Operand validity is not checked here; see [`ScriptFunction::verify`].
    pub fn finish(mut self) -> Result<Arc<ScriptFunction>, VerifyError> {
        for (pc, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].ok_or(VerifyError::UnboundLabel(label.0))?;
            let offset = target as i32 - (pc as i32 + 1);
            self.code[pc] = Instr::with_abc(Opcode::Jmp, offset);
        }
        Ok(Arc::new(ScriptFunction::new(
            self.name,
            self.code,
            self.lines,
            self.konst,
            self.regs,
            self.max_param,
            self.num_args,
            self.callees,
        )))
    }
}

fn ret_flags(retnum: u8, last: bool) -> u8 {
    if last {
        retnum | RET_FINAL
    } else {
        retnum
    }
}
