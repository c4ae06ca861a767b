//! Bytecode to Cranelift IR translation
//!
//! One pass over the instructions in ascending order. Each instruction gets
//! its own block (label) so jumps can target any index; label `N` is the exit.
//! The frame is pushed in the prologue, registers are loaded from it into
//! variables, and every exit path pops it again through the unwind block.

mod arith;
mod bridge;
mod call;
mod control;
mod float;
mod memory;
mod string;

use cranelift_codegen::ir::{self, types, InstBuilder, Value};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilderContext, Variable};

use crate::bytecode::opcode::*;
use crate::bytecode::{RegClass, ScriptFunction};
use crate::jit::backend::{abi, Emitter};
use crate::jit::error::JitError;
use crate::jit::regmap::{RegisterMap, TempPool};
use crate::jit::runtime::helpers::Helper;
use crate::vm::frame::{FrameLayout, LAST_FRAME_OFFSET};

/// Translate `func` into `target`, returning the annotation listing when
/// `capture_listing` is set. `func` must already be verified.
pub(crate) fn translate(
    func: &ScriptFunction,
    target: &mut ir::Function,
    fctx: &mut FunctionBuilderContext,
    call_conv: CallConv,
    capture_listing: bool,
) -> Result<Option<Vec<String>>, JitError> {
    let num_labels = func.code().len() + 1;
    let e = Emitter::new(target, fctx, call_conv, num_labels, capture_listing);
    let mut t = Translator::new(func, e);
    t.setup();
    for pc in 0..func.code().len() {
        t.translate_instruction(pc)?;
    }
    t.finish()
}

/// Values live across the whole function, kept in variables so every block
/// can reach them.
struct Env {
    rets: Variable,
    numret: Variable,
    exc: Variable,
    stack: Variable,
    frame: Variable,
}

impl Env {
    fn declare(e: &mut Emitter<'_>) -> Self {
        Env {
            rets: e.b.declare_var(types::I64),
            numret: e.b.declare_var(types::I32),
            exc: e.b.declare_var(types::I64),
            stack: e.b.declare_var(types::I64),
            frame: e.b.declare_var(types::I64),
        }
    }
}

pub(crate) struct Translator<'a, 'f> {
    e: Emitter<'a>,
    func: &'f ScriptFunction,
    layout: FrameLayout,
    regs: RegisterMap,
    temps: TempPool,
    env: Env,
    /// Index of the instruction being translated.
    pc: usize,
    /// Parameters pushed since the last call, tracked statically.
    num_param: usize,
}

impl<'a, 'f> Translator<'a, 'f> {
    fn new(func: &'f ScriptFunction, mut e: Emitter<'a>) -> Self {
        let regs = RegisterMap::declare(&mut e.b, func.regs());
        let env = Env::declare(&mut e);
        Translator {
            e,
            func,
            layout: FrameLayout::of(func),
            regs,
            temps: TempPool::default(),
            env,
            pc: 0,
            num_param: 0,
        }
    }

    /// Prologue: push the frame, load every register, enter label 0.
    fn setup(&mut self) {
        let params = self.e.entry();
        let (args, numargs, rets, numret, exc) = (params[0], params[1], params[2], params[3], params[4]);
        self.e.b.def_var(self.env.rets, rets);
        self.e.b.def_var(self.env.numret, numret);
        self.e.b.def_var(self.env.exc, exc);

        let descriptor = self.e.iconst_ptr(self.func as *const ScriptFunction as usize);
        let stack = self.call(Helper::PushFrame, &[descriptor, args, numargs, exc]);
        self.e.b.def_var(self.env.stack, stack);
        self.emit_check_for_exception();

        let stack = self.e.b.use_var(self.env.stack);
        let frame = self.e.b.ins().load(types::I64, abi::trusted(), stack, LAST_FRAME_OFFSET as i32);
        self.e.b.def_var(self.env.frame, frame);

        for class in [RegClass::Int, RegClass::Float, RegClass::Pointer] {
            let ty = crate::jit::regmap::native_type(class);
            for i in 0..self.regs.count(class) {
                let offset = self.layout.register(class, i) as i32;
                let value = self.e.b.ins().load(ty, abi::trusted(), frame, offset);
                self.e.b.def_var(self.regs.var(class, i), value);
            }
        }
        for i in 0..self.regs.count(RegClass::String) {
            let addr = self.e.b.ins().iadd_imm(frame, self.layout.register(RegClass::String, i) as i64);
            self.e.b.def_var(self.regs.var(RegClass::String, i), addr);
        }

        let first = self.e.label(0);
        self.e.jump(first);
    }

    fn translate_instruction(&mut self, pc: usize) -> Result<(), JitError> {
        self.pc = pc;
        self.e.bind(pc);
        self.temps.reset();

        let ins = self.func.code()[pc];
        let func = self.func;
        self.e.annotate(pc, || {
            let mnemonic = Opcode::from_u8(ins.op).map_or("???", Opcode::mnemonic);
            format!(
                "; {}(line {}): {:02x}{:02x}{:02x}{:02x} {}",
                func.name(),
                func.line(pc),
                ins.op,
                ins.a,
                ins.b,
                ins.c,
                mnemonic
            )
        });

        let op = Opcode::from_u8(ins.op).ok_or(JitError::UnknownOpcode { pc, op: ins.op })?;

        if let Some((bop, form)) = op.int_binop() {
            self.emit_int_binop(ins, bop, form, op.immediate(ins));
        } else if let Some((bop, form)) = op.float_binop() {
            self.emit_float_binop(ins, bop, form);
        } else if let Some((cmp, form)) = op.int_compare() {
            self.emit_int_compare(ins, cmp, form);
        } else if let Some((cmp, form)) = op.float_compare() {
            self.emit_float_compare(ins, cmp, form);
        } else if let Some((kind, from_register)) = op.load() {
            self.emit_load(ins, kind, from_register);
        } else if let Some((kind, from_register)) = op.store() {
            self.emit_store(ins, kind, from_register);
        } else {
            match op {
                Opcode::Nop | Opcode::Result => {}
                Opcode::Jmp => self.emit_jmp(ins),
                Opcode::Test | Opcode::TestN => self.emit_test(ins, op == Opcode::TestN),
                Opcode::Ret => self.emit_ret(ins),
                Opcode::RetI => self.emit_reti(ins),
                Opcode::Throw => self.emit_throw_object(ins),
                Opcode::Bound | Opcode::BoundK | Opcode::BoundR => self.emit_bound(ins, op),
                Opcode::Li | Opcode::Lk | Opcode::Lkf | Opcode::Lks | Opcode::Lkp => self.emit_load_konst(ins, op),
                Opcode::Mov | Opcode::Movf | Opcode::Movs | Opcode::Mova => self.emit_move(ins, op),
                Opcode::Cast => self.emit_cast(ins)?,
                Opcode::Param => self.emit_param(ins)?,
                Opcode::ParamI => self.emit_param_imm(ins)?,
                Opcode::Call | Opcode::CallK => self.emit_call(ins, op)?,
                Opcode::New | Opcode::NewK => self.emit_new(ins, op),
                Opcode::Concat => self.emit_concat(ins),
                Opcode::Lens => self.emit_lens(ins),
                Opcode::Cmps => self.emit_cmps(ins),
                Opcode::Abs | Opcode::Neg | Opcode::Not | Opcode::Sext => self.emit_int_unary(ins, op),
                Opcode::Flop => self.emit_flop(ins),
                Opcode::AddaRR | Opcode::AddaRK => self.emit_adda(ins, op),
                Opcode::Suba => self.emit_suba(ins),
                Opcode::EqaR | Opcode::EqaK => self.emit_eqa(ins, op),
                _ => return Err(self.malformed(format!("{} has no translation", op.mnemonic()))),
            }
        }
        Ok(())
    }

    /// Exit label, then the shared unwind block.
    fn finish(mut self) -> Result<Option<Vec<String>>, JitError> {
        let exit = self.func.code().len();
        self.e.bind(exit);
        let unwind = self.e.unwind_block();
        self.e.jump(unwind);

        self.e.b.switch_to_block(unwind);
        let stack = self.e.b.use_var(self.env.stack);
        let exc = self.e.b.use_var(self.env.exc);
        self.call(Helper::PopFrame, &[stack, exc]);
        let zero = self.e.b.ins().iconst(types::I32, 0);
        self.e.b.ins().return_(&[zero]);

        Ok(self.e.finish())
    }

    fn malformed(&self, reason: impl Into<String>) -> JitError {
        JitError::malformed(self.func.name(), format!("instruction {}: {}", self.pc, reason.into()))
    }

    fn call(&mut self, helper: Helper, args: &[Value]) -> Value {
        match self.e.call_helper(helper, args) {
            Some(value) => value,
            None => self.e.b.ins().iconst(types::I32, 0),
        }
    }

    // ---- register and constant access ----

    fn use_reg(&mut self, class: RegClass, index: usize) -> Value {
        self.e.b.use_var(self.regs.var(class, index))
    }

    fn def_reg(&mut self, class: RegClass, index: usize, value: Value) {
        self.e.b.def_var(self.regs.var(class, index), value);
    }

    fn use_d(&mut self, index: usize) -> Value {
        self.use_reg(RegClass::Int, index)
    }

    fn use_f(&mut self, index: usize) -> Value {
        self.use_reg(RegClass::Float, index)
    }

    fn use_a(&mut self, index: usize) -> Value {
        self.use_reg(RegClass::Pointer, index)
    }

    /// Address of a string register's frame slot.
    fn use_s(&mut self, index: usize) -> Value {
        self.use_reg(RegClass::String, index)
    }

    /// Read source register `src`, through a temporary when it is also the
    /// destination `dst`.
    fn check_reg(&mut self, class: RegClass, src: usize, dst: usize) -> Value {
        let value = self.use_reg(class, src);
        if src != dst {
            return value;
        }
        let temp = self.temps.take(&mut self.e.b, class);
        self.e.b.def_var(temp, value);
        self.e.b.use_var(temp)
    }

    fn check_reg_d(&mut self, src: usize, dst: usize) -> Value {
        self.check_reg(RegClass::Int, src, dst)
    }

    fn check_reg_f(&mut self, src: usize, dst: usize) -> Value {
        self.check_reg(RegClass::Float, src, dst)
    }

    fn check_reg_a(&mut self, src: usize, dst: usize) -> Value {
        self.check_reg(RegClass::Pointer, src, dst)
    }

    /// `I32` constant; narrow immediates must be zero-extended.
    fn iconst_i32(&mut self, value: i32) -> Value {
        self.e.b.ins().iconst(types::I32, value as u32 as i64)
    }

    fn konst_d(&mut self, index: usize) -> Value {
        let value = self.func.konst().ints[index];
        self.iconst_i32(value)
    }

    fn konst_f(&mut self, index: usize) -> Value {
        let value = self.func.konst().floats[index];
        self.e.b.ins().f64const(value)
    }

    /// Address of a constant string; the descriptor outlives the code.
    fn konst_s(&mut self, index: usize) -> Value {
        let addr = &self.func.konst().strings[index] as *const String as usize;
        self.e.iconst_ptr(addr)
    }

    fn konst_a(&mut self, index: usize) -> Value {
        let addr = self.func.konst().pointers[index];
        self.e.iconst_ptr(addr)
    }

    /// Address of the current instruction, recorded in exceptions.
    fn pc_addr(&mut self) -> Value {
        let addr = &self.func.code()[self.pc] as *const Instr as usize;
        self.e.iconst_ptr(addr)
    }

    fn exc(&mut self) -> Value {
        self.e.b.use_var(self.env.exc)
    }

    fn frame(&mut self) -> Value {
        self.e.b.use_var(self.env.frame)
    }

    /// Label after the next instruction, clamped to the exit label.
    fn skip_label(&self) -> ir::Block {
        self.e.label((self.pc + 2).min(self.func.code().len()))
    }

    fn next_label(&self) -> ir::Block {
        self.e.label(self.pc + 1)
    }
}
