//! Structural verification of bytecode
//!
//! Checks every operand against the register file sizes and constant pools,
//! jump targets, and the PARAM/CALL/RESULT protocol. Both the interpreter and
//! the JIT refuse functions that fail verification.
//!
//! Pending parameters are counted in instruction order, and every jump or
//! skip must land where that count is the same as at its source. A CALL then
//! finds its parameters in the same slots on every path.

use thiserror::Error;

use super::opcode::*;
use super::{RegClass, ScriptFunction};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("unknown opcode 0x{op:02x} at instruction {pc}")]
    UnknownOpcode { pc: usize, op: u8 },

    #[error("register {class}{index} out of range at instruction {pc}")]
    RegisterOutOfRange { pc: usize, class: RegClass, index: usize },

    #[error("constant k{class}{index} out of range at instruction {pc}")]
    ConstantOutOfRange { pc: usize, class: RegClass, index: usize },

    #[error("jump target {target} out of range at instruction {pc}")]
    JumpOutOfRange { pc: usize, target: i64 },

    #[error("invalid {what} operand at instruction {pc}")]
    InvalidOperand { pc: usize, what: &'static str },

    #[error("parameter area overflow at instruction {pc} (max_param {max})")]
    ParamOverflow { pc: usize, max: usize },

    #[error("call at instruction {pc} takes {wanted} parameters but only {pending} are pending")]
    ParamUnderflow { pc: usize, wanted: usize, pending: usize },

    #[error("call at instruction {pc} requests {count} results (max {MAX_RETURNS})")]
    TooManyResults { pc: usize, count: usize },

    #[error("call at instruction {pc} is not followed by {expected} RESULT instructions")]
    MissingResult { pc: usize, expected: usize },

    #[error("branch at instruction {pc} reaches {target} with {pending} pending parameters, expected {expected}")]
    ParamMismatch { pc: usize, target: usize, pending: usize, expected: usize },

    #[error("label {0} was never bound")]
    UnboundLabel(usize),
}

pub(crate) fn verify(func: &ScriptFunction) -> Result<(), VerifyError> {
    let code = func.code();
    let mut verifier = Verifier { func, pc: 0, params: 0 };
    // pending[pc] is the count on entry to `pc`; the last slot is the exit
    let mut pending = Vec::with_capacity(code.len() + 1);
    let mut branches = Vec::new();
    for (pc, ins) in code.iter().enumerate() {
        verifier.pc = pc;
        pending.push(verifier.params);
        verifier.check(*ins)?;
        if let Some(target) = branch_target(pc, *ins) {
            branches.push((pc, target));
        }
    }
    pending.push(verifier.params);

    for (pc, target) in branches {
        if target < code.len() && pending[target] != pending[pc + 1] {
            return Err(VerifyError::ParamMismatch {
                pc,
                target,
                pending: pending[pc + 1],
                expected: pending[target],
            });
        }
    }
    Ok(())
}

/// Non-fallthrough successor of a jump or compare-and-skip. Only called on
/// instructions that passed `check`, so jump targets are in range.
fn branch_target(pc: usize, ins: Instr) -> Option<usize> {
    let op = Opcode::from_u8(ins.op)?;
    if op == Opcode::Jmp {
        return Some((pc as i64 + 1 + ins.abc() as i64) as usize);
    }
    let skips = op.int_compare().is_some()
        || op.float_compare().is_some()
        || matches!(op, Opcode::Test | Opcode::TestN | Opcode::Cmps | Opcode::EqaR | Opcode::EqaK);
    skips.then_some(pc + 2)
}

struct Verifier<'a> {
    func: &'a ScriptFunction,
    pc: usize,
    /// Parameters pushed and not yet consumed, in linear instruction order.
    params: usize,
}

impl Verifier<'_> {
    fn reg(&self, class: RegClass, index: impl Into<usize>) -> Result<(), VerifyError> {
        let index = index.into();
        if index >= self.func.regs().of(class) {
            return Err(VerifyError::RegisterOutOfRange { pc: self.pc, class, index });
        }
        Ok(())
    }

    fn konst(&self, class: RegClass, index: impl Into<usize>) -> Result<(), VerifyError> {
        let index = index.into();
        if index >= self.func.konst().len_of(class) {
            return Err(VerifyError::ConstantOutOfRange { pc: self.pc, class, index });
        }
        Ok(())
    }

    fn invalid(&self, what: &'static str) -> VerifyError {
        VerifyError::InvalidOperand { pc: self.pc, what }
    }

    /// A `REGT_*`-tagged operand as used by PARAM and RET.
    fn tagged(&self, flags: u8, index: usize) -> Result<(), VerifyError> {
        if flags == REGT_NIL {
            return Ok(());
        }
        if flags & !(REGT_TYPE | REGT_KONST) != 0 {
            return Err(self.invalid("register type"));
        }
        let class = RegClass::from_regtype(flags);
        if flags & REGT_KONST != 0 {
            self.konst(class, index)
        } else {
            self.reg(class, index)
        }
    }

    fn binary(&self, class: RegClass, ins: Instr, form: OperandForm) -> Result<(), VerifyError> {
        self.reg(class, ins.a)?;
        self.sources(class, ins, form)
    }

    fn sources(&self, class: RegClass, ins: Instr, form: OperandForm) -> Result<(), VerifyError> {
        match form {
            OperandForm::RR => {
                self.reg(class, ins.b)?;
                self.reg(class, ins.c)
            }
            OperandForm::RK => {
                self.reg(class, ins.b)?;
                self.konst(class, ins.c)
            }
            OperandForm::KR => {
                self.konst(class, ins.b)?;
                self.reg(class, ins.c)
            }
            OperandForm::RI => self.reg(class, ins.b),
        }
    }

    fn offset(&self, ins: Instr, from_register: bool) -> Result<(), VerifyError> {
        if from_register {
            self.reg(RegClass::Int, ins.c)
        } else {
            self.konst(RegClass::Int, ins.c)
        }
    }

    fn push_param(&mut self) -> Result<(), VerifyError> {
        if self.params >= self.func.max_param() {
            return Err(VerifyError::ParamOverflow { pc: self.pc, max: self.func.max_param() });
        }
        self.params += 1;
        Ok(())
    }

    fn call(&mut self, ins: Instr) -> Result<(), VerifyError> {
        let wanted = ins.b as usize;
        if wanted > self.params {
            return Err(VerifyError::ParamUnderflow { pc: self.pc, wanted, pending: self.params });
        }
        self.params -= wanted;

        let count = ins.c as usize;
        if count > MAX_RETURNS {
            return Err(VerifyError::TooManyResults { pc: self.pc, count });
        }
        let code = self.func.code();
        let results_present = (1..=count)
            .all(|i| code.get(self.pc + i).map(|r| r.op) == Some(Opcode::Result as u8));
        if !results_present {
            return Err(VerifyError::MissingResult { pc: self.pc, expected: count });
        }
        Ok(())
    }

    fn check(&mut self, ins: Instr) -> Result<(), VerifyError> {
        use RegClass::*;

        let op = Opcode::from_u8(ins.op)
            .ok_or(VerifyError::UnknownOpcode { pc: self.pc, op: ins.op })?;

        if let Some((_, form)) = op.int_binop() {
            return self.binary(Int, ins, form);
        }
        if let Some((_, form)) = op.float_binop() {
            return self.binary(Float, ins, form);
        }
        if let Some((_, form)) = op.int_compare() {
            return self.sources(Int, ins, form);
        }
        if let Some((_, form)) = op.float_compare() {
            return self.sources(Float, ins, form);
        }
        if let Some((kind, from_register)) = op.load() {
            self.reg(mem_class(kind), ins.a)?;
            self.reg(Pointer, ins.b)?;
            return self.offset(ins, from_register);
        }
        if let Some((kind, from_register)) = op.store() {
            self.reg(Pointer, ins.a)?;
            self.reg(mem_class(kind), ins.b)?;
            return self.offset(ins, from_register);
        }

        match op {
            Opcode::Nop | Opcode::RetI => Ok(()),
            Opcode::Jmp => {
                let target = self.pc as i64 + 1 + ins.abc() as i64;
                if target < 0 || target > self.func.code().len() as i64 {
                    return Err(VerifyError::JumpOutOfRange { pc: self.pc, target });
                }
                Ok(())
            }
            Opcode::Test | Opcode::TestN | Opcode::Li | Opcode::Bound => self.reg(Int, ins.a),
            Opcode::Ret => self.tagged(ins.b, ins.c as usize),
            Opcode::Throw => match ins.a {
                0 => self.reg(Pointer, ins.bc()),
                1 => self.konst(Pointer, ins.bc()),
                _ => Err(self.invalid("throw mode")),
            },
            Opcode::BoundK | Opcode::Lk => {
                self.reg(Int, ins.a)?;
                self.konst(Int, ins.bc())
            }
            Opcode::BoundR => {
                self.reg(Int, ins.a)?;
                self.reg(Int, ins.b)
            }
            Opcode::Lkf => {
                self.reg(Float, ins.a)?;
                self.konst(Float, ins.bc())
            }
            Opcode::Lks => {
                self.reg(String, ins.a)?;
                self.konst(String, ins.bc())
            }
            Opcode::Lkp => {
                self.reg(Pointer, ins.a)?;
                self.konst(Pointer, ins.bc())
            }
            Opcode::Mov | Opcode::Abs | Opcode::Neg | Opcode::Not => {
                self.reg(Int, ins.a)?;
                self.reg(Int, ins.b)
            }
            Opcode::Movf => {
                self.reg(Float, ins.a)?;
                self.reg(Float, ins.b)
            }
            Opcode::Movs => {
                self.reg(String, ins.a)?;
                self.reg(String, ins.b)
            }
            Opcode::Mova => {
                self.reg(Pointer, ins.a)?;
                self.reg(Pointer, ins.b)
            }
            Opcode::Cast => {
                let (dst, src) = cast_classes(ins.c).ok_or_else(|| self.invalid("cast kind"))?;
                self.reg(dst, ins.a)?;
                self.reg(src, ins.b)
            }
            Opcode::Sext => {
                self.reg(Int, ins.a)?;
                self.reg(Int, ins.b)?;
                if !(1..=32).contains(&ins.c) {
                    return Err(self.invalid("sign-extension width"));
                }
                Ok(())
            }
            Opcode::Param => {
                self.tagged(ins.a, ins.bc() as usize)?;
                self.push_param()
            }
            Opcode::ParamI => self.push_param(),
            Opcode::Call => {
                self.reg(Pointer, ins.a)?;
                self.call(ins)
            }
            Opcode::CallK => {
                self.konst(Pointer, ins.a)?;
                self.call(ins)
            }
            Opcode::Result => {
                if ins.b & (REGT_KONST | REGT_NIL) != 0 {
                    return Err(self.invalid("result register type"));
                }
                self.reg(RegClass::from_regtype(ins.b), ins.c)
            }
            Opcode::New => {
                self.reg(Pointer, ins.a)?;
                self.reg(Int, ins.b)
            }
            Opcode::NewK => {
                self.reg(Pointer, ins.a)?;
                self.konst(Int, ins.bc())
            }
            Opcode::Concat => {
                self.reg(String, ins.a)?;
                self.reg(String, ins.b)?;
                self.reg(String, ins.c)
            }
            Opcode::Lens => {
                self.reg(Int, ins.a)?;
                self.reg(String, ins.b)
            }
            Opcode::Cmps => {
                if ins.a & CMP_METHOD_MASK == CMP_METHOD_MASK {
                    return Err(self.invalid("string compare method"));
                }
                if ins.a & CMP_BK != 0 {
                    self.konst(String, ins.b)?;
                } else {
                    self.reg(String, ins.b)?;
                }
                if ins.a & CMP_CK != 0 {
                    self.konst(String, ins.c)
                } else {
                    self.reg(String, ins.c)
                }
            }
            Opcode::Flop => {
                self.reg(Float, ins.a)?;
                self.reg(Float, ins.b)?;
                if ins.c >= FLOP_COUNT {
                    return Err(self.invalid("float operation"));
                }
                Ok(())
            }
            Opcode::AddaRR => {
                self.reg(Pointer, ins.a)?;
                self.reg(Pointer, ins.b)?;
                self.reg(Int, ins.c)
            }
            Opcode::AddaRK => {
                self.reg(Pointer, ins.a)?;
                self.reg(Pointer, ins.b)?;
                self.konst(Int, ins.c)
            }
            Opcode::Suba => {
                self.reg(Int, ins.a)?;
                self.reg(Pointer, ins.b)?;
                self.reg(Pointer, ins.c)
            }
            Opcode::EqaR => {
                self.reg(Pointer, ins.b)?;
                self.reg(Pointer, ins.c)
            }
            Opcode::EqaK => {
                self.reg(Pointer, ins.b)?;
                self.konst(Pointer, ins.c)
            }
            // arithmetic, compare and memory families were checked above
            _ => Ok(()),
        }
    }
}

pub(crate) fn mem_class(kind: MemKind) -> RegClass {
    match kind {
        MemKind::F32 | MemKind::F64 => RegClass::Float,
        MemKind::Ptr => RegClass::Pointer,
        _ => RegClass::Int,
    }
}

/// Destination and source register classes of a CAST kind.
pub(crate) fn cast_classes(kind: u8) -> Option<(RegClass, RegClass)> {
    use RegClass::*;
    Some(match kind {
        CAST_I2F | CAST_U2F => (Float, Int),
        CAST_F2I | CAST_F2U => (Int, Float),
        CAST_I2S | CAST_U2S => (String, Int),
        CAST_F2S => (String, Float),
        CAST_S2I => (Int, String),
        CAST_S2F => (Float, String),
        _ => return None,
    })
}
