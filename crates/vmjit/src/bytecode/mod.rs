//! Bytecode program model
//!
//! A [`ScriptFunction`] is the immutable unit both execution modes consume:
//! instructions, constant pools, register file sizes and diagnostics.

pub mod builder;
pub mod opcode;
pub mod verify;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::jit::profiling::FunctionProfile;
use crate::vm::function::VmFunction;

pub use builder::{Assembler, Label};
pub use opcode::{Instr, Opcode};
pub use verify::VerifyError;

/// Process-unique identity of a function descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u32);

impl FunctionId {
    fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        FunctionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Register file class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Int,
    Float,
    String,
    Pointer,
}

impl RegClass {
    /// Decode the low bits of a `REGT_*` operand.
    pub fn from_regtype(flags: u8) -> RegClass {
        match flags & opcode::REGT_TYPE {
            opcode::REGT_INT => RegClass::Int,
            opcode::REGT_FLOAT => RegClass::Float,
            opcode::REGT_STRING => RegClass::String,
            _ => RegClass::Pointer,
        }
    }

    pub fn regtype(self) -> u8 {
        match self {
            RegClass::Int => opcode::REGT_INT,
            RegClass::Float => opcode::REGT_FLOAT,
            RegClass::String => opcode::REGT_STRING,
            RegClass::Pointer => opcode::REGT_POINTER,
        }
    }
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegClass::Int => "d",
            RegClass::Float => "f",
            RegClass::String => "s",
            RegClass::Pointer => "a",
        };
        f.write_str(name)
    }
}

/// Register file sizes per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterCounts {
    pub int: u16,
    pub float: u16,
    pub string: u16,
    pub pointer: u16,
}

impl RegisterCounts {
    pub fn new(int: u16, float: u16, string: u16, pointer: u16) -> Self {
        RegisterCounts { int, float, string, pointer }
    }

    pub fn of(&self, class: RegClass) -> usize {
        match class {
            RegClass::Int => self.int as usize,
            RegClass::Float => self.float as usize,
            RegClass::String => self.string as usize,
            RegClass::Pointer => self.pointer as usize,
        }
    }
}

/// Constant pools of one function.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    pub ints: Vec<i32>,
    pub floats: Vec<f64>,
    pub strings: Vec<String>,
    /// Opaque addresses; function constants point at a retained [`VmFunction`].
    pub pointers: Vec<usize>,
}

impl ConstantPool {
    pub fn len_of(&self, class: RegClass) -> usize {
        match class {
            RegClass::Int => self.ints.len(),
            RegClass::Float => self.floats.len(),
            RegClass::String => self.strings.len(),
            RegClass::Pointer => self.pointers.len(),
        }
    }
}

/// Immutable bytecode function descriptor.
pub struct ScriptFunction {
    id: FunctionId,
    name: String,
    code: Vec<Instr>,
    lines: Vec<u32>,
    konst: ConstantPool,
    regs: RegisterCounts,
    max_param: u16,
    num_args: u16,
    callees: Vec<Arc<VmFunction>>,
    profile: FunctionProfile,
    verified: OnceCell<Result<(), VerifyError>>,
}

impl ScriptFunction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        code: Vec<Instr>,
        lines: Vec<u32>,
        konst: ConstantPool,
        regs: RegisterCounts,
        max_param: u16,
        num_args: u16,
        callees: Vec<Arc<VmFunction>>,
    ) -> Self {
        ScriptFunction {
            id: FunctionId::next(),
            name,
            code,
            lines,
            konst,
            regs,
            max_param,
            num_args,
            callees,
            profile: FunctionProfile::new(),
            verified: OnceCell::new(),
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &[Instr] {
        &self.code
    }

    pub fn konst(&self) -> &ConstantPool {
        &self.konst
    }

    pub fn regs(&self) -> RegisterCounts {
        self.regs
    }

    pub fn max_param(&self) -> usize {
        self.max_param as usize
    }

    pub fn num_args(&self) -> usize {
        self.num_args as usize
    }

    pub fn callees(&self) -> &[Arc<VmFunction>] {
        &self.callees
    }

    pub fn profile(&self) -> &FunctionProfile {
        &self.profile
    }

    /// Source line of an instruction, 0 when unknown.
    pub fn line(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(0)
    }

    /// Map an instruction address back to its index.
    pub fn instruction_index(&self, addr: usize) -> Option<usize> {
        let start = self.code.as_ptr() as usize;
        let size = std::mem::size_of::<Instr>();
        if addr < start || addr >= start + self.code.len() * size {
            return None;
        }
        Some((addr - start) / size)
    }

    /// Verify the function once and cache the outcome.
    pub fn verify(&self) -> Result<(), &VerifyError> {
        self.verified.get_or_init(|| verify::verify(self)).as_ref().map(|_| ())
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptFunction")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("instructions", &self.code.len())
            .field("regs", &self.regs)
            .field("max_param", &self.max_param)
            .finish()
    }
}
