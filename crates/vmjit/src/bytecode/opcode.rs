//! Instruction encoding and the opcode table
//!
//! Every instruction is four bytes: an opcode and three operand bytes. Wider
//! operands are formed by combining bytes (`bc`, `abc`).

/// A single fixed-width instruction.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Instr {
    pub op: u8,
    pub a: u8,
    pub b: u8,
    pub c: u8,
}

impl Instr {
    pub const fn new(op: Opcode, a: u8, b: u8, c: u8) -> Self {
        Instr { op: op as u8, a, b, c }
    }

    /// Build an instruction with a 16-bit `bc` operand.
    pub const fn with_bc(op: Opcode, a: u8, bc: u16) -> Self {
        Instr { op: op as u8, a, b: bc as u8, c: (bc >> 8) as u8 }
    }

    /// Build an instruction with a signed 24-bit `abc` operand.
    pub const fn with_abc(op: Opcode, abc: i32) -> Self {
        let raw = abc as u32;
        Instr { op: op as u8, a: raw as u8, b: (raw >> 8) as u8, c: (raw >> 16) as u8 }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.op)
    }

    /// `b | c << 8`, unsigned.
    pub const fn bc(&self) -> u16 {
        self.b as u16 | (self.c as u16) << 8
    }

    /// `b | c << 8`, sign-extended.
    pub const fn bc_signed(&self) -> i16 {
        self.bc() as i16
    }

    /// `a | b << 8 | c << 16`, sign-extended from 24 bits.
    pub const fn abc(&self) -> i32 {
        let raw = self.a as u32 | (self.b as u32) << 8 | (self.c as u32) << 16;
        ((raw << 8) as i32) >> 8
    }

    pub const fn raw_bytes(&self) -> [u8; 4] {
        [self.op, self.a, self.b, self.c]
    }
}

// Register type flags used by PARAM, RET and RESULT operands
pub const REGT_INT: u8 = 0;
pub const REGT_FLOAT: u8 = 1;
pub const REGT_STRING: u8 = 2;
pub const REGT_POINTER: u8 = 3;
pub const REGT_TYPE: u8 = 3;
pub const REGT_KONST: u8 = 4;
pub const REGT_NIL: u8 = 128;

/// Set on the `a` operand of RET/RETI for the last return of a function.
pub const RET_FINAL: u8 = 0x80;

// Compare-and-skip flags
pub const CMP_CHECK: u8 = 1;
pub const CMP_EQ: u8 = 0;
pub const CMP_LT: u8 = 2;
pub const CMP_LE: u8 = 4;
pub const CMP_METHOD_MASK: u8 = 6;
pub const CMP_BK: u8 = 8;
pub const CMP_CK: u8 = 16;
pub const CMP_APPROX: u8 = 32;

// CAST kinds (`c` operand)
pub const CAST_I2F: u8 = 0;
pub const CAST_U2F: u8 = 1;
pub const CAST_F2I: u8 = 2;
pub const CAST_F2U: u8 = 3;
pub const CAST_I2S: u8 = 4;
pub const CAST_U2S: u8 = 5;
pub const CAST_F2S: u8 = 6;
pub const CAST_S2I: u8 = 7;
pub const CAST_S2F: u8 = 8;

// FLOP codes (`c` operand)
pub const FLOP_ABS: u8 = 0;
pub const FLOP_NEG: u8 = 1;
pub const FLOP_EXP: u8 = 2;
pub const FLOP_LOG: u8 = 3;
pub const FLOP_LOG10: u8 = 4;
pub const FLOP_SQRT: u8 = 5;
pub const FLOP_CEIL: u8 = 6;
pub const FLOP_FLOOR: u8 = 7;
pub const FLOP_ACOS: u8 = 8;
pub const FLOP_ASIN: u8 = 9;
pub const FLOP_ATAN: u8 = 10;
pub const FLOP_COS: u8 = 11;
pub const FLOP_SIN: u8 = 12;
pub const FLOP_TAN: u8 = 13;
pub const FLOP_ACOS_DEG: u8 = 14;
pub const FLOP_ASIN_DEG: u8 = 15;
pub const FLOP_ATAN_DEG: u8 = 16;
pub const FLOP_COS_DEG: u8 = 17;
pub const FLOP_SIN_DEG: u8 = 18;
pub const FLOP_TAN_DEG: u8 = 19;
pub const FLOP_COSH: u8 = 20;
pub const FLOP_SINH: u8 = 21;
pub const FLOP_TANH: u8 = 22;
pub const FLOP_ROUND: u8 = 23;
pub const FLOP_COUNT: u8 = 24;

/// Maximum number of results a single CALL may request.
pub const MAX_RETURNS: usize = 8;

/// Tolerance of approximate float equality.
pub const VM_EPSILON: f64 = 1.0 / 65536.0;

macro_rules! opcodes {
    ($($name:ident = $mnemonic:literal,)*) => {
        /// Bytecode operation identifiers, numbered from zero in table order.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];
            pub const COUNT: usize = Self::ALL.len();

            pub fn from_u8(byte: u8) -> Option<Opcode> {
                Self::ALL.get(byte as usize).copied()
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = "NOP",
    Jmp = "JMP",
    Test = "TEST",
    TestN = "TESTN",
    Ret = "RET",
    RetI = "RETI",
    Throw = "THROW",
    Bound = "BOUND",
    BoundK = "BOUND_K",
    BoundR = "BOUND_R",

    Li = "LI",
    Lk = "LK",
    Lkf = "LKF",
    Lks = "LKS",
    Lkp = "LKP",

    Lb = "LB",
    LbR = "LB_R",
    Lbu = "LBU",
    LbuR = "LBU_R",
    Lh = "LH",
    LhR = "LH_R",
    Lhu = "LHU",
    LhuR = "LHU_R",
    Lw = "LW",
    LwR = "LW_R",
    Lsp = "LSP",
    LspR = "LSP_R",
    Ldp = "LDP",
    LdpR = "LDP_R",
    Lp = "LP",
    LpR = "LP_R",

    Sb = "SB",
    SbR = "SB_R",
    Sh = "SH",
    ShR = "SH_R",
    Sw = "SW",
    SwR = "SW_R",
    Ssp = "SSP",
    SspR = "SSP_R",
    Sdp = "SDP",
    SdpR = "SDP_R",
    Sp = "SP",
    SpR = "SP_R",

    Mov = "MOV",
    Movf = "MOVF",
    Movs = "MOVS",
    Mova = "MOVA",
    Cast = "CAST",

    Param = "PARAM",
    ParamI = "PARAMI",
    Call = "CALL",
    CallK = "CALL_K",
    Result = "RESULT",

    New = "NEW",
    NewK = "NEW_K",

    Concat = "CONCAT",
    Lens = "LENS",
    Cmps = "CMPS",

    SllRR = "SLL_RR",
    SllRI = "SLL_RI",
    SllKR = "SLL_KR",
    SrlRR = "SRL_RR",
    SrlRI = "SRL_RI",
    SrlKR = "SRL_KR",
    SraRR = "SRA_RR",
    SraRI = "SRA_RI",
    SraKR = "SRA_KR",
    AddRR = "ADD_RR",
    AddRK = "ADD_RK",
    AddI = "ADDI",
    SubRR = "SUB_RR",
    SubRK = "SUB_RK",
    SubKR = "SUB_KR",
    MulRR = "MUL_RR",
    MulRK = "MUL_RK",
    DivRR = "DIV_RR",
    DivRK = "DIV_RK",
    DivKR = "DIV_KR",
    DivuRR = "DIVU_RR",
    DivuRK = "DIVU_RK",
    DivuKR = "DIVU_KR",
    ModRR = "MOD_RR",
    ModRK = "MOD_RK",
    ModKR = "MOD_KR",
    ModuRR = "MODU_RR",
    ModuRK = "MODU_RK",
    ModuKR = "MODU_KR",
    AndRR = "AND_RR",
    AndRK = "AND_RK",
    OrRR = "OR_RR",
    OrRK = "OR_RK",
    XorRR = "XOR_RR",
    XorRK = "XOR_RK",
    MinRR = "MIN_RR",
    MinRK = "MIN_RK",
    MaxRR = "MAX_RR",
    MaxRK = "MAX_RK",
    Abs = "ABS",
    Neg = "NEG",
    Not = "NOT",
    Sext = "SEXT",

    EqR = "EQ_R",
    EqK = "EQ_K",
    LtRR = "LT_RR",
    LtRK = "LT_RK",
    LtKR = "LT_KR",
    LeRR = "LE_RR",
    LeRK = "LE_RK",
    LeKR = "LE_KR",
    LtuRR = "LTU_RR",
    LtuRK = "LTU_RK",
    LtuKR = "LTU_KR",
    LeuRR = "LEU_RR",
    LeuRK = "LEU_RK",
    LeuKR = "LEU_KR",

    AddfRR = "ADDF_RR",
    AddfRK = "ADDF_RK",
    SubfRR = "SUBF_RR",
    SubfRK = "SUBF_RK",
    SubfKR = "SUBF_KR",
    MulfRR = "MULF_RR",
    MulfRK = "MULF_RK",
    DivfRR = "DIVF_RR",
    DivfRK = "DIVF_RK",
    DivfKR = "DIVF_KR",
    ModfRR = "MODF_RR",
    ModfRK = "MODF_RK",
    ModfKR = "MODF_KR",
    PowfRR = "POWF_RR",
    PowfRK = "POWF_RK",
    PowfKR = "POWF_KR",
    MinfRR = "MINF_RR",
    MinfRK = "MINF_RK",
    MaxfRR = "MAXF_RR",
    MaxfRK = "MAXF_RK",
    Atan2 = "ATAN2",
    Flop = "FLOP",

    EqfR = "EQF_R",
    EqfK = "EQF_K",
    LtfRR = "LTF_RR",
    LtfRK = "LTF_RK",
    LtfKR = "LTF_KR",
    LefRR = "LEF_RR",
    LefRK = "LEF_RK",
    LefKR = "LEF_KR",

    AddaRR = "ADDA_RR",
    AddaRK = "ADDA_RK",
    Suba = "SUBA",
    EqaR = "EQA_R",
    EqaK = "EQA_K",
}

/// Where the two inputs of a binary operation come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandForm {
    /// `b` and `c` are registers.
    RR,
    /// `b` is a register, `c` indexes the constant pool.
    RK,
    /// `b` indexes the constant pool, `c` is a register.
    KR,
    /// `b` is a register, `c` is an immediate.
    RI,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Divu,
    Mod,
    Modu,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Min,
    Max,
    Atan2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCmp {
    Eq,
    Lt,
    Le,
    Ltu,
    Leu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatCmp {
    Eq,
    Lt,
    Le,
}

/// Memory access width and the register class it moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    F32,
    F64,
    Ptr,
}

impl MemKind {
    pub fn size(self) -> usize {
        match self {
            MemKind::I8 | MemKind::U8 => 1,
            MemKind::I16 | MemKind::U16 => 2,
            MemKind::I32 | MemKind::F32 => 4,
            MemKind::F64 | MemKind::Ptr => 8,
        }
    }
}

impl Opcode {
    pub fn int_binop(self) -> Option<(IntBinOp, OperandForm)> {
        use IntBinOp::*;
        use OperandForm::*;
        Some(match self {
            Opcode::SllRR => (Shl, RR),
            Opcode::SllRI => (Shl, RI),
            Opcode::SllKR => (Shl, KR),
            Opcode::SrlRR => (Shr, RR),
            Opcode::SrlRI => (Shr, RI),
            Opcode::SrlKR => (Shr, KR),
            Opcode::SraRR => (Sar, RR),
            Opcode::SraRI => (Sar, RI),
            Opcode::SraKR => (Sar, KR),
            Opcode::AddRR => (Add, RR),
            Opcode::AddRK => (Add, RK),
            Opcode::AddI => (Add, RI),
            Opcode::SubRR => (Sub, RR),
            Opcode::SubRK => (Sub, RK),
            Opcode::SubKR => (Sub, KR),
            Opcode::MulRR => (Mul, RR),
            Opcode::MulRK => (Mul, RK),
            Opcode::DivRR => (Div, RR),
            Opcode::DivRK => (Div, RK),
            Opcode::DivKR => (Div, KR),
            Opcode::DivuRR => (Divu, RR),
            Opcode::DivuRK => (Divu, RK),
            Opcode::DivuKR => (Divu, KR),
            Opcode::ModRR => (Mod, RR),
            Opcode::ModRK => (Mod, RK),
            Opcode::ModKR => (Mod, KR),
            Opcode::ModuRR => (Modu, RR),
            Opcode::ModuRK => (Modu, RK),
            Opcode::ModuKR => (Modu, KR),
            Opcode::AndRR => (And, RR),
            Opcode::AndRK => (And, RK),
            Opcode::OrRR => (Or, RR),
            Opcode::OrRK => (Or, RK),
            Opcode::XorRR => (Xor, RR),
            Opcode::XorRK => (Xor, RK),
            Opcode::MinRR => (Min, RR),
            Opcode::MinRK => (Min, RK),
            Opcode::MaxRR => (Max, RR),
            Opcode::MaxRK => (Max, RK),
            _ => return None,
        })
    }

    pub fn float_binop(self) -> Option<(FloatBinOp, OperandForm)> {
        use FloatBinOp::*;
        use OperandForm::*;
        Some(match self {
            Opcode::AddfRR => (Add, RR),
            Opcode::AddfRK => (Add, RK),
            Opcode::SubfRR => (Sub, RR),
            Opcode::SubfRK => (Sub, RK),
            Opcode::SubfKR => (Sub, KR),
            Opcode::MulfRR => (Mul, RR),
            Opcode::MulfRK => (Mul, RK),
            Opcode::DivfRR => (Div, RR),
            Opcode::DivfRK => (Div, RK),
            Opcode::DivfKR => (Div, KR),
            Opcode::ModfRR => (Mod, RR),
            Opcode::ModfRK => (Mod, RK),
            Opcode::ModfKR => (Mod, KR),
            Opcode::PowfRR => (Pow, RR),
            Opcode::PowfRK => (Pow, RK),
            Opcode::PowfKR => (Pow, KR),
            Opcode::MinfRR => (Min, RR),
            Opcode::MinfRK => (Min, RK),
            Opcode::MaxfRR => (Max, RR),
            Opcode::MaxfRK => (Max, RK),
            Opcode::Atan2 => (Atan2, RR),
            _ => return None,
        })
    }

    pub fn int_compare(self) -> Option<(IntCmp, OperandForm)> {
        use IntCmp::*;
        use OperandForm::*;
        Some(match self {
            Opcode::EqR => (Eq, RR),
            Opcode::EqK => (Eq, RK),
            Opcode::LtRR => (Lt, RR),
            Opcode::LtRK => (Lt, RK),
            Opcode::LtKR => (Lt, KR),
            Opcode::LeRR => (Le, RR),
            Opcode::LeRK => (Le, RK),
            Opcode::LeKR => (Le, KR),
            Opcode::LtuRR => (Ltu, RR),
            Opcode::LtuRK => (Ltu, RK),
            Opcode::LtuKR => (Ltu, KR),
            Opcode::LeuRR => (Leu, RR),
            Opcode::LeuRK => (Leu, RK),
            Opcode::LeuKR => (Leu, KR),
            _ => return None,
        })
    }

    pub fn float_compare(self) -> Option<(FloatCmp, OperandForm)> {
        use FloatCmp::*;
        use OperandForm::*;
        Some(match self {
            Opcode::EqfR => (Eq, RR),
            Opcode::EqfK => (Eq, RK),
            Opcode::LtfRR => (Lt, RR),
            Opcode::LtfRK => (Lt, RK),
            Opcode::LtfKR => (Lt, KR),
            Opcode::LefRR => (Le, RR),
            Opcode::LefRK => (Le, RK),
            Opcode::LefKR => (Le, KR),
            _ => return None,
        })
    }

    /// Width of a memory load and whether its offset comes from a register.
    pub fn load(self) -> Option<(MemKind, bool)> {
        Some(match self {
            Opcode::Lb => (MemKind::I8, false),
            Opcode::LbR => (MemKind::I8, true),
            Opcode::Lbu => (MemKind::U8, false),
            Opcode::LbuR => (MemKind::U8, true),
            Opcode::Lh => (MemKind::I16, false),
            Opcode::LhR => (MemKind::I16, true),
            Opcode::Lhu => (MemKind::U16, false),
            Opcode::LhuR => (MemKind::U16, true),
            Opcode::Lw => (MemKind::I32, false),
            Opcode::LwR => (MemKind::I32, true),
            Opcode::Lsp => (MemKind::F32, false),
            Opcode::LspR => (MemKind::F32, true),
            Opcode::Ldp => (MemKind::F64, false),
            Opcode::LdpR => (MemKind::F64, true),
            Opcode::Lp => (MemKind::Ptr, false),
            Opcode::LpR => (MemKind::Ptr, true),
            _ => return None,
        })
    }

    /// Width of a memory store and whether its offset comes from a register.
    pub fn store(self) -> Option<(MemKind, bool)> {
        Some(match self {
            Opcode::Sb => (MemKind::I8, false),
            Opcode::SbR => (MemKind::I8, true),
            Opcode::Sh => (MemKind::I16, false),
            Opcode::ShR => (MemKind::I16, true),
            Opcode::Sw => (MemKind::I32, false),
            Opcode::SwR => (MemKind::I32, true),
            Opcode::Ssp => (MemKind::F32, false),
            Opcode::SspR => (MemKind::F32, true),
            Opcode::Sdp => (MemKind::F64, false),
            Opcode::SdpR => (MemKind::F64, true),
            Opcode::Sp => (MemKind::Ptr, false),
            Opcode::SpR => (MemKind::Ptr, true),
            _ => return None,
        })
    }

    /// Immediate operand of an RI-form instruction; ADDI's is signed.
    pub fn immediate(self, ins: Instr) -> i32 {
        if self == Opcode::AddI {
            ins.c as i8 as i32
        } else {
            ins.c as i32
        }
    }

    /// True for compare-and-skip instructions.
    pub fn is_compare(self) -> bool {
        self.int_compare().is_some()
            || self.float_compare().is_some()
            || matches!(self, Opcode::Cmps | Opcode::EqaR | Opcode::EqaK)
    }
}
