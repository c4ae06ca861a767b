//! Numeric, string and conversion semantics
//!
//! The interpreter evaluates instructions with these functions and the JIT's
//! helper routines call them, so both execution modes agree bit for bit.
//! Opcodes the JIT lowers inline must match the definitions here.

use crate::bytecode::opcode::*;
use crate::vm::exception::AbortReason;

pub fn int_binop(op: IntBinOp, l: i32, r: i32) -> Result<i32, AbortReason> {
    Ok(match op {
        IntBinOp::Add => l.wrapping_add(r),
        IntBinOp::Sub => l.wrapping_sub(r),
        IntBinOp::Mul => l.wrapping_mul(r),
        IntBinOp::Div => {
            if r == 0 {
                return Err(AbortReason::DivisionByZero);
            }
            l.wrapping_div(r)
        }
        IntBinOp::Divu => {
            if r == 0 {
                return Err(AbortReason::DivisionByZero);
            }
            ((l as u32) / (r as u32)) as i32
        }
        IntBinOp::Mod => {
            if r == 0 {
                return Err(AbortReason::DivisionByZero);
            }
            l.wrapping_rem(r)
        }
        IntBinOp::Modu => {
            if r == 0 {
                return Err(AbortReason::DivisionByZero);
            }
            ((l as u32) % (r as u32)) as i32
        }
        IntBinOp::And => l & r,
        IntBinOp::Or => l | r,
        IntBinOp::Xor => l ^ r,
        IntBinOp::Shl => l.wrapping_shl(r as u32),
        IntBinOp::Shr => (l as u32).wrapping_shr(r as u32) as i32,
        IntBinOp::Sar => l.wrapping_shr(r as u32),
        IntBinOp::Min => {
            if l < r {
                l
            } else {
                r
            }
        }
        IntBinOp::Max => {
            if l > r {
                l
            } else {
                r
            }
        }
    })
}

pub fn float_binop(op: FloatBinOp, l: f64, r: f64) -> Result<f64, AbortReason> {
    Ok(match op {
        FloatBinOp::Add => l + r,
        FloatBinOp::Sub => l - r,
        FloatBinOp::Mul => l * r,
        FloatBinOp::Div => {
            if r == 0.0 {
                return Err(AbortReason::DivisionByZero);
            }
            l / r
        }
        FloatBinOp::Mod => {
            if r == 0.0 {
                return Err(AbortReason::DivisionByZero);
            }
            fmod(l, r)
        }
        FloatBinOp::Pow => l.powf(r),
        FloatBinOp::Min => {
            if l < r {
                l
            } else {
                r
            }
        }
        FloatBinOp::Max => {
            if l > r {
                l
            } else {
                r
            }
        }
        FloatBinOp::Atan2 => atan2_deg(l, r),
    })
}

/// Floored remainder: the result takes the sign of the divisor.
pub fn fmod(l: f64, r: f64) -> f64 {
    l - (l / r).floor() * r
}

pub fn atan2_deg(y: f64, x: f64) -> f64 {
    y.atan2(x).to_degrees()
}

pub fn int_compare(op: IntCmp, l: i32, r: i32) -> bool {
    match op {
        IntCmp::Eq => l == r,
        IntCmp::Lt => l < r,
        IntCmp::Le => l <= r,
        IntCmp::Ltu => (l as u32) < (r as u32),
        IntCmp::Leu => (l as u32) <= (r as u32),
    }
}

pub fn float_compare(op: FloatCmp, approx: bool, l: f64, r: f64) -> bool {
    match op {
        FloatCmp::Eq if approx => (l - r).abs() < VM_EPSILON,
        FloatCmp::Eq => l == r,
        FloatCmp::Lt => l < r,
        FloatCmp::Le => l <= r,
    }
}

/// String comparison for CMPS; `flags` carries the method and CMP_APPROX.
pub fn string_compare(flags: u8, l: &str, r: &str) -> bool {
    let ordering = if flags & CMP_APPROX != 0 {
        l.to_lowercase().cmp(&r.to_lowercase())
    } else {
        l.cmp(r)
    };
    match flags & CMP_METHOD_MASK {
        CMP_LT => ordering.is_lt(),
        CMP_LE => ordering.is_le(),
        _ => ordering.is_eq(),
    }
}

pub fn flop(code: u8, x: f64) -> f64 {
    match code {
        FLOP_ABS => x.abs(),
        FLOP_NEG => -x,
        FLOP_EXP => x.exp(),
        FLOP_LOG => x.ln(),
        FLOP_LOG10 => x.log10(),
        FLOP_SQRT => x.sqrt(),
        FLOP_CEIL => x.ceil(),
        FLOP_FLOOR => x.floor(),
        FLOP_ACOS => x.acos(),
        FLOP_ASIN => x.asin(),
        FLOP_ATAN => x.atan(),
        FLOP_COS => x.cos(),
        FLOP_SIN => x.sin(),
        FLOP_TAN => x.tan(),
        FLOP_ACOS_DEG => x.acos().to_degrees(),
        FLOP_ASIN_DEG => x.asin().to_degrees(),
        FLOP_ATAN_DEG => x.atan().to_degrees(),
        FLOP_COS_DEG => x.to_radians().cos(),
        FLOP_SIN_DEG => x.to_radians().sin(),
        FLOP_TAN_DEG => x.to_radians().tan(),
        FLOP_COSH => x.cosh(),
        FLOP_SINH => x.sinh(),
        FLOP_TANH => x.tanh(),
        FLOP_ROUND => x.round(),
        _ => f64::NAN,
    }
}

/// Sign-extend the low `bits` bits of `x`.
pub fn sext(x: i32, bits: u8) -> i32 {
    if bits >= 32 {
        x
    } else {
        let shift = 32 - bits as u32;
        (x << shift) >> shift
    }
}

pub fn float_to_int(x: f64) -> i32 {
    x as i32
}

pub fn float_to_uint(x: f64) -> i32 {
    x as u32 as i32
}

pub fn int_to_string(x: i32) -> String {
    x.to_string()
}

pub fn uint_to_string(x: i32) -> String {
    (x as u32).to_string()
}

pub fn float_to_string(x: f64) -> String {
    format!("{x:.5}")
}

/// Integer value of a string; non-numeric text yields 0.
pub fn string_to_int(s: &str) -> i32 {
    let s = s.trim();
    s.parse::<i32>()
        .or_else(|_| s.parse::<f64>().map(float_to_int))
        .unwrap_or(0)
}

pub fn string_to_float(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}
