//! Shared helpers for the integration tests: run a function in both execution
//! modes and compare what each one observably did.

#![allow(dead_code)]

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use vmjit::bytecode::{RegClass, ScriptFunction};
use vmjit::jit::{compile_function, CompiledFunction, JitRuntime, OptLevel};
use vmjit::vm::{interpreter, AbortReason, ReturnBuffer, ReturnValue, ScriptException, VmValue};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Compile with the shared runtime, keeping the listing.
pub fn compile(func: &Arc<ScriptFunction>) -> CompiledFunction {
    init_tracing();
    let runtime = JitRuntime::acquire(OptLevel::Speed).expect("host runtime");
    compile_function(&runtime, func, true).expect("function compiles")
}

/// A return value with floats compared by bit pattern (any NaN equals any NaN).
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Int(i32),
    Float(u64),
    NaN,
    Str(String),
    Ptr(usize),
}

impl From<ReturnValue> for Observed {
    fn from(value: ReturnValue) -> Self {
        match value {
            ReturnValue::Int(v) => Observed::Int(v),
            ReturnValue::Float(v) if v.is_nan() => Observed::NaN,
            ReturnValue::Float(v) => Observed::Float(v.to_bits()),
            ReturnValue::String(s) => Observed::Str(s),
            ReturnValue::Pointer(p) => Observed::Ptr(p as usize),
        }
    }
}

/// Everything a caller can observe about one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Returned { count: usize, values: Vec<Observed> },
    Aborted { reason: AbortReason, arg: i32, at: Option<usize> },
}

impl Outcome {
    pub fn values(&self) -> &[Observed] {
        match self {
            Outcome::Returned { values, .. } => values,
            Outcome::Aborted { .. } => panic!("call aborted: {self:?}"),
        }
    }

    pub fn int(&self, index: usize) -> i32 {
        match &self.values()[index] {
            Observed::Int(v) => *v,
            other => panic!("expected an int, got {other:?}"),
        }
    }

    pub fn float(&self, index: usize) -> f64 {
        match &self.values()[index] {
            Observed::Float(bits) => f64::from_bits(*bits),
            Observed::NaN => f64::NAN,
            other => panic!("expected a float, got {other:?}"),
        }
    }

    pub fn string(&self, index: usize) -> &str {
        match &self.values()[index] {
            Observed::Str(s) => s,
            other => panic!("expected a string, got {other:?}"),
        }
    }
}

fn observe(func: &ScriptFunction, result: Result<usize, ScriptException>, rets: &ReturnBuffer) -> Outcome {
    match result {
        Ok(count) => Outcome::Returned {
            count,
            values: (0..rets.len()).filter_map(|i| rets.get(i)).map(Observed::from).collect(),
        },
        Err(e) => Outcome::Aborted { reason: e.reason, arg: e.arg, at: e.instruction_index(func) },
    }
}

pub fn interpret(func: &Arc<ScriptFunction>, args: &[VmValue], classes: &[RegClass]) -> Outcome {
    let mut rets = ReturnBuffer::new(classes);
    let result = interpreter::call(func, args, &mut rets);
    observe(func, result, &rets)
}

pub fn run_compiled(code: &CompiledFunction, args: &[VmValue], classes: &[RegClass]) -> Outcome {
    let mut rets = ReturnBuffer::new(classes);
    let result = code.call(args, &mut rets);
    observe(code.function(), result, &rets)
}

/// Run `func` interpreted and compiled with the same inputs and require the
/// same outcome.
pub fn assert_equivalent(
    func: &Arc<ScriptFunction>,
    code: &CompiledFunction,
    args: &[VmValue],
    classes: &[RegClass],
) -> Outcome {
    let expected = interpret(func, args, classes);
    let actual = run_compiled(code, args, classes);
    assert_eq!(actual, expected, "{} with {:?}", func.name(), args);
    actual
}

/// Boundary integers used across the equivalence tests.
pub const INTS: &[i32] = &[0, 1, -1, 2, -7, 7, 31, 32, 33, 255, 65_535, i32::MIN, i32::MAX, i32::MIN + 1];

/// Boundary floats used across the equivalence tests.
pub const FLOATS: &[f64] = &[
    0.0,
    -0.0,
    1.0,
    -1.5,
    2.5,
    1e-300,
    1e300,
    f64::INFINITY,
    f64::NEG_INFINITY,
    f64::NAN,
    0.1,
    1.0 / 65536.0,
];
