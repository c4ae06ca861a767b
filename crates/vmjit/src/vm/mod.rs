//! Execution substrate shared by the interpreter and compiled code
//!
//! - `value`: tagged arguments and typed return slots
//! - `frame`: per-thread frame stack and the frame layout contract
//! - `exception`: abort reasons and the exception record
//! - `heap`: object arena behind NEW
//! - `ops`: numeric and string semantics
//! - `interpreter`: reference interpreter
//! - `call`: dispatch between native, compiled and interpreted functions

pub mod call;
pub mod exception;
pub mod frame;
pub mod function;
pub mod heap;
pub mod interpreter;
pub mod ops;
pub mod value;

pub use exception::{AbortReason, JitExceptionInfo, ScriptException, VmError, NO_EXCEPTION};
pub use frame::{FrameLayout, FrameStack};
pub use function::VmFunction;
pub use value::{ReturnBuffer, ReturnValue, VmReturn, VmValue};
