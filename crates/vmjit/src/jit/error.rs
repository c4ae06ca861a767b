//! Compilation errors

use thiserror::Error;

use crate::bytecode::VerifyError;

/// Why a function could not be compiled. The caller keeps interpreting it.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("unknown opcode {op:#04x} at instruction {pc}")]
    UnknownOpcode { pc: usize, op: u8 },
    #[error("bytecode rejected: {0}")]
    Verify(VerifyError),
    #[error("malformed function {name}: {reason}")]
    Malformed { name: String, reason: String },
    #[error("code generation failed: {0}")]
    Codegen(String),
    #[error("module error: {0}")]
    Module(String),
    #[error("unsupported host: {0}")]
    Isa(String),
    #[error("code cache full ({size} bytes in use, limit {limit})")]
    CacheFull { size: usize, limit: usize },
    #[error("JIT compilation is disabled")]
    Disabled,
}

impl JitError {
    pub(crate) fn malformed(name: &str, reason: impl Into<String>) -> Self {
        JitError::Malformed { name: name.to_string(), reason: reason.into() }
    }
}

impl From<VerifyError> for JitError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::UnknownOpcode { pc, op } => JitError::UnknownOpcode { pc, op },
            other => JitError::Verify(other),
        }
    }
}
