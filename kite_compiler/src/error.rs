//! Compilation errors.

use crate::bytecode::stackdepth::StackDepthError;
use kite_core::KiteError;
use thiserror::Error;

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Everything that can abort compiling a module.
///
/// Errors are not recovered from: the first one aborts the enclosing unit and
/// every unit nested inside it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    /// The program is statically invalid.
    #[error("SyntaxError: {message} (line {line})")]
    Syntax {
        /// Error description.
        message: String,
        /// Line of the offending statement.
        line: u32,
    },

    /// A table or the bytecode outgrew what the encoding can address.
    #[error("too many {what} (limit {limit})")]
    ResourceLimit {
        /// Which resource overflowed.
        what: &'static str,
        /// The limit in force.
        limit: usize,
    },

    /// The block graph violates a stack-depth invariant.
    #[error(transparent)]
    StackDepth(#[from] StackDepthError),

    /// The compiler produced an inconsistent block graph.
    #[error("internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    /// Create a syntax error at `line`.
    pub fn syntax(message: impl Into<String>, line: u32) -> Self {
        Self::Syntax {
            message: message.into(),
            line,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<CompileError> for KiteError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Syntax { message, line } => KiteError::compile(message, Some(line)),
            CompileError::ResourceLimit { what, limit } => KiteError::ResourceLimit { what, limit },
            other => KiteError::internal(other.to_string()),
        }
    }
}
