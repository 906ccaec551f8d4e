//! Shared error type for the Kite toolchain.
//!
//! Each crate has its own precise error enum (`CompileError`, `RuntimeError`).
//! Callers that drive the whole pipeline (compile, then run) get this umbrella
//! type instead; the per-crate errors convert into it with `From`.

use thiserror::Error;

/// The unified result type for whole-pipeline entry points.
pub type KiteResult<T> = Result<T, KiteError>;

/// Every failure a compile-and-run pipeline can surface.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KiteError {
    /// Statically invalid program (`break` outside a loop, ...).
    #[error("SyntaxError: {message}{}", fmt_line(.line))]
    Compile {
        /// Error description.
        message: String,
        /// Source line, when known.
        line: Option<u32>,
    },

    /// A table or the bytecode grew past what the format can index.
    #[error("ResourceLimitError: too many {what} (limit {limit})")]
    ResourceLimit {
        /// What overflowed (e.g. "constants").
        what: &'static str,
        /// The configured limit.
        limit: usize,
    },

    /// An exception escaped the executed code.
    #[error("{kind}: {message}")]
    Runtime {
        /// Exception type name.
        kind: String,
        /// Exception message.
        message: String,
    },

    /// A code object failed validation; it is never run.
    #[error("MalformedBytecode: {message}")]
    MalformedBytecode {
        /// What was wrong.
        message: String,
    },

    /// Internal invariant violation.
    #[error("InternalError: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

fn fmt_line(line: &Option<u32>) -> String {
    match line {
        Some(line) => format!(" (line {line})"),
        None => String::new(),
    }
}

impl KiteError {
    /// Create a compile error.
    #[must_use]
    pub fn compile(message: impl Into<String>, line: Option<u32>) -> Self {
        Self::Compile {
            message: message.into(),
            line,
        }
    }

    /// Create a runtime error.
    #[must_use]
    pub fn runtime(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Runtime {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The exception type name a host would report.
    #[must_use]
    pub fn exception_type(&self) -> &str {
        match self {
            Self::Compile { .. } => "SyntaxError",
            Self::ResourceLimit { .. } => "SystemError",
            Self::Runtime { kind, .. } => kind,
            Self::MalformedBytecode { .. } => "SystemError",
            Self::Internal { .. } => "SystemError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let err = KiteError::compile("'break' outside loop", Some(3));
        assert_eq!(err.to_string(), "SyntaxError: 'break' outside loop (line 3)");
        assert_eq!(err.exception_type(), "SyntaxError");
    }

    #[test]
    fn test_runtime_error_display() {
        let err = KiteError::runtime("ZeroDivisionError", "division by zero");
        assert_eq!(err.to_string(), "ZeroDivisionError: division by zero");
        assert_eq!(err.exception_type(), "ZeroDivisionError");
    }

    #[test]
    fn test_resource_limit_display() {
        let err = KiteError::ResourceLimit {
            what: "constants",
            limit: 10,
        };
        assert_eq!(err.to_string(), "ResourceLimitError: too many constants (limit 10)");
    }
}
