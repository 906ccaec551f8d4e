//! Runtime error types for the virtual machine.
//!
//! A `RuntimeError` is both the Rust-level error returned from handlers and
//! the carrier of a raised exception object while it propagates between
//! frames. Kinds mirror the builtin exception classes so `except` clauses can
//! match errors raised by the VM itself.

use crate::validate::BytecodeError;
use crate::value::Value;
use kite_core::KiteError;
use std::fmt;
use std::sync::Arc;

/// Runtime error during bytecode execution.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    /// Error kind
    pub kind: RuntimeErrorKind,
    /// Human readable message (may be empty)
    pub message: Arc<str>,
    /// Line of the innermost frame, once known
    pub line: Option<u32>,
    /// Traceback frames, innermost first
    pub traceback: Vec<TraceEntry>,
    /// The exception instance, when one has been materialized
    pub(crate) payload: Option<Value>,
}

/// Specific runtime error types.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeErrorKind {
    // =========================================================================
    // Catchable
    // =========================================================================
    /// Operation not supported for the operand types.
    TypeError,
    /// Name not bound in any namespace.
    NameError,
    /// Attribute not found.
    AttributeError,
    /// Division or modulo by zero.
    ZeroDivisionError,
    /// Sequence index out of range.
    IndexError,
    /// Mapping key not found.
    KeyError,
    /// Right type, wrong value.
    ValueError,
    /// Iterator exhausted.
    StopIteration,
    /// `assert` failed.
    AssertionError,
    /// User raise of a class without a dedicated kind.
    Exception {
        /// Name of the raised class.
        class: Arc<str>,
    },
    /// Call depth exceeded `VmConfig::max_recursion_depth`.
    RecursionLimit,

    // =========================================================================
    // Fatal
    // =========================================================================
    /// The code object failed validation.
    MalformedBytecode(BytecodeError),
    /// The operand stack grew past the code's declared depth.
    StackOverflow,
    /// VM invariant violation.
    Internal,
}

impl RuntimeErrorKind {
    /// Exception class name reported for this kind.
    pub fn name(&self) -> &str {
        match self {
            Self::TypeError => "TypeError",
            Self::NameError => "NameError",
            Self::AttributeError => "AttributeError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::IndexError => "IndexError",
            Self::KeyError => "KeyError",
            Self::ValueError => "ValueError",
            Self::StopIteration => "StopIteration",
            Self::AssertionError => "AssertionError",
            Self::Exception { class } => class,
            Self::RecursionLimit => "RuntimeError",
            Self::MalformedBytecode(_) => "SystemError",
            Self::StackOverflow => "SystemError",
            Self::Internal => "SystemError",
        }
    }

    /// Kind for a builtin exception class name.
    pub fn from_class_name(name: &str) -> Option<Self> {
        Some(match name {
            "TypeError" => Self::TypeError,
            "NameError" => Self::NameError,
            "AttributeError" => Self::AttributeError,
            "ZeroDivisionError" => Self::ZeroDivisionError,
            "IndexError" => Self::IndexError,
            "KeyError" => Self::KeyError,
            "ValueError" => Self::ValueError,
            "StopIteration" => Self::StopIteration,
            "AssertionError" => Self::AssertionError,
            "RuntimeError" => Self::RecursionLimit,
            _ => return None,
        })
    }

    /// Fatal kinds skip every handler and abort execution.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedBytecode(_) | Self::StackOverflow | Self::Internal
        )
    }
}

/// A single entry in the traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Function name
    pub func_name: Arc<str>,
    /// File name
    pub filename: Arc<str>,
    /// Line number
    pub line: u32,
}

impl RuntimeError {
    /// Create a new runtime error.
    #[inline]
    pub fn new(kind: RuntimeErrorKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            traceback: Vec::new(),
            payload: None,
        }
    }

    /// Add a traceback entry; the first entry also fixes the error line.
    #[inline]
    pub fn add_traceback(&mut self, entry: TraceEntry) {
        if self.line.is_none() && entry.line > 0 {
            self.line = Some(entry.line);
        }
        self.traceback.push(entry);
    }

    /// The raised exception instance, if any.
    #[inline]
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub(crate) fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    // =========================================================================
    // Convenience Constructors
    // =========================================================================

    #[inline]
    pub fn type_error(message: impl Into<Arc<str>>) -> Self {
        Self::new(RuntimeErrorKind::TypeError, message)
    }

    #[inline]
    pub fn unsupported_operand(op: &str, left: &str, right: &str) -> Self {
        Self::type_error(format!(
            "unsupported operand type(s) for {op}: '{left}' and '{right}'"
        ))
    }

    #[inline]
    pub fn not_callable(type_name: &str) -> Self {
        Self::type_error(format!("'{type_name}' object is not callable"))
    }

    #[inline]
    pub fn not_iterable(type_name: &str) -> Self {
        Self::type_error(format!("'{type_name}' object is not iterable"))
    }

    #[inline]
    pub fn name_error(name: &str) -> Self {
        Self::new(
            RuntimeErrorKind::NameError,
            format!("name '{name}' is not defined"),
        )
    }

    #[inline]
    pub fn global_name_error(name: &str) -> Self {
        Self::new(
            RuntimeErrorKind::NameError,
            format!("global name '{name}' is not defined"),
        )
    }

    #[inline]
    pub fn unbound_local(name: &str) -> Self {
        Self::new(
            RuntimeErrorKind::NameError,
            format!("local variable '{name}' referenced before assignment"),
        )
    }

    #[inline]
    pub fn unbound_free(name: &str) -> Self {
        Self::new(
            RuntimeErrorKind::NameError,
            format!("free variable '{name}' referenced before assignment in enclosing scope"),
        )
    }

    #[inline]
    pub fn attribute_error(type_name: &str, attr: &str) -> Self {
        Self::new(
            RuntimeErrorKind::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
    }

    #[inline]
    pub fn index_error(message: impl Into<Arc<str>>) -> Self {
        Self::new(RuntimeErrorKind::IndexError, message)
    }

    #[inline]
    pub fn key_error(key: impl Into<Arc<str>>) -> Self {
        Self::new(RuntimeErrorKind::KeyError, key)
    }

    #[inline]
    pub fn value_error(message: impl Into<Arc<str>>) -> Self {
        Self::new(RuntimeErrorKind::ValueError, message)
    }

    #[inline]
    pub fn zero_division(message: impl Into<Arc<str>>) -> Self {
        Self::new(RuntimeErrorKind::ZeroDivisionError, message)
    }

    #[inline]
    pub fn stop_iteration() -> Self {
        Self::new(RuntimeErrorKind::StopIteration, "")
    }

    #[inline]
    pub fn recursion_limit() -> Self {
        Self::new(
            RuntimeErrorKind::RecursionLimit,
            "maximum recursion depth exceeded",
        )
    }

    #[inline]
    pub fn malformed(err: BytecodeError) -> Self {
        let message = err.to_string();
        Self::new(RuntimeErrorKind::MalformedBytecode(err), message)
    }

    #[inline]
    pub fn stack_overflow(depth: usize) -> Self {
        Self::new(
            RuntimeErrorKind::StackOverflow,
            format!("operand stack overflow at depth {depth}"),
        )
    }

    #[inline]
    pub fn internal(message: impl Into<Arc<str>>) -> Self {
        Self::new(RuntimeErrorKind::Internal, message)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), self.message)
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<BytecodeError> for RuntimeError {
    fn from(err: BytecodeError) -> Self {
        Self::malformed(err)
    }
}

impl From<RuntimeError> for KiteError {
    fn from(err: RuntimeError) -> Self {
        match &err.kind {
            RuntimeErrorKind::MalformedBytecode(inner) => KiteError::MalformedBytecode {
                message: inner.to_string(),
            },
            RuntimeErrorKind::Internal => KiteError::internal(&*err.message),
            kind => KiteError::runtime(kind.name(), &*err.message),
        }
    }
}

/// Result type for VM operations.
pub type VmResult<T> = Result<T, RuntimeError>;
