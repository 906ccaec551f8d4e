//! # Kite Core
//!
//! Types shared by every Kite crate:
//!
//! - **AST**: the tree the compiler consumes ([`ast`])
//! - **Error Handling**: the pipeline-wide error umbrella ([`KiteError`])

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod ast;
pub mod error;

pub use error::{KiteError, KiteResult};

/// Kite toolchain version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
