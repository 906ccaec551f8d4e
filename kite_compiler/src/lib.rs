//! Bytecode compiler for Kite.
//!
//! Lowers an AST to stack-machine code objects.
//!
//! # Architecture
//!
//! ```text
//! AST → Symbol Table → Block Graph → Stack Depth → Layout → CompiledCode
//! ```
//!
//! # Key Types
//!
//! - [`CompiledCode`] - Immutable code object with bytecode, tables and line info
//! - [`Opcode`] - Instruction set with stack and jump effects
//! - [`BlockGraph`] - Basic blocks under construction
//! - [`SymbolTable`] - Name classification per scope
//!
//! # Example
//!
//! ```
//! use kite_compiler::{CompilerConfig, compile_module, disassemble};
//! use kite_core::ast::{Expr, Module, Stmt};
//!
//! let module = Module::new(vec![
//!     Stmt::assign(Expr::name("x"), Expr::int(1).add(Expr::int(2))).at(1),
//! ]);
//! let code = compile_module(&module, &CompilerConfig::default()).unwrap();
//! assert_eq!(code.first_line, 1);
//! assert!(disassemble(&code).unwrap().contains("BINARY_ADD"));
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod error;
pub mod exception_compiler;
pub mod expr_compiler;
pub mod function_compiler;
pub mod symtable;
pub mod unit;

pub use bytecode::{
    BlockGraph, BlockId, COMPARE_EXC_MATCH, CodeFlags, CodeId, CompiledCode, Constant,
    DecodeError, Decoded, HAVE_ARGUMENT, Instr, JumpKind, Opcode, StackDepthError, assemble,
    call_nargs, compute_max_depth, decode, decode_at, disassemble, encode, pack_call_arg,
};
pub use compiler::Compiler;
pub use config::{CompilerConfig, Limits};
pub use error::{CompileError, CompileResult};
pub use exception_compiler::EXEC;
pub use function_compiler::{BUILD_CLASS, LOCALS};
pub use symtable::{ScopeKind, SymbolScope, SymbolTable};

use kite_core::ast::Module;
use std::sync::Arc;

/// Compile `module` into its top-level code object.
///
/// Nested functions, classes and comprehensions are reachable through the
/// constants table.
pub fn compile_module(module: &Module, config: &CompilerConfig) -> CompileResult<Arc<CompiledCode>> {
    Compiler::compile_module(module, config)
}
