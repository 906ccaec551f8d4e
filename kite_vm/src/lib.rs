//! Feedback-directed bytecode interpreter for Kite.
//!
//! Runs the stack-machine code produced by `kite_compiler`. Every opcode has a
//! baseline handler; hot code objects additionally get a
//! [`SpecializationPlan`] of guarded fast paths chosen from the feedback their
//! execution recorded:
//!
//! - **Feedback**: bounded per-site type, callee and receiver-class sets plus
//!   saturating branch counters
//! - **Guards**: cheap checks on the operand stack and on watched objects; a
//!   failed guard bails out to the baseline handler with the stack untouched
//! - **Invalidation**: plans register the classes and callees they depend on;
//!   mutating one clears the plan's validity flag before the change applies
//! - **Branch prediction**: likely-taken conditional jumps get a predicted path
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                        Vm                         │
//! ├───────────────────────────────────────────────────┤
//! │  Frame ─► decode ─► plan site? ─► guarded fast    │
//! │                │                      │ bailout   │
//! │                └────► baseline ◄──────┘           │
//! │                                                   │
//! │  ┌───────────────┐   ┌─────────────────────────┐  │
//! │  │ FeedbackStore │   │ InvalidationRegistry    │  │
//! │  │ (per CodeId)  │   │ (object → plan flags)   │  │
//! │  └───────────────┘   └─────────────────────────┘  │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use kite_compiler::{CompilerConfig, compile_module};
//! use kite_core::ast::{Expr, Module, Stmt};
//! use kite_vm::{Vm, VmConfig};
//!
//! let module = Module::new(vec![Stmt::assign(Expr::name("x"), Expr::int(1).add(Expr::int(2)))]);
//! let code = compile_module(&module, &CompilerConfig::default()).unwrap();
//! let mut vm = Vm::new(VmConfig::default());
//! vm.execute(code).unwrap();
//! assert_eq!(vm.global("x").and_then(|v| v.as_int()), Some(3));
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::new_without_default)]

// Core modules
pub mod config;
pub mod error;
pub mod frame;
pub mod value;
pub mod vm;

// Execution
pub mod builtins;
pub mod dispatch;
pub mod ops;
pub mod validate;

// Specialization
pub mod branch;
pub mod feedback;
pub mod guard;
pub mod invalidation;
pub mod optimized_ops;
pub mod specialize;

// Testing
pub mod reference;

// Re-exports
pub use branch::{BranchPrediction, CondBranchStats};
pub use config::VmConfig;
pub use dispatch::ControlFlow;
pub use error::{RuntimeError, RuntimeErrorKind, TraceEntry, VmResult};
pub use feedback::{BoundedFeedback, CodeProfile, FeedbackStore, SaturatingCounter, Stability};
pub use frame::Frame;
pub use guard::{BailoutCounter, BailoutReason, FastPath, Guard, GuardState, GuardedSpecialization};
pub use invalidation::{InvalidationReason, InvalidationRegistry, RegistryStats, ValidityFlag};
pub use reference::Reference;
pub use specialize::SpecializationPlan;
pub use validate::{BytecodeError, validate, validate_tree};
pub use value::{Class, Dict, Instance, ObjectId, TypeTag, Value};
pub use vm::{Vm, VmStats};

/// Compile and run `module` in a fresh VM with the default configuration.
pub fn run(module: &kite_core::ast::Module) -> kite_core::KiteResult<Value> {
    let mut vm = Vm::new(VmConfig::default());
    vm.run_module(module, &kite_compiler::CompilerConfig::default())
}
