//! Opcode handler modules.
//!
//! Organized by category. Each handler takes the VM, the running frame and
//! the decoded argument, and returns a [`ControlFlow`]. The pure helpers the
//! handlers share (`binary_op`, `compare`, `subscript`, ...) are public so the
//! optimized-op table and the reference interpreter compute identical results.

pub mod arithmetic;
pub mod calls;
pub mod comparison;
pub mod containers;
pub mod control;
pub mod load_store;
pub mod objects;

pub use super::dispatch::ControlFlow;
