//! Dispatch table and control-flow outcomes.
//!
//! Uses a static function pointer table for O(1) opcode dispatch. Each
//! opcode maps to a handler that returns what the loop does next.

use crate::error::{RuntimeError, VmResult};
use crate::frame::Frame;
use crate::value::Value;
use crate::vm::Vm;
use kite_compiler::Opcode;

/// Control flow result from opcode execution.
#[derive(Debug)]
pub enum ControlFlow {
    /// Continue with the next instruction.
    Continue,
    /// Continue at an absolute offset.
    Jump(u32),
    /// Push a callee frame; its return value lands on the caller's stack.
    Call(Box<Frame>),
    /// Leave the frame with a value; no block intercepts it.
    Return(Value),
    /// Suspend a generator frame with a value.
    Yield(Value),
    /// Search the block stack for a block that intercepts `Why`.
    Unwind(Why),
}

/// Reason the block stack is being unwound.
#[derive(Debug, Clone)]
pub enum Why {
    /// An exception was raised.
    Exception(RuntimeError),
    /// `return` inside an active block.
    Return(Value),
    /// `break`.
    Break,
    /// `continue` to the loop header at this offset.
    Continue(u32),
}

/// Opcode handler function signature.
pub type OpHandler = fn(&mut Vm, &mut Frame, u32) -> VmResult<ControlFlow>;

/// Invalid opcode handler.
#[cold]
fn op_invalid(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    Err(RuntimeError::internal(format!(
        "no handler for instruction at offset {}",
        frame.last_offset
    )))
}

use crate::ops::arithmetic;
use crate::ops::calls;
use crate::ops::comparison;
use crate::ops::containers;
use crate::ops::control;
use crate::ops::load_store;
use crate::ops::objects;

/// Build the static dispatch table.
/// Returns array of 256 function pointers indexed by opcode.
const fn build_dispatch_table() -> [OpHandler; 256] {
    let mut table: [OpHandler; 256] = [op_invalid; 256];

    // Stack (0x01-0x07)
    table[Opcode::PopTop as usize] = load_store::pop_top;
    table[Opcode::RotTwo as usize] = load_store::rot_two;
    table[Opcode::RotThree as usize] = load_store::rot_three;
    table[Opcode::RotFour as usize] = load_store::rot_four;
    table[Opcode::DupTop as usize] = load_store::dup_top;
    table[Opcode::DupTopTwo as usize] = load_store::dup_top_two;
    table[Opcode::DupTopThree as usize] = load_store::dup_top_three;

    // Unary (0x10-0x14)
    table[Opcode::UnaryPositive as usize] = arithmetic::unary_positive;
    table[Opcode::UnaryNegative as usize] = arithmetic::unary_negative;
    table[Opcode::UnaryNot as usize] = arithmetic::unary_not;
    table[Opcode::UnaryInvert as usize] = arithmetic::unary_invert;
    table[Opcode::GetIter as usize] = containers::get_iter;

    // Binary (0x20-0x2C)
    table[Opcode::BinaryAdd as usize] = arithmetic::binary_add;
    table[Opcode::BinarySubtract as usize] = arithmetic::binary_subtract;
    table[Opcode::BinaryMultiply as usize] = arithmetic::binary_multiply;
    table[Opcode::BinaryDivide as usize] = arithmetic::binary_divide;
    table[Opcode::BinaryFloorDivide as usize] = arithmetic::binary_floor_divide;
    table[Opcode::BinaryModulo as usize] = arithmetic::binary_modulo;
    table[Opcode::BinaryPower as usize] = arithmetic::binary_power;
    table[Opcode::BinaryLshift as usize] = arithmetic::binary_lshift;
    table[Opcode::BinaryRshift as usize] = arithmetic::binary_rshift;
    table[Opcode::BinaryAnd as usize] = arithmetic::binary_and;
    table[Opcode::BinaryXor as usize] = arithmetic::binary_xor;
    table[Opcode::BinaryOr as usize] = arithmetic::binary_or;
    table[Opcode::BinarySubscr as usize] = containers::binary_subscr;

    // In-place (0x30-0x3B)
    table[Opcode::InplaceAdd as usize] = arithmetic::inplace_add;
    table[Opcode::InplaceSubtract as usize] = arithmetic::inplace_subtract;
    table[Opcode::InplaceMultiply as usize] = arithmetic::inplace_multiply;
    table[Opcode::InplaceDivide as usize] = arithmetic::inplace_divide;
    table[Opcode::InplaceFloorDivide as usize] = arithmetic::inplace_floor_divide;
    table[Opcode::InplaceModulo as usize] = arithmetic::inplace_modulo;
    table[Opcode::InplacePower as usize] = arithmetic::inplace_power;
    table[Opcode::InplaceLshift as usize] = arithmetic::inplace_lshift;
    table[Opcode::InplaceRshift as usize] = arithmetic::inplace_rshift;
    table[Opcode::InplaceAnd as usize] = arithmetic::inplace_and;
    table[Opcode::InplaceXor as usize] = arithmetic::inplace_xor;
    table[Opcode::InplaceOr as usize] = arithmetic::inplace_or;

    // Containers (0x40-0x45)
    table[Opcode::StoreSubscr as usize] = containers::store_subscr;
    table[Opcode::DeleteSubscr as usize] = containers::delete_subscr;
    table[Opcode::StoreMap as usize] = containers::store_map;
    table[Opcode::ListAppend as usize] = containers::list_append;
    table[Opcode::BuildSliceTwo as usize] = containers::build_slice_two;
    table[Opcode::BuildSliceThree as usize] = containers::build_slice_three;

    // Blocks and exceptions (0x50-0x59)
    table[Opcode::BreakLoop as usize] = control::break_loop;
    table[Opcode::WithCleanup as usize] = control::with_cleanup;
    table[Opcode::ReturnValue as usize] = control::return_value;
    table[Opcode::YieldValue as usize] = control::yield_value;
    table[Opcode::PopBlock as usize] = control::pop_block;
    table[Opcode::EndFinally as usize] = control::end_finally;
    table[Opcode::RaiseVarargsZero as usize] = control::raise_varargs_zero;
    table[Opcode::RaiseVarargsOne as usize] = control::raise_varargs_one;
    table[Opcode::RaiseVarargsTwo as usize] = control::raise_varargs_two;
    table[Opcode::RaiseVarargsThree as usize] = control::raise_varargs_three;

    // Names (0x60-0x6F)
    table[Opcode::LoadConst as usize] = load_store::load_const;
    table[Opcode::LoadName as usize] = load_store::load_name;
    table[Opcode::StoreName as usize] = load_store::store_name;
    table[Opcode::DeleteName as usize] = load_store::delete_name;
    table[Opcode::LoadGlobal as usize] = load_store::load_global;
    table[Opcode::StoreGlobal as usize] = load_store::store_global;
    table[Opcode::DeleteGlobal as usize] = load_store::delete_global;
    table[Opcode::LoadFast as usize] = load_store::load_fast;
    table[Opcode::StoreFast as usize] = load_store::store_fast;
    table[Opcode::DeleteFast as usize] = load_store::delete_fast;
    table[Opcode::LoadClosure as usize] = load_store::load_closure;
    table[Opcode::LoadDeref as usize] = load_store::load_deref;
    table[Opcode::StoreDeref as usize] = load_store::store_deref;
    table[Opcode::LoadAttr as usize] = objects::load_attr;
    table[Opcode::StoreAttr as usize] = objects::store_attr;
    table[Opcode::DeleteAttr as usize] = objects::delete_attr;

    // Builders (0x70-0x75)
    table[Opcode::BuildTuple as usize] = containers::build_tuple;
    table[Opcode::BuildList as usize] = containers::build_list;
    table[Opcode::BuildMap as usize] = containers::build_map;
    table[Opcode::UnpackSequence as usize] = containers::unpack_sequence;
    table[Opcode::CompareOp as usize] = comparison::compare_op;
    table[Opcode::LoadMethod as usize] = objects::load_method;

    // Jumps and blocks (0x80-0x8A)
    table[Opcode::JumpForward as usize] = control::jump_forward;
    table[Opcode::JumpAbsolute as usize] = control::jump_absolute;
    table[Opcode::PopJumpIfFalse as usize] = control::pop_jump_if_false;
    table[Opcode::PopJumpIfTrue as usize] = control::pop_jump_if_true;
    table[Opcode::JumpIfFalseOrPop as usize] = control::jump_if_false_or_pop;
    table[Opcode::JumpIfTrueOrPop as usize] = control::jump_if_true_or_pop;
    table[Opcode::ForIter as usize] = control::for_iter;
    table[Opcode::ContinueLoop as usize] = control::continue_loop;
    table[Opcode::SetupLoop as usize] = control::setup_loop;
    table[Opcode::SetupExcept as usize] = control::setup_except;
    table[Opcode::SetupFinally as usize] = control::setup_finally;

    // Calls (0x90-0x96)
    table[Opcode::CallFunction as usize] = calls::call_function;
    table[Opcode::CallFunctionVar as usize] = calls::call_function_var;
    table[Opcode::CallFunctionKw as usize] = calls::call_function_kw;
    table[Opcode::CallFunctionVarKw as usize] = calls::call_function_var_kw;
    table[Opcode::CallMethod as usize] = calls::call_method;
    table[Opcode::MakeFunction as usize] = calls::make_function;
    table[Opcode::MakeClosure as usize] = calls::make_closure;

    table
}

/// Static dispatch table.
pub static DISPATCH_TABLE: [OpHandler; 256] = build_dispatch_table();

/// Baseline handler for `opcode`.
#[inline(always)]
pub fn handler(opcode: Opcode) -> OpHandler {
    DISPATCH_TABLE[opcode as usize]
}
