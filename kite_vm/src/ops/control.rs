//! Jumps, blocks, returns and raising.
//!
//! Relative jump arguments are measured from the next instruction, which is
//! already in `frame.pc` when a handler runs.

use crate::dispatch::Why;
use crate::error::{RuntimeError, VmResult};
use crate::frame::{BlockKind, Frame};
use crate::ops::ControlFlow;
use crate::value::{Pending, Value};
use crate::vm::Vm;

// =============================================================================
// Jumps
// =============================================================================

#[inline]
pub fn jump_forward(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    Ok(ControlFlow::Jump(frame.pc + arg))
}

#[inline]
pub fn jump_absolute(_vm: &mut Vm, _frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    Ok(ControlFlow::Jump(arg))
}

fn pop_jump_if(vm: &mut Vm, frame: &mut Frame, target: u32, jump_when: bool) -> VmResult<ControlFlow> {
    let condition = frame.pop()?.truthy();
    vm.observe_branch(frame, condition);
    if condition == jump_when {
        Ok(ControlFlow::Jump(target))
    } else {
        Ok(ControlFlow::Continue)
    }
}

#[inline]
pub fn pop_jump_if_false(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    pop_jump_if(vm, frame, arg, false)
}

#[inline]
pub fn pop_jump_if_true(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    pop_jump_if(vm, frame, arg, true)
}

fn jump_if_or_pop(frame: &mut Frame, target: u32, jump_when: bool) -> VmResult<ControlFlow> {
    if frame.top()?.truthy() == jump_when {
        Ok(ControlFlow::Jump(target))
    } else {
        frame.pop()?;
        Ok(ControlFlow::Continue)
    }
}

#[inline]
pub fn jump_if_false_or_pop(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    jump_if_or_pop(frame, arg, false)
}

#[inline]
pub fn jump_if_true_or_pop(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    jump_if_or_pop(frame, arg, true)
}

/// Push the next item, or pop the exhausted iterator and jump.
pub fn for_iter(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let iter = frame.top()?.clone();
    match vm.next_item(&iter)? {
        Some(item) => {
            frame.push(item);
            Ok(ControlFlow::Continue)
        }
        None => {
            frame.pop()?;
            Ok(ControlFlow::Jump(frame.pc + arg))
        }
    }
}

// =============================================================================
// Blocks
// =============================================================================

#[inline]
pub fn setup_loop(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    frame.push_block(BlockKind::Loop, frame.pc + arg);
    Ok(ControlFlow::Continue)
}

#[inline]
pub fn setup_except(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    frame.push_block(BlockKind::Except, frame.pc + arg);
    Ok(ControlFlow::Continue)
}

#[inline]
pub fn setup_finally(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    frame.push_block(BlockKind::Finally, frame.pc + arg);
    Ok(ControlFlow::Continue)
}

pub fn pop_block(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let block = frame.pop_block()?;
    frame.stack.truncate(block.level);
    Ok(ControlFlow::Continue)
}

#[inline]
pub fn break_loop(_vm: &mut Vm, _frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    Ok(ControlFlow::Unwind(Why::Break))
}

#[inline]
pub fn continue_loop(_vm: &mut Vm, _frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    Ok(ControlFlow::Unwind(Why::Continue(arg)))
}

/// Pops the three-slot unwind record a `finally` or `except` block ends
/// with and resumes whatever it parked.
pub fn end_finally(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let top = frame.pop()?;
    let second = frame.pop()?;
    let third = frame.pop()?;
    match (top, second, third) {
        (Value::None, _, _) => Ok(ControlFlow::Continue),
        (Value::Pending(Pending::Return), value, _) => Ok(ControlFlow::Unwind(Why::Return(value))),
        (Value::Pending(Pending::Break), _, _) => Ok(ControlFlow::Unwind(Why::Break)),
        (Value::Pending(Pending::Continue), Value::Int(target), _) => {
            let target = u32::try_from(target)
                .map_err(|_| RuntimeError::internal("bad continue target"))?;
            Ok(ControlFlow::Unwind(Why::Continue(target)))
        }
        (Value::Class(_), _, Value::Traceback(err)) => {
            Ok(ControlFlow::Unwind(Why::Exception((*err).clone())))
        }
        (top, _, _) => Err(RuntimeError::internal(format!(
            "END_FINALLY on {}",
            top.repr()
        ))),
    }
}

/// [exit, tb, value, exc] → [tb, value, exc], or three `None`s when `exit`
/// swallowed the exception.
pub fn with_cleanup(vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let exc = frame.pop()?;
    let value = frame.pop()?;
    let tb = frame.pop()?;
    let exit = frame.pop()?;

    if matches!(exc, Value::Class(_)) {
        let args = vec![exc.clone(), value.clone(), Value::None];
        let suppress = vm.call_value(frame, &exit, args)?.truthy();
        if suppress {
            frame.stack.extend([Value::None, Value::None, Value::None]);
            return Ok(ControlFlow::Continue);
        }
    } else {
        vm.call_value(frame, &exit, vec![Value::None, Value::None, Value::None])?;
    }
    frame.stack.extend([tb, value, exc]);
    Ok(ControlFlow::Continue)
}

// =============================================================================
// Return and Yield
// =============================================================================

pub fn return_value(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let value = frame.pop()?;
    if frame.blocks.is_empty() {
        Ok(ControlFlow::Return(value))
    } else {
        Ok(ControlFlow::Unwind(Why::Return(value)))
    }
}

#[inline]
pub fn yield_value(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    Ok(ControlFlow::Yield(frame.pop()?))
}

// =============================================================================
// Raise
// =============================================================================

fn bad_raise(value: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "exceptions must be old-style classes or derived from BaseException, not {}",
        value.type_name()
    ))
}

/// Error for `raise kind` or `raise kind, value`.
fn build_exception(vm: &mut Vm, frame: &Frame, kind: Value, value: Option<Value>) -> RuntimeError {
    let result = match (&kind, value) {
        (Value::Class(class), value) if class.exception => {
            let instance = match value {
                Some(Value::Instance(inst)) if inst.class.is_subclass_of(class) => {
                    Ok(Value::Instance(inst))
                }
                value => {
                    let args = match value {
                        None | Some(Value::None) => Vec::new(),
                        Some(Value::Tuple(items)) => items.to_vec(),
                        Some(other) => vec![other],
                    };
                    vm.call_value(frame, &kind, args)
                }
            };
            instance.map(|inst| vm.error_from_instance(inst))
        }
        (Value::Instance(inst), None | Some(Value::None)) if inst.class.exception => {
            Ok(vm.error_from_instance(kind.clone()))
        }
        (Value::Instance(inst), Some(_)) if inst.class.exception => Err(RuntimeError::type_error(
            "instance exception may not have a separate value",
        )),
        (other, _) => Err(bad_raise(other)),
    };
    result.unwrap_or_else(|err| err)
}

/// Bare `raise`: re-raise the exception being handled.
pub fn raise_varargs_zero(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    match &frame.handled {
        Some(err) => Err(err.clone()),
        None => Err(bad_raise(&Value::None)),
    }
}

pub fn raise_varargs_one(vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let kind = frame.pop()?;
    Err(build_exception(vm, frame, kind, None))
}

pub fn raise_varargs_two(vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let value = frame.pop()?;
    let kind = frame.pop()?;
    Err(build_exception(vm, frame, kind, Some(value)))
}

/// The traceback operand is accepted and ignored.
pub fn raise_varargs_three(vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    frame.pop()?;
    let value = frame.pop()?;
    let kind = frame.pop()?;
    Err(build_exception(vm, frame, kind, Some(value)))
}
