//! Stack manipulation and name load/store handlers.

use crate::error::{RuntimeError, VmResult};
use crate::frame::Frame;
use crate::ops::ControlFlow;
use crate::value::Value;
use crate::vm::Vm;
use std::rc::Rc;

// =============================================================================
// Stack
// =============================================================================

fn top_n(frame: &mut Frame, n: usize) -> VmResult<&mut [Value]> {
    let len = frame.stack.len();
    if len < n {
        return Err(RuntimeError::internal(format!(
            "operand stack underflow at offset {}",
            frame.last_offset
        )));
    }
    Ok(&mut frame.stack[len - n..])
}

#[inline]
pub fn pop_top(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    frame.pop()?;
    Ok(ControlFlow::Continue)
}

/// [a, b] → [b, a]
#[inline]
pub fn rot_two(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    top_n(frame, 2)?.swap(0, 1);
    Ok(ControlFlow::Continue)
}

/// [a, b, c] → [c, a, b]
#[inline]
pub fn rot_three(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    top_n(frame, 3)?.rotate_right(1);
    Ok(ControlFlow::Continue)
}

/// [a, b, c, d] → [d, a, b, c]
#[inline]
pub fn rot_four(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    top_n(frame, 4)?.rotate_right(1);
    Ok(ControlFlow::Continue)
}

#[inline]
pub fn dup_top(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let top = frame.top()?.clone();
    frame.push(top);
    Ok(ControlFlow::Continue)
}

fn dup_n(frame: &mut Frame, n: usize) -> VmResult<ControlFlow> {
    top_n(frame, n)?;
    let start = frame.stack.len() - n;
    frame.stack.extend_from_within(start..);
    Ok(ControlFlow::Continue)
}

#[inline]
pub fn dup_top_two(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    dup_n(frame, 2)
}

#[inline]
pub fn dup_top_three(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    dup_n(frame, 3)
}

// =============================================================================
// Constants and Names
// =============================================================================

#[inline]
pub fn load_const(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let value = frame.constant(arg)?;
    frame.push(value);
    Ok(ControlFlow::Continue)
}

/// Locals, then globals, then builtins.
pub fn load_name(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let name = frame.name(arg)?;
    let local = frame
        .locals
        .as_ref()
        .and_then(|locals| locals.borrow().get_str(&name));
    let value = match local {
        Some(v) => v,
        None => frame
            .globals
            .borrow()
            .get_str(&name)
            .or_else(|| vm.builtins.borrow().get_str(&name))
            .ok_or_else(|| RuntimeError::name_error(&name))?,
    };
    frame.push(value);
    Ok(ControlFlow::Continue)
}

pub fn store_name(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let name = frame.name(arg)?;
    let value = frame.pop()?;
    let namespace = frame.locals.as_ref().unwrap_or(&frame.globals);
    namespace.borrow_mut().set_str(name, value);
    Ok(ControlFlow::Continue)
}

pub fn delete_name(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let name = frame.name(arg)?;
    let namespace = frame.locals.as_ref().unwrap_or(&frame.globals);
    if namespace.borrow_mut().remove_str(&name).is_none() {
        return Err(RuntimeError::name_error(&name));
    }
    Ok(ControlFlow::Continue)
}

/// Globals, then builtins.
pub fn load_global(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let name = frame.name(arg)?;
    let value = frame
        .globals
        .borrow()
        .get_str(&name)
        .or_else(|| vm.builtins.borrow().get_str(&name))
        .ok_or_else(|| RuntimeError::global_name_error(&name))?;
    frame.push(value);
    Ok(ControlFlow::Continue)
}

pub fn store_global(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let name = frame.name(arg)?;
    let value = frame.pop()?;
    frame.globals.borrow_mut().set_str(name, value);
    Ok(ControlFlow::Continue)
}

pub fn delete_global(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let name = frame.name(arg)?;
    if frame.globals.borrow_mut().remove_str(&name).is_none() {
        return Err(RuntimeError::global_name_error(&name));
    }
    Ok(ControlFlow::Continue)
}

// =============================================================================
// Fast Locals
// =============================================================================

#[inline]
pub fn load_fast(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    match frame.fast_slot(arg)?.clone() {
        Some(value) => {
            frame.push(value);
            Ok(ControlFlow::Continue)
        }
        None => Err(RuntimeError::unbound_local(frame.varname(arg)?)),
    }
}

#[inline]
pub fn store_fast(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let value = frame.pop()?;
    *frame.fast_slot(arg)? = Some(value);
    Ok(ControlFlow::Continue)
}

pub fn delete_fast(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    if frame.fast_slot(arg)?.take().is_none() {
        return Err(RuntimeError::unbound_local(frame.varname(arg)?));
    }
    Ok(ControlFlow::Continue)
}

// =============================================================================
// Cells
// =============================================================================

pub fn load_closure(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let cell = Rc::clone(frame.cell(arg)?);
    frame.push(Value::Cell(cell));
    Ok(ControlFlow::Continue)
}

pub fn load_deref(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let value = frame.cell(arg)?.borrow().clone();
    match value {
        Some(value) => {
            frame.push(value);
            Ok(ControlFlow::Continue)
        }
        None => {
            let name = frame.cell_name(arg)?;
            Err(if (arg as usize) < frame.code.cellvars.len() {
                RuntimeError::unbound_local(name)
            } else {
                RuntimeError::unbound_free(name)
            })
        }
    }
}

pub fn store_deref(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let value = frame.pop()?;
    *frame.cell(arg)?.borrow_mut() = Some(value);
    Ok(ControlFlow::Continue)
}
