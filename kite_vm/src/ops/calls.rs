//! Call and function construction handlers.

use crate::error::{RuntimeError, VmResult};
use crate::frame::Frame;
use crate::ops::ControlFlow;
use crate::value::{CellRef, Function, ObjectId, Value};
use crate::vm::Vm;
use std::rc::Rc;
use std::sync::Arc;

/// Positional and keyword counts of a packed call argument.
#[inline]
const fn unpack_call_arg(arg: u32) -> (usize, usize) {
    ((arg & 0xff) as usize, ((arg >> 8) & 0xff) as usize)
}

fn call(
    vm: &mut Vm,
    frame: &mut Frame,
    arg: u32,
    has_star: bool,
    has_kwargs: bool,
) -> VmResult<ControlFlow> {
    let (npos, nkw) = unpack_call_arg(arg);
    let kwargs_map = if has_kwargs { Some(frame.pop()?) } else { None };
    let star = if has_star { Some(frame.pop()?) } else { None };

    let pairs = frame.pop_n(2 * nkw)?;
    let mut kwargs = Vec::with_capacity(nkw);
    let mut pairs = pairs.into_iter();
    while let (Some(key), Some(value)) = (pairs.next(), pairs.next()) {
        match key {
            Value::Str(name) => kwargs.push((name, value)),
            other => {
                return Err(RuntimeError::internal(format!(
                    "keyword name is {}",
                    other.type_name()
                )));
            }
        }
    }

    let mut args = frame.pop_n(npos)?;
    let callee = frame.pop()?;

    if let Some(star) = star {
        args.extend(vm.collect_iterable(&star)?);
    }
    if let Some(mapping) = kwargs_map {
        let Value::Dict(d) = &mapping else {
            return Err(RuntimeError::type_error(format!(
                "argument after ** must be a mapping, not {}",
                mapping.type_name()
            )));
        };
        for (key, value) in d.borrow().items() {
            match key {
                Value::Str(name) => kwargs.push((Arc::clone(name), value.clone())),
                _ => return Err(RuntimeError::type_error("keywords must be strings")),
            }
        }
    }

    if !has_star && !has_kwargs && nkw == 0 {
        vm.observe_call(frame, &callee, npos);
    }
    vm.call_from_frame(frame, callee, args, kwargs)
}

pub fn call_function(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    call(vm, frame, arg, false, false)
}

pub fn call_function_var(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    call(vm, frame, arg, true, false)
}

pub fn call_function_kw(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    call(vm, frame, arg, false, true)
}

pub fn call_function_var_kw(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    call(vm, frame, arg, true, true)
}

/// [function, receiver | NULL, args...] → [result]
pub fn call_method(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let (npos, _) = unpack_call_arg(arg);
    let mut args = frame.pop_n(npos)?;
    let receiver = frame.pop()?;
    let function = frame.pop()?;
    if !matches!(receiver, Value::Null) {
        args.insert(0, receiver);
    }
    vm.call_from_frame(frame, function, args, Vec::new())
}

// =============================================================================
// Function Construction
// =============================================================================

fn build_function(
    frame: &mut Frame,
    ndefaults: u32,
    closure: Vec<CellRef>,
    code: Value,
) -> VmResult<ControlFlow> {
    let Value::Code(code) = code else {
        return Err(RuntimeError::internal(format!(
            "MAKE_FUNCTION on {}",
            code.type_name()
        )));
    };
    let defaults = frame.pop_n(ndefaults as usize)?;
    frame.push(Value::Function(Rc::new(Function {
        id: ObjectId::fresh(),
        name: Arc::clone(&code.name),
        globals: Rc::clone(&frame.globals),
        code,
        defaults,
        closure,
    })));
    Ok(ControlFlow::Continue)
}

/// [defaults..., code] → [function]
pub fn make_function(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let code = frame.pop()?;
    build_function(frame, arg, Vec::new(), code)
}

/// [defaults..., cells, code] → [function]
pub fn make_closure(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let code = frame.pop()?;
    let Value::Tuple(cells) = frame.pop()? else {
        return Err(RuntimeError::internal("MAKE_CLOSURE without a cell tuple"));
    };
    let closure = cells
        .iter()
        .map(|cell| match cell {
            Value::Cell(cell) => Ok(Rc::clone(cell)),
            other => Err(RuntimeError::internal(format!(
                "closure slot holds {}",
                other.type_name()
            ))),
        })
        .collect::<VmResult<Vec<_>>>()?;
    build_function(frame, arg, closure, code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_call_arg() {
        assert_eq!(unpack_call_arg(kite_compiler::pack_call_arg(3, 2)), (3, 2));
        assert_eq!(unpack_call_arg(0), (0, 0));
    }
}
