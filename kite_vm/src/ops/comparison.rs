//! Comparison opcode handler and the shared comparison helpers.

use crate::error::{RuntimeError, VmResult};
use crate::frame::Frame;
use crate::ops::ControlFlow;
use crate::value::Value;
use crate::vm::Vm;
use kite_compiler::COMPARE_EXC_MATCH;
use kite_core::ast::CmpOp;
use std::cmp::Ordering;

/// `lhs op rhs`.
pub fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> VmResult<Value> {
    let result = match op {
        CmpOp::Eq => lhs.py_eq(rhs),
        CmpOp::NotEq => !lhs.py_eq(rhs),
        CmpOp::Is => lhs.is(rhs),
        CmpOp::IsNot => !lhs.is(rhs),
        CmpOp::In => contains(rhs, lhs)?,
        CmpOp::NotIn => !contains(rhs, lhs)?,
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
            let ordering = partial_order(lhs, rhs, op)?;
            match (op, ordering) {
                (_, None) => false,
                (CmpOp::Lt, Some(o)) => o == Ordering::Less,
                (CmpOp::LtE, Some(o)) => o != Ordering::Greater,
                (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
                (_, Some(o)) => o != Ordering::Less,
            }
        }
    };
    Ok(Value::Bool(result))
}

/// Ordering of two values; `None` when either is NaN.
pub fn partial_order(lhs: &Value, rhs: &Value, op: CmpOp) -> VmResult<Option<Ordering>> {
    if let (Some(x), Some(y)) = (lhs.as_int(), rhs.as_int()) {
        return Ok(Some(x.cmp(&y)));
    }
    if let (Some(x), Some(y)) = (lhs.as_f64_exact(), rhs.as_f64_exact()) {
        return Ok(x.partial_cmp(&y));
    }
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::Tuple(a), Value::Tuple(b)) => sequence_order(a, b, op),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            sequence_order(&a, &b, op)
        }
        _ => Err(RuntimeError::type_error(format!(
            "unorderable types: {}() {} {}()",
            lhs.type_name(),
            op.symbol(),
            rhs.type_name()
        ))),
    }
}

fn sequence_order(a: &[Value], b: &[Value], op: CmpOp) -> VmResult<Option<Ordering>> {
    for (x, y) in a.iter().zip(b) {
        if !x.py_eq(y) {
            return partial_order(x, y, op);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

/// `item in container`.
pub fn contains(container: &Value, item: &Value) -> VmResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            _ => Err(RuntimeError::type_error(
                "'in <string>' requires string as left operand",
            )),
        },
        Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.py_eq(item))),
        Value::Dict(d) => d.borrow().contains(item),
        other => Err(RuntimeError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

/// Whether a raised exception class matches an `except` pattern.
pub fn exception_matches(exc: &Value, pattern: &Value) -> VmResult<bool> {
    match pattern {
        Value::Tuple(items) => {
            for p in items.iter() {
                if exception_matches(exc, p)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Class(class) if class.exception => {
            Ok(matches!(exc, Value::Class(raised) if raised.is_subclass_of(class)))
        }
        _ => Err(RuntimeError::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

/// COMPARE_OP: `arg` is a [`CmpOp`] index or [`COMPARE_EXC_MATCH`].
pub fn compare_op(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let rhs = frame.pop()?;
    let lhs = frame.pop()?;
    let result = if arg == COMPARE_EXC_MATCH {
        Value::Bool(exception_matches(&lhs, &rhs)?)
    } else {
        let op = CmpOp::from_arg(arg)
            .ok_or_else(|| RuntimeError::internal(format!("bad comparison {arg}")))?;
        if arg <= CmpOp::GtE as u32 {
            vm.observe_operands(frame, &lhs, &rhs);
        }
        compare(op, &lhs, &rhs)?
    };
    frame.push(result);
    Ok(ControlFlow::Continue)
}
