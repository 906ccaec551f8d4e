//! Arithmetic opcode handlers.
//!
//! Integers are 64-bit; overflow raises `ValueError` rather than promoting.
//! Integer `/` floors, as in the classic dialect.

use crate::error::{RuntimeError, VmResult};
use crate::frame::Frame;
use crate::ops::ControlFlow;
use crate::value::Value;
use crate::vm::Vm;
use kite_core::ast::{BinOp, UnaryOp};
use std::rc::Rc;
use std::sync::Arc;

/// Longest sequence a repetition may produce.
const MAX_REPEAT_LEN: usize = 1 << 28;

// =============================================================================
// Operators
// =============================================================================

/// Operator spelling used in error messages.
pub const fn symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::Pow => "** or pow()",
        BinOp::LShift => "<<",
        BinOp::RShift => ">>",
        BinOp::BitOr => "|",
        BinOp::BitXor => "^",
        BinOp::BitAnd => "&",
    }
}

#[inline]
const fn is_bitwise(op: BinOp) -> bool {
    matches!(
        op,
        BinOp::LShift | BinOp::RShift | BinOp::BitOr | BinOp::BitXor | BinOp::BitAnd
    )
}

#[cold]
fn overflow() -> RuntimeError {
    RuntimeError::value_error("integer overflow")
}

fn unsupported(op: BinOp, lhs: &Value, rhs: &Value) -> RuntimeError {
    RuntimeError::unsupported_operand(symbol(op), &lhs.type_name(), &rhs.type_name())
}

/// `lhs op rhs` for two integers.
pub fn int_arith(op: BinOp, x: i64, y: i64) -> VmResult<Value> {
    let value = match op {
        BinOp::Add => x.checked_add(y).ok_or_else(overflow)?,
        BinOp::Sub => x.checked_sub(y).ok_or_else(overflow)?,
        BinOp::Mul => x.checked_mul(y).ok_or_else(overflow)?,
        BinOp::Div | BinOp::FloorDiv => {
            if y == 0 {
                return Err(RuntimeError::zero_division(
                    "integer division or modulo by zero",
                ));
            }
            let q = x.checked_div(y).ok_or_else(overflow)?;
            if x % y != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q }
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(RuntimeError::zero_division(
                    "integer division or modulo by zero",
                ));
            }
            let r = x.checked_rem(y).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }
        }
        BinOp::Pow => {
            if y < 0 {
                return float_arith(BinOp::Pow, x as f64, y as f64);
            }
            let exp = u32::try_from(y).map_err(|_| overflow())?;
            x.checked_pow(exp).ok_or_else(overflow)?
        }
        BinOp::LShift => {
            if y < 0 {
                return Err(RuntimeError::value_error("negative shift count"));
            }
            if x == 0 {
                0
            } else if y >= 64 {
                return Err(overflow());
            } else {
                let shifted = x << y;
                if shifted >> y != x {
                    return Err(overflow());
                }
                shifted
            }
        }
        BinOp::RShift => {
            if y < 0 {
                return Err(RuntimeError::value_error("negative shift count"));
            }
            if y >= 64 { if x < 0 { -1 } else { 0 } } else { x >> y }
        }
        BinOp::BitAnd => x & y,
        BinOp::BitOr => x | y,
        BinOp::BitXor => x ^ y,
    };
    Ok(Value::Int(value))
}

/// `lhs op rhs` for two floats. Bitwise operators are rejected by the caller.
pub fn float_arith(op: BinOp, x: f64, y: f64) -> VmResult<Value> {
    let value = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(RuntimeError::zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(RuntimeError::zero_division("float divmod()"));
            }
            float_floor_div(x, y)
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(RuntimeError::zero_division("float modulo"));
            }
            float_mod(x, y)
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(RuntimeError::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            if x < 0.0 && y.fract() != 0.0 {
                return Err(RuntimeError::value_error(
                    "negative number cannot be raised to a fractional power",
                ));
            }
            x.powf(y)
        }
        _ => {
            return Err(RuntimeError::unsupported_operand(
                symbol(op),
                "float",
                "float",
            ));
        }
    };
    Ok(Value::Float(value))
}

/// Modulo with the sign of the divisor.
fn float_mod(x: f64, y: f64) -> f64 {
    let m = x % y;
    if m == 0.0 {
        0.0f64.copysign(y)
    } else if (m < 0.0) != (y < 0.0) {
        m + y
    } else {
        m
    }
}

fn float_floor_div(x: f64, y: f64) -> f64 {
    let m = x % y;
    let mut div = (x - m) / y;
    if m != 0.0 && ((y < 0.0) != (m < 0.0)) {
        div -= 1.0;
    }
    if div == 0.0 {
        return 0.0f64.copysign(x / y);
    }
    let floor = div.floor();
    if div - floor > 0.5 { floor + 1.0 } else { floor }
}

fn repeat<T: Clone>(items: &[T], count: i64) -> VmResult<Vec<T>> {
    let count = usize::try_from(count).unwrap_or(0);
    if items.len().saturating_mul(count) > MAX_REPEAT_LEN {
        return Err(RuntimeError::value_error("repeated sequence is too long"));
    }
    Ok((0..count).flat_map(|_| items.iter().cloned()).collect())
}

fn repeat_str(s: &str, count: i64) -> VmResult<Value> {
    let count = usize::try_from(count).unwrap_or(0);
    if s.len().saturating_mul(count) > MAX_REPEAT_LEN {
        return Err(RuntimeError::value_error("repeated string is too long"));
    }
    Ok(Value::Str(Arc::from(s.repeat(count))))
}

/// `lhs op rhs`.
pub fn binary_op(op: BinOp, lhs: &Value, rhs: &Value) -> VmResult<Value> {
    if let (Some(x), Some(y)) = (lhs.as_int(), rhs.as_int()) {
        return int_arith(op, x, y);
    }
    if lhs.type_tag().is_numeric() && rhs.type_tag().is_numeric() {
        if is_bitwise(op) {
            return Err(unsupported(op, lhs, rhs));
        }
        if let (Some(x), Some(y)) = (lhs.as_f64_exact(), rhs.as_f64_exact()) {
            return float_arith(op, x, y);
        }
    }

    match (op, lhs, rhs) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Ok(Value::Str(Arc::from(s)))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            Ok(Value::Tuple(a.iter().chain(b.iter()).cloned().collect::<Rc<[Value]>>()))
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            repeat_str(s, n.as_int().unwrap_or(0))
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if n.as_int().is_some() =>
        {
            let repeated = repeat(items.borrow().as_slice(), n.as_int().unwrap_or(0))?;
            Ok(Value::list(repeated))
        }
        (BinOp::Mul, Value::Tuple(items), n) | (BinOp::Mul, n, Value::Tuple(items))
            if n.as_int().is_some() =>
        {
            Ok(Value::tuple(repeat(&items[..], n.as_int().unwrap_or(0))?))
        }
        _ => Err(unsupported(op, lhs, rhs)),
    }
}

/// `lhs op= rhs`. Lists extend and repeat in place; everything else
/// rebinds.
pub fn inplace_op(op: BinOp, lhs: &Value, rhs: &Value) -> VmResult<Value> {
    match (op, lhs, rhs) {
        (BinOp::Add, Value::List(target), Value::List(source)) => {
            let extra = source.borrow().clone();
            target.borrow_mut().extend(extra);
            Ok(lhs.clone())
        }
        (BinOp::Mul, Value::List(target), n) if n.as_int().is_some() => {
            let repeated = repeat(target.borrow().as_slice(), n.as_int().unwrap_or(0))?;
            *target.borrow_mut() = repeated;
            Ok(lhs.clone())
        }
        _ => binary_op(op, lhs, rhs).map_err(|mut err| {
            if err.message.starts_with("unsupported operand") {
                err = RuntimeError::unsupported_operand(
                    &format!("{}=", symbol(op)),
                    &lhs.type_name(),
                    &rhs.type_name(),
                );
            }
            err
        }),
    }
}

/// `op value`.
pub fn unary_op(op: UnaryOp, value: &Value) -> VmResult<Value> {
    let bad = |sym: &str| {
        RuntimeError::type_error(format!(
            "bad operand type for unary {sym}: '{}'",
            value.type_name()
        ))
    };
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
        UnaryOp::UAdd => match value {
            Value::Float(x) => Ok(Value::Float(*x)),
            v => v.as_int().map(Value::Int).ok_or_else(|| bad("+")),
        },
        UnaryOp::USub => match value {
            Value::Float(x) => Ok(Value::Float(-x)),
            v => match v.as_int() {
                Some(i) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
                None => Err(bad("-")),
            },
        },
        UnaryOp::Invert => value.as_int().map(|i| Value::Int(!i)).ok_or_else(|| bad("~")),
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn binary(vm: &mut Vm, frame: &mut Frame, op: BinOp, inplace: bool) -> VmResult<ControlFlow> {
    let rhs = frame.pop()?;
    let lhs = frame.pop()?;
    vm.observe_operands(frame, &lhs, &rhs);
    let result = if inplace {
        inplace_op(op, &lhs, &rhs)?
    } else {
        binary_op(op, &lhs, &rhs)?
    };
    frame.push(result);
    Ok(ControlFlow::Continue)
}

fn unary(frame: &mut Frame, op: UnaryOp) -> VmResult<ControlFlow> {
    let value = frame.pop()?;
    frame.push(unary_op(op, &value)?);
    Ok(ControlFlow::Continue)
}

macro_rules! binary_handlers {
    ($($name:ident => $op:ident, $inplace:literal;)*) => {
        $(
            #[inline]
            pub fn $name(vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
                binary(vm, frame, BinOp::$op, $inplace)
            }
        )*
    };
}

binary_handlers! {
    binary_add => Add, false;
    binary_subtract => Sub, false;
    binary_multiply => Mul, false;
    binary_divide => Div, false;
    binary_floor_divide => FloorDiv, false;
    binary_modulo => Mod, false;
    binary_power => Pow, false;
    binary_lshift => LShift, false;
    binary_rshift => RShift, false;
    binary_and => BitAnd, false;
    binary_xor => BitXor, false;
    binary_or => BitOr, false;
    inplace_add => Add, true;
    inplace_subtract => Sub, true;
    inplace_multiply => Mul, true;
    inplace_divide => Div, true;
    inplace_floor_divide => FloorDiv, true;
    inplace_modulo => Mod, true;
    inplace_power => Pow, true;
    inplace_lshift => LShift, true;
    inplace_rshift => RShift, true;
    inplace_and => BitAnd, true;
    inplace_xor => BitXor, true;
    inplace_or => BitOr, true;
}

pub fn unary_positive(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    unary(frame, UnaryOp::UAdd)
}

pub fn unary_negative(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    unary(frame, UnaryOp::USub)
}

pub fn unary_not(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    unary(frame, UnaryOp::Not)
}

pub fn unary_invert(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    unary(frame, UnaryOp::Invert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeErrorKind;

    fn int(op: BinOp, x: i64, y: i64) -> VmResult<Value> {
        int_arith(op, x, y)
    }

    // =========================================================================
    // Integers
    // =========================================================================

    #[test]
    fn test_floor_semantics() {
        assert_eq!(int(BinOp::Div, 7, 2).unwrap().as_int(), Some(3));
        assert_eq!(int(BinOp::Div, -7, 2).unwrap().as_int(), Some(-4));
        assert_eq!(int(BinOp::FloorDiv, 7, -2).unwrap().as_int(), Some(-4));
        assert_eq!(int(BinOp::Mod, -7, 2).unwrap().as_int(), Some(1));
        assert_eq!(int(BinOp::Mod, 7, -2).unwrap().as_int(), Some(-1));
    }

    #[test]
    fn test_int_errors() {
        let err = int(BinOp::Div, 1, 0).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::ZeroDivisionError);
        assert_eq!(&*err.message, "integer division or modulo by zero");

        let err = int(BinOp::Add, i64::MAX, 1).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::ValueError);
        assert!(int(BinOp::Div, i64::MIN, -1).is_err());
        assert!(int(BinOp::LShift, 1, 63).is_err());
        assert_eq!(int(BinOp::LShift, 1, 62).unwrap().as_int(), Some(1 << 62));
        assert_eq!(
            &*int(BinOp::RShift, 1, -1).unwrap_err().message,
            "negative shift count"
        );
    }

    #[test]
    fn test_int_power() {
        assert_eq!(int(BinOp::Pow, 2, 10).unwrap().as_int(), Some(1024));
        assert!(matches!(int(BinOp::Pow, 2, -1).unwrap(), Value::Float(x) if x == 0.5));
        assert!(int(BinOp::Pow, 10, 40).is_err());
        assert_eq!(
            int(BinOp::Pow, 0, -1).unwrap_err().kind,
            RuntimeErrorKind::ZeroDivisionError
        );
    }

    #[test]
    fn test_shift_large_counts() {
        assert_eq!(int(BinOp::RShift, -5, 100).unwrap().as_int(), Some(-1));
        assert_eq!(int(BinOp::RShift, 5, 100).unwrap().as_int(), Some(0));
        assert_eq!(int(BinOp::LShift, 0, 100).unwrap().as_int(), Some(0));
    }

    // =========================================================================
    // Floats
    // =========================================================================

    #[test]
    fn test_float_mod_and_floor_div() {
        let m = float_arith(BinOp::Mod, -7.0, 2.0).unwrap();
        assert!(matches!(m, Value::Float(x) if x == 1.0));
        let d = float_arith(BinOp::FloorDiv, -7.0, 2.0).unwrap();
        assert!(matches!(d, Value::Float(x) if x == -4.0));
        let err = float_arith(BinOp::Div, 1.0, 0.0).unwrap_err();
        assert_eq!(&*err.message, "float division by zero");
    }

    #[test]
    fn test_mixed_numeric() {
        let v = binary_op(BinOp::Add, &Value::Int(1), &Value::Float(0.5)).unwrap();
        assert!(matches!(v, Value::Float(x) if x == 1.5));
        let v = binary_op(BinOp::Add, &Value::Bool(true), &Value::Bool(true)).unwrap();
        assert_eq!(v.as_int(), Some(2));
        let err = binary_op(BinOp::BitAnd, &Value::Float(1.0), &Value::Int(1)).unwrap_err();
        assert_eq!(
            &*err.message,
            "unsupported operand type(s) for &: 'float' and 'int'"
        );
    }

    // =========================================================================
    // Sequences
    // =========================================================================

    #[test]
    fn test_sequence_ops() {
        let s = binary_op(BinOp::Add, &Value::str("ab"), &Value::str("cd")).unwrap();
        assert_eq!(s.to_str(), "abcd");
        let s = binary_op(BinOp::Mul, &Value::Int(3), &Value::str("x")).unwrap();
        assert_eq!(s.to_str(), "xxx");
        let l = binary_op(BinOp::Mul, &Value::list(vec![Value::Int(1)]), &Value::Int(2)).unwrap();
        assert_eq!(l.repr(), "[1, 1]");
        let t = binary_op(
            BinOp::Add,
            &Value::tuple(vec![Value::Int(1)]),
            &Value::tuple(vec![Value::Int(2)]),
        )
        .unwrap();
        assert_eq!(t.repr(), "(1, 2)");
        assert!(binary_op(BinOp::Sub, &Value::str("a"), &Value::str("b")).is_err());
    }

    #[test]
    fn test_sequence_repeat_counts() {
        let items = vec![Value::Int(1), Value::str("a")];
        assert_eq!(repeat(&items, 2).unwrap().len(), 4);
        assert!(repeat(&items, 0).unwrap().is_empty());
        assert!(repeat(&items, -3).unwrap().is_empty());

        let t = binary_op(BinOp::Mul, &Value::Int(3), &Value::tuple(vec![Value::Int(7)])).unwrap();
        assert_eq!(t.repr(), "(7, 7, 7)");
        let l = binary_op(BinOp::Mul, &Value::list(vec![Value::Int(1)]), &Value::Int(-1)).unwrap();
        assert_eq!(l.repr(), "[]");

        let list = Value::list(vec![Value::Int(4), Value::Int(5)]);
        let alias = list.clone();
        inplace_op(BinOp::Mul, &list, &Value::Int(2)).unwrap();
        assert_eq!(alias.repr(), "[4, 5, 4, 5]");

        let err = repeat(&items, i64::MAX).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::ValueError);
    }

    #[test]
    fn test_inplace_list_aliases() {
        let list = Value::list(vec![Value::Int(1)]);
        let alias = list.clone();
        inplace_op(BinOp::Add, &list, &Value::list(vec![Value::Int(2)])).unwrap();
        assert_eq!(alias.repr(), "[1, 2]");

        let err = inplace_op(BinOp::Sub, &Value::str("a"), &Value::Int(1)).unwrap_err();
        assert_eq!(
            &*err.message,
            "unsupported operand type(s) for -=: 'str' and 'int'"
        );
    }

    // =========================================================================
    // Unary
    // =========================================================================

    #[test]
    fn test_unary() {
        assert_eq!(unary_op(UnaryOp::USub, &Value::Int(3)).unwrap().as_int(), Some(-3));
        assert_eq!(unary_op(UnaryOp::Invert, &Value::Int(0)).unwrap().as_int(), Some(-1));
        assert!(matches!(unary_op(UnaryOp::Not, &Value::str("")).unwrap(), Value::Bool(true)));
        assert!(unary_op(UnaryOp::USub, &Value::Int(i64::MIN)).is_err());
        let err = unary_op(UnaryOp::UAdd, &Value::str("x")).unwrap_err();
        assert_eq!(&*err.message, "bad operand type for unary +: 'str'");
    }
}
