//! Type-specialized operator implementations.
//!
//! Each entry is keyed by operator and exact operand types. Implementations
//! go through the same helpers as the baseline handlers so a fast path
//! can never produce a different result; they only skip the generic type
//! dispatch. An entry returns `None` when the baseline would raise, and the
//! guarded site then bails out to the safe path, which raises.

use crate::ops::arithmetic::{float_arith, int_arith};
use crate::ops::comparison::compare;
use crate::value::{TypeTag, Value};
use kite_compiler::Opcode;
use kite_core::ast::{BinOp, CmpOp};
use std::sync::Arc;

/// Specialized operator: `None` declines.
pub type OperatorFn = fn(&Value, &Value) -> Option<Value>;

/// Operator a table entry implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKey {
    Bin(BinOp),
    Cmp(CmpOp),
}

/// One row of the table.
#[derive(Clone, Copy)]
pub struct OptimizedOp {
    pub key: OperatorKey,
    pub lhs: TypeTag,
    pub rhs: TypeTag,
    pub func: OperatorFn,
}

/// Operator implemented by `opcode`, if it has table entries.
pub fn key_for(opcode: Opcode, arg: u32) -> Option<OperatorKey> {
    let bin = match opcode {
        Opcode::BinaryAdd | Opcode::InplaceAdd => BinOp::Add,
        Opcode::BinarySubtract | Opcode::InplaceSubtract => BinOp::Sub,
        Opcode::BinaryMultiply | Opcode::InplaceMultiply => BinOp::Mul,
        Opcode::BinaryDivide | Opcode::InplaceDivide => BinOp::Div,
        Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => BinOp::FloorDiv,
        Opcode::BinaryModulo | Opcode::InplaceModulo => BinOp::Mod,
        Opcode::BinaryPower | Opcode::InplacePower => BinOp::Pow,
        Opcode::BinaryLshift | Opcode::InplaceLshift => BinOp::LShift,
        Opcode::BinaryRshift | Opcode::InplaceRshift => BinOp::RShift,
        Opcode::BinaryAnd | Opcode::InplaceAnd => BinOp::BitAnd,
        Opcode::BinaryXor | Opcode::InplaceXor => BinOp::BitXor,
        Opcode::BinaryOr | Opcode::InplaceOr => BinOp::BitOr,
        Opcode::CompareOp if arg <= CmpOp::GtE as u32 => {
            return CmpOp::from_arg(arg).map(OperatorKey::Cmp);
        }
        _ => return None,
    };
    Some(OperatorKey::Bin(bin))
}

/// Table entry for `key` on exactly these operand types.
pub fn lookup(key: OperatorKey, lhs: TypeTag, rhs: TypeTag) -> Option<OperatorFn> {
    OPTIMIZED_OPS
        .iter()
        .find(|op| op.key == key && op.lhs == lhs && op.rhs == rhs)
        .map(|op| op.func)
}

// =============================================================================
// Implementations
// =============================================================================

macro_rules! int_ops {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            fn $name(lhs: &Value, rhs: &Value) -> Option<Value> {
                match (lhs, rhs) {
                    (Value::Int(x), Value::Int(y)) => int_arith(BinOp::$op, *x, *y).ok(),
                    _ => None,
                }
            }
        )*
    };
}

macro_rules! float_ops {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            fn $name(lhs: &Value, rhs: &Value) -> Option<Value> {
                let x = lhs.as_f64_exact()?;
                let y = rhs.as_f64_exact()?;
                float_arith(BinOp::$op, x, y).ok()
            }
        )*
    };
}

macro_rules! cmp_ops {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            fn $name(lhs: &Value, rhs: &Value) -> Option<Value> {
                compare(CmpOp::$op, lhs, rhs).ok()
            }
        )*
    };
}

int_ops! {
    int_add => Add,
    int_sub => Sub,
    int_mul => Mul,
    int_div => Div,
    int_floor_div => FloorDiv,
    int_mod => Mod,
    int_pow => Pow,
    int_lshift => LShift,
    int_rshift => RShift,
    int_and => BitAnd,
    int_or => BitOr,
    int_xor => BitXor,
}

float_ops! {
    float_add => Add,
    float_sub => Sub,
    float_mul => Mul,
    float_div => Div,
    float_floor_div => FloorDiv,
    float_mod => Mod,
    float_pow => Pow,
}

cmp_ops! {
    cmp_lt => Lt,
    cmp_le => LtE,
    cmp_eq => Eq,
    cmp_ne => NotEq,
    cmp_gt => Gt,
    cmp_ge => GtE,
}

fn str_concat(lhs: &Value, rhs: &Value) -> Option<Value> {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Some(Value::Str(Arc::from(s)))
        }
        _ => None,
    }
}

// =============================================================================
// Table
// =============================================================================

macro_rules! table {
    ($(($key:expr, $lhs:ident, $rhs:ident, $func:ident)),* $(,)?) => {
        &[$(OptimizedOp {
            key: $key,
            lhs: TypeTag::$lhs,
            rhs: TypeTag::$rhs,
            func: $func,
        }),*]
    };
}

use OperatorKey::{Bin, Cmp};

/// Every specialized operator.
pub static OPTIMIZED_OPS: &[OptimizedOp] = table![
    (Bin(BinOp::Add), Int, Int, int_add),
    (Bin(BinOp::Sub), Int, Int, int_sub),
    (Bin(BinOp::Mul), Int, Int, int_mul),
    (Bin(BinOp::Div), Int, Int, int_div),
    (Bin(BinOp::FloorDiv), Int, Int, int_floor_div),
    (Bin(BinOp::Mod), Int, Int, int_mod),
    (Bin(BinOp::Pow), Int, Int, int_pow),
    (Bin(BinOp::LShift), Int, Int, int_lshift),
    (Bin(BinOp::RShift), Int, Int, int_rshift),
    (Bin(BinOp::BitAnd), Int, Int, int_and),
    (Bin(BinOp::BitOr), Int, Int, int_or),
    (Bin(BinOp::BitXor), Int, Int, int_xor),
    (Bin(BinOp::Add), Float, Float, float_add),
    (Bin(BinOp::Sub), Float, Float, float_sub),
    (Bin(BinOp::Mul), Float, Float, float_mul),
    (Bin(BinOp::Div), Float, Float, float_div),
    (Bin(BinOp::FloorDiv), Float, Float, float_floor_div),
    (Bin(BinOp::Mod), Float, Float, float_mod),
    (Bin(BinOp::Pow), Float, Float, float_pow),
    (Bin(BinOp::Add), Int, Float, float_add),
    (Bin(BinOp::Sub), Int, Float, float_sub),
    (Bin(BinOp::Mul), Int, Float, float_mul),
    (Bin(BinOp::Div), Int, Float, float_div),
    (Bin(BinOp::Add), Float, Int, float_add),
    (Bin(BinOp::Sub), Float, Int, float_sub),
    (Bin(BinOp::Mul), Float, Int, float_mul),
    (Bin(BinOp::Div), Float, Int, float_div),
    (Bin(BinOp::Add), Str, Str, str_concat),
    (Cmp(CmpOp::Lt), Int, Int, cmp_lt),
    (Cmp(CmpOp::LtE), Int, Int, cmp_le),
    (Cmp(CmpOp::Eq), Int, Int, cmp_eq),
    (Cmp(CmpOp::NotEq), Int, Int, cmp_ne),
    (Cmp(CmpOp::Gt), Int, Int, cmp_gt),
    (Cmp(CmpOp::GtE), Int, Int, cmp_ge),
    (Cmp(CmpOp::Lt), Float, Float, cmp_lt),
    (Cmp(CmpOp::LtE), Float, Float, cmp_le),
    (Cmp(CmpOp::Eq), Float, Float, cmp_eq),
    (Cmp(CmpOp::NotEq), Float, Float, cmp_ne),
    (Cmp(CmpOp::Gt), Float, Float, cmp_gt),
    (Cmp(CmpOp::GtE), Float, Float, cmp_ge),
    (Cmp(CmpOp::Lt), Str, Str, cmp_lt),
    (Cmp(CmpOp::LtE), Str, Str, cmp_le),
    (Cmp(CmpOp::Eq), Str, Str, cmp_eq),
    (Cmp(CmpOp::NotEq), Str, Str, cmp_ne),
    (Cmp(CmpOp::Gt), Str, Str, cmp_gt),
    (Cmp(CmpOp::GtE), Str, Str, cmp_ge),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::arithmetic::binary_op;

    #[test]
    fn test_key_for_opcodes() {
        assert_eq!(
            key_for(Opcode::InplaceAdd, 0),
            Some(OperatorKey::Bin(BinOp::Add))
        );
        assert_eq!(
            key_for(Opcode::CompareOp, CmpOp::Gt as u32),
            Some(OperatorKey::Cmp(CmpOp::Gt))
        );
        assert_eq!(key_for(Opcode::CompareOp, CmpOp::In as u32), None);
        assert_eq!(key_for(Opcode::LoadConst, 0), None);
    }

    #[test]
    fn test_lookup_is_exact_on_types() {
        let add = OperatorKey::Bin(BinOp::Add);
        assert!(lookup(add, TypeTag::Int, TypeTag::Int).is_some());
        assert!(lookup(add, TypeTag::Bool, TypeTag::Int).is_none());
        assert!(lookup(add, TypeTag::List, TypeTag::List).is_none());
        assert!(lookup(OperatorKey::Bin(BinOp::BitAnd), TypeTag::Float, TypeTag::Float).is_none());
    }

    #[test]
    fn test_entries_match_baseline() {
        let samples = [
            Value::Int(7),
            Value::Int(-3),
            Value::Int(0),
            Value::Int(i64::MAX),
            Value::Float(2.5),
            Value::Float(-0.0),
            Value::str("ab"),
        ];
        for op in OPTIMIZED_OPS {
            for l in samples.iter().filter(|v| v.type_tag() == op.lhs) {
                for r in samples.iter().filter(|v| v.type_tag() == op.rhs) {
                    let baseline = match op.key {
                        OperatorKey::Bin(b) => binary_op(b, l, r),
                        OperatorKey::Cmp(c) => compare(c, l, r),
                    };
                    match (baseline, (op.func)(l, r)) {
                        (Ok(expected), Some(actual)) => {
                            assert_eq!(expected.repr(), actual.repr(), "{:?} {l:?} {r:?}", op.key)
                        }
                        (Err(_), None) => {}
                        (expected, actual) => {
                            panic!("{:?} {l:?} {r:?}: {expected:?} vs {actual:?}", op.key)
                        }
                    }
                }
            }
        }
    }
}
