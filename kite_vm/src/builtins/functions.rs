//! Core builtin functions (len, range, print, min, max, sorted, etc.).

use super::{CallContext, NativeFn, check_arity, int_arg};
use crate::error::{RuntimeError, VmResult};
use crate::ops::arithmetic::binary_op;
use crate::ops::comparison::partial_order;
use crate::ops::containers::make_iter;
use crate::ops::objects::{get_attr, set_attr};
use crate::value::{Dict, TypeTag, Value, format_float};
use crate::vm::Vm;
use kite_core::ast::{BinOp, CmpOp};
use std::cmp::Ordering;
use std::sync::Arc;

/// Longest list `range` will build.
const MAX_RANGE_LEN: i64 = 1 << 24;

/// Name and entry point of every builtin function.
pub const FUNCTIONS: &[(&str, NativeFn)] = &[
    ("len", builtin_len),
    ("range", builtin_range),
    ("xrange", builtin_range),
    ("print", builtin_print),
    ("abs", builtin_abs),
    ("min", builtin_min),
    ("max", builtin_max),
    ("sum", builtin_sum),
    ("str", builtin_str),
    ("repr", builtin_repr),
    ("int", builtin_int),
    ("float", builtin_float),
    ("bool", builtin_bool),
    ("list", builtin_list),
    ("tuple", builtin_tuple),
    ("dict", builtin_dict),
    ("isinstance", builtin_isinstance),
    ("getattr", builtin_getattr),
    ("setattr", builtin_setattr),
    ("hasattr", builtin_hasattr),
    ("iter", builtin_iter),
    ("next", builtin_next),
    ("sorted", builtin_sorted),
    ("enumerate", builtin_enumerate),
    ("zip", builtin_zip),
];

// =============================================================================
// len
// =============================================================================

/// Builtin len function.
pub fn builtin_len(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("len", &args, 1, 1)?;
    let len = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::Tuple(items) => items.len(),
        Value::List(items) => items.borrow().len(),
        Value::Dict(d) => d.borrow().len(),
        other => {
            return Err(RuntimeError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )));
        }
    };
    Ok(Value::Int(len as i64))
}

// =============================================================================
// range
// =============================================================================

/// Builtin range function; returns a list.
pub fn builtin_range(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("range", &args, 1, 3)?;
    let ints = args
        .iter()
        .map(|a| int_arg("range", a))
        .collect::<VmResult<Vec<_>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(RuntimeError::internal("range arity")),
    };
    if step == 0 {
        return Err(RuntimeError::value_error(
            "range() step argument must not be zero",
        ));
    }
    let span = if step > 0 {
        (i128::from(stop) - i128::from(start) + i128::from(step) - 1) / i128::from(step)
    } else {
        (i128::from(start) - i128::from(stop) - i128::from(step) - 1) / -i128::from(step)
    };
    if span > i128::from(MAX_RANGE_LEN) {
        return Err(RuntimeError::value_error("range() result has too many items"));
    }
    let len = span.max(0) as i64;
    Ok(Value::list(
        (0..len).map(|i| Value::Int(start + i * step)).collect(),
    ))
}

// =============================================================================
// print
// =============================================================================

/// Builtin print function; writes to the VM's output buffer.
pub fn builtin_print(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    let line = args
        .iter()
        .map(Value::to_str)
        .collect::<Vec<_>>()
        .join(" ");
    vm.write_output(&line);
    vm.write_output("\n");
    Ok(Value::None)
}

// =============================================================================
// Numeric
// =============================================================================

/// Builtin abs function.
pub fn builtin_abs(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("abs", &args, 1, 1)?;
    match &args[0] {
        Value::Float(x) => Ok(Value::Float(x.abs())),
        v => match v.as_int() {
            Some(i) => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| RuntimeError::value_error("integer overflow")),
            None => Err(RuntimeError::type_error(format!(
                "bad operand type for abs(): '{}'",
                v.type_name()
            ))),
        },
    }
}

fn extremum(vm: &mut Vm, name: &str, args: Vec<Value>, keep: Ordering) -> VmResult<Value> {
    if args.is_empty() {
        return Err(RuntimeError::type_error(format!(
            "{name} expected 1 arguments, got 0"
        )));
    }
    let items = if args.len() == 1 {
        vm.collect_iterable(&args[0])?
    } else {
        args
    };
    let mut items = items.into_iter();
    let mut best = items
        .next()
        .ok_or_else(|| RuntimeError::value_error(format!("{name}() arg is an empty sequence")))?;
    for item in items {
        if partial_order(&item, &best, CmpOp::Lt)? == Some(keep) {
            best = item;
        }
    }
    Ok(best)
}

/// Builtin min function.
pub fn builtin_min(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    extremum(vm, "min", args, Ordering::Less)
}

/// Builtin max function.
pub fn builtin_max(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    extremum(vm, "max", args, Ordering::Greater)
}

/// Builtin sum function.
pub fn builtin_sum(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("sum", &args, 1, 2)?;
    let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
    if matches!(total, Value::Str(_)) {
        return Err(RuntimeError::type_error(
            "sum() can't sum strings [use ''.join(seq) instead]",
        ));
    }
    for item in vm.collect_iterable(&args[0])? {
        total = binary_op(BinOp::Add, &total, &item)?;
    }
    Ok(total)
}

// =============================================================================
// Conversions
// =============================================================================

/// Builtin str function.
pub fn builtin_str(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("str", &args, 0, 1)?;
    Ok(Value::Str(Arc::from(
        args.first().map(Value::to_str).unwrap_or_default(),
    )))
}

/// Builtin repr function.
pub fn builtin_repr(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("repr", &args, 1, 1)?;
    Ok(Value::Str(Arc::from(args[0].repr())))
}

/// Builtin int function.
pub fn builtin_int(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("int", &args, 0, 1)?;
    let Some(value) = args.first() else {
        return Ok(Value::Int(0));
    };
    match value {
        Value::Float(x) => {
            if !x.is_finite() {
                return Err(RuntimeError::value_error(format!(
                    "cannot convert float {} to integer",
                    format_float(*x)
                )));
            }
            let t = x.trunc();
            if t < i64::MIN as f64 || t >= i64::MAX as f64 {
                return Err(RuntimeError::value_error("integer overflow"));
            }
            Ok(Value::Int(t as i64))
        }
        Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
            RuntimeError::value_error(format!(
                "invalid literal for int() with base 10: {}",
                value.repr()
            ))
        }),
        v => v.as_int().map(Value::Int).ok_or_else(|| {
            RuntimeError::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                v.type_name()
            ))
        }),
    }
}

/// Builtin float function.
pub fn builtin_float(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("float", &args, 0, 1)?;
    let Some(value) = args.first() else {
        return Ok(Value::Float(0.0));
    };
    match value {
        Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
            RuntimeError::value_error(format!("could not convert string to float: {s}"))
        }),
        v => v.as_f64_exact().map(Value::Float).ok_or_else(|| {
            RuntimeError::type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                v.type_name()
            ))
        }),
    }
}

/// Builtin bool function.
pub fn builtin_bool(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("bool", &args, 0, 1)?;
    Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
}

/// Builtin list function.
pub fn builtin_list(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("list", &args, 0, 1)?;
    match args.first() {
        Some(iterable) => Ok(Value::list(vm.collect_iterable(iterable)?)),
        None => Ok(Value::list(Vec::new())),
    }
}

/// Builtin tuple function.
pub fn builtin_tuple(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("tuple", &args, 0, 1)?;
    match args.first() {
        Some(Value::Tuple(items)) => Ok(Value::Tuple(items.clone())),
        Some(iterable) => Ok(Value::tuple(vm.collect_iterable(iterable)?)),
        None => Ok(Value::tuple(Vec::new())),
    }
}

/// Builtin dict function: a copy of a dict, or built from key/value pairs.
pub fn builtin_dict(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("dict", &args, 0, 1)?;
    let mut dict = Dict::new();
    match args.first() {
        None => {}
        Some(Value::Dict(source)) => {
            for (k, v) in source.borrow().items() {
                dict.set(k.clone(), v.clone())?;
            }
        }
        Some(iterable) => {
            for (i, pair) in vm.collect_iterable(iterable)?.into_iter().enumerate() {
                let items = vm.collect_iterable(&pair)?;
                let [key, value]: [Value; 2] = items.try_into().map_err(|items: Vec<Value>| {
                    RuntimeError::value_error(format!(
                        "dictionary update sequence element #{i} has length {}; 2 is required",
                        items.len()
                    ))
                })?;
                dict.set(key, value)?;
            }
        }
    }
    Ok(Value::dict(dict))
}

// =============================================================================
// Introspection
// =============================================================================

/// Type tag a builtin conversion function stands for in `isinstance`.
fn builtin_type_tag(name: &str) -> Option<TypeTag> {
    Some(match name {
        "int" => TypeTag::Int,
        "float" => TypeTag::Float,
        "str" => TypeTag::Str,
        "bool" => TypeTag::Bool,
        "list" => TypeTag::List,
        "tuple" => TypeTag::Tuple,
        "dict" => TypeTag::Dict,
        _ => return None,
    })
}

fn is_instance(obj: &Value, class: &Value) -> VmResult<bool> {
    match class {
        Value::Class(class) => Ok(matches!(obj, Value::Instance(inst) if inst.class.is_subclass_of(class))),
        Value::Builtin(b) => match builtin_type_tag(b.name) {
            Some(TypeTag::Int) => Ok(matches!(obj, Value::Int(_) | Value::Bool(_))),
            Some(tag) => Ok(obj.type_tag() == tag),
            None => Err(isinstance_error()),
        },
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if is_instance(obj, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(isinstance_error()),
    }
}

fn isinstance_error() -> RuntimeError {
    RuntimeError::type_error("isinstance() arg 2 must be a class, type, or tuple of classes and types")
}

/// Builtin isinstance function.
pub fn builtin_isinstance(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("isinstance", &args, 2, 2)?;
    Ok(Value::Bool(is_instance(&args[0], &args[1])?))
}

fn attr_name(func: &str, value: &Value) -> VmResult<Arc<str>> {
    match value {
        Value::Str(s) => Ok(Arc::clone(s)),
        _ => Err(RuntimeError::type_error(format!(
            "{func}(): attribute name must be string"
        ))),
    }
}

/// Builtin getattr function.
pub fn builtin_getattr(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("getattr", &args, 2, 3)?;
    let name = attr_name("getattr", &args[1])?;
    match (get_attr(vm, &args[0], &name), args.get(2)) {
        (Err(err), Some(default)) if err.kind == crate::error::RuntimeErrorKind::AttributeError => {
            Ok(default.clone())
        }
        (result, _) => result,
    }
}

/// Builtin setattr function.
pub fn builtin_setattr(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("setattr", &args, 3, 3)?;
    let name = attr_name("setattr", &args[1])?;
    set_attr(vm, &args[0], name, args[2].clone())?;
    Ok(Value::None)
}

/// Builtin hasattr function.
pub fn builtin_hasattr(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("hasattr", &args, 2, 2)?;
    let name = attr_name("hasattr", &args[1])?;
    Ok(Value::Bool(get_attr(vm, &args[0], &name).is_ok()))
}

// =============================================================================
// Iteration
// =============================================================================

/// Builtin iter function.
pub fn builtin_iter(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("iter", &args, 1, 1)?;
    make_iter(&args[0])
}

/// Builtin next function.
pub fn builtin_next(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("next", &args, 1, 2)?;
    if !matches!(args[0], Value::Iterator(_) | Value::Generator(_)) {
        return Err(RuntimeError::type_error(format!(
            "{} object is not an iterator",
            args[0].type_name()
        )));
    }
    match (vm.next_item(&args[0])?, args.get(1)) {
        (Some(item), _) => Ok(item),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(RuntimeError::stop_iteration()),
    }
}

/// Builtin sorted function (stable, ascending; `reverse` is positional).
pub fn builtin_sorted(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("sorted", &args, 1, 2)?;
    let mut items = vm.collect_iterable(&args[0])?;
    sort_values(&mut items)?;
    if args.get(1).is_some_and(Value::truthy) {
        items.reverse();
    }
    Ok(Value::list(items))
}

/// Stable sort; the first comparison error wins.
pub(crate) fn sort_values(items: &mut [Value]) -> VmResult<()> {
    let mut error = None;
    items.sort_by(|a, b| match partial_order(a, b, CmpOp::Lt) {
        Ok(order) => order.unwrap_or(Ordering::Equal),
        Err(err) => {
            error.get_or_insert(err);
            Ordering::Equal
        }
    });
    error.map_or(Ok(()), Err)
}

/// Builtin enumerate function; returns a list of pairs.
pub fn builtin_enumerate(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("enumerate", &args, 1, 2)?;
    let start = match args.get(1) {
        Some(v) => int_arg("enumerate", v)?,
        None => 0,
    };
    let items = vm.collect_iterable(&args[0])?;
    Ok(Value::list(
        items
            .into_iter()
            .zip(start..)
            .map(|(item, i)| Value::tuple(vec![Value::Int(i), item]))
            .collect(),
    ))
}

/// Builtin zip function; returns a list of tuples.
pub fn builtin_zip(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    let columns = args
        .iter()
        .map(|a| vm.collect_iterable(a))
        .collect::<VmResult<Vec<_>>>()?;
    let len = columns.iter().map(Vec::len).min().unwrap_or(0);
    Ok(Value::list(
        (0..len)
            .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
            .collect(),
    ))
}
