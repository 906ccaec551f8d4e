//! Methods of builtin types.
//!
//! Each method receives its receiver as the first argument. The VM binds
//! them on attribute access and caches the builtin per `(type, name)`.

use super::functions::sort_values;
use super::{CallContext, NativeFn, check_arity, int_arg};
use crate::error::{RuntimeError, VmResult};
use crate::value::{TypeTag, Value};
use crate::vm::Vm;
use std::sync::Arc;

/// `(receiver type, name, function)`.
const METHODS: &[(TypeTag, &str, NativeFn)] = &[
    (TypeTag::List, "append", list_append),
    (TypeTag::List, "pop", list_pop),
    (TypeTag::List, "extend", list_extend),
    (TypeTag::List, "insert", list_insert),
    (TypeTag::List, "index", list_index),
    (TypeTag::List, "count", list_count),
    (TypeTag::List, "reverse", list_reverse),
    (TypeTag::List, "sort", list_sort),
    (TypeTag::Dict, "get", dict_get),
    (TypeTag::Dict, "keys", dict_keys),
    (TypeTag::Dict, "values", dict_values),
    (TypeTag::Dict, "items", dict_items),
    (TypeTag::Dict, "pop", dict_pop),
    (TypeTag::Dict, "has_key", dict_has_key),
    (TypeTag::Dict, "update", dict_update),
    (TypeTag::Str, "join", str_join),
    (TypeTag::Str, "upper", str_upper),
    (TypeTag::Str, "lower", str_lower),
    (TypeTag::Str, "strip", str_strip),
    (TypeTag::Str, "split", str_split),
    (TypeTag::Str, "startswith", str_startswith),
    (TypeTag::Str, "endswith", str_endswith),
    (TypeTag::Str, "replace", str_replace),
    (TypeTag::Str, "find", str_find),
    (TypeTag::Generator, "next", generator_next),
    (TypeTag::Iterator, "next", generator_next),
];

/// Method `name` of builtin type `tag`.
pub fn lookup(tag: TypeTag, name: &str) -> Option<(&'static str, NativeFn)> {
    METHODS
        .iter()
        .find(|(t, n, _)| *t == tag && *n == name)
        .map(|&(_, n, f)| (n, f))
}

fn receiver_error(method: &str, expected: &str, got: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "descriptor '{method}' requires a '{expected}' object but received a '{}'",
        got.type_name()
    ))
}

macro_rules! receiver {
    ($args:expr, $method:literal, $variant:ident, $expected:literal) => {
        match $args.first() {
            Some(Value::$variant(inner)) => inner.clone(),
            Some(other) => return Err(receiver_error($method, $expected, other)),
            None => return Err(receiver_error($method, $expected, &Value::None)),
        }
    };
}

// =============================================================================
// list
// =============================================================================

fn list_append(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("append", &args, 2, 2)?;
    let list = receiver!(args, "append", List, "list");
    list.borrow_mut().push(args[1].clone());
    Ok(Value::None)
}

fn list_pop(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("pop", &args, 1, 2)?;
    let list = receiver!(args, "pop", List, "list");
    let mut list = list.borrow_mut();
    if list.is_empty() {
        return Err(RuntimeError::index_error("pop from empty list"));
    }
    let len = list.len() as i64;
    let index = match args.get(1) {
        Some(i) => int_arg("pop", i)?,
        None => len - 1,
    };
    let index = if index < 0 { index + len } else { index };
    if !(0..len).contains(&index) {
        return Err(RuntimeError::index_error("pop index out of range"));
    }
    Ok(list.remove(index as usize))
}

fn list_extend(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("extend", &args, 2, 2)?;
    let list = receiver!(args, "extend", List, "list");
    let items = vm.collect_iterable(&args[1])?;
    list.borrow_mut().extend(items);
    Ok(Value::None)
}

fn list_insert(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("insert", &args, 3, 3)?;
    let list = receiver!(args, "insert", List, "list");
    let mut list = list.borrow_mut();
    let len = list.len() as i64;
    let index = int_arg("insert", &args[1])?;
    let index = if index < 0 { (index + len).max(0) } else { index.min(len) };
    list.insert(index as usize, args[2].clone());
    Ok(Value::None)
}

fn list_index(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("index", &args, 2, 2)?;
    let list = receiver!(args, "index", List, "list");
    let position = list.borrow().iter().position(|v| v.py_eq(&args[1]));
    position
        .map(|i| Value::Int(i as i64))
        .ok_or_else(|| RuntimeError::value_error(format!("{} is not in list", args[1].repr())))
}

fn list_count(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("count", &args, 2, 2)?;
    let list = receiver!(args, "count", List, "list");
    let count = list.borrow().iter().filter(|v| v.py_eq(&args[1])).count();
    Ok(Value::Int(count as i64))
}

fn list_reverse(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("reverse", &args, 1, 1)?;
    let list = receiver!(args, "reverse", List, "list");
    list.borrow_mut().reverse();
    Ok(Value::None)
}

fn list_sort(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("sort", &args, 1, 1)?;
    let list = receiver!(args, "sort", List, "list");
    let mut items = std::mem::take(&mut *list.borrow_mut());
    let result = sort_values(&mut items);
    *list.borrow_mut() = items;
    result.map(|()| Value::None)
}

// =============================================================================
// dict
// =============================================================================

fn dict_get(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("get", &args, 2, 3)?;
    let dict = receiver!(args, "get", Dict, "dict");
    let found = dict.borrow().get(&args[1])?;
    Ok(found.or_else(|| args.get(2).cloned()).unwrap_or(Value::None))
}

fn dict_keys(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("keys", &args, 1, 1)?;
    let dict = receiver!(args, "keys", Dict, "dict");
    let keys = dict.borrow().keys().cloned().collect();
    Ok(Value::list(keys))
}

fn dict_values(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("values", &args, 1, 1)?;
    let dict = receiver!(args, "values", Dict, "dict");
    let values = dict.borrow().items().map(|(_, v)| v.clone()).collect();
    Ok(Value::list(values))
}

fn dict_items(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("items", &args, 1, 1)?;
    let dict = receiver!(args, "items", Dict, "dict");
    let items = dict
        .borrow()
        .items()
        .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
        .collect();
    Ok(Value::list(items))
}

fn dict_pop(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("pop", &args, 2, 3)?;
    let dict = receiver!(args, "pop", Dict, "dict");
    let removed = dict.borrow_mut().remove(&args[1])?;
    match (removed, args.get(2)) {
        (Some(v), _) => Ok(v),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(RuntimeError::key_error(args[1].repr())),
    }
}

fn dict_has_key(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("has_key", &args, 2, 2)?;
    let dict = receiver!(args, "has_key", Dict, "dict");
    let found = dict.borrow().contains(&args[1])?;
    Ok(Value::Bool(found))
}

fn dict_update(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("update", &args, 2, 2)?;
    let dict = receiver!(args, "update", Dict, "dict");
    let Value::Dict(source) = &args[1] else {
        return Err(RuntimeError::type_error(format!(
            "update() argument must be a dict, not {}",
            args[1].type_name()
        )));
    };
    let entries: Vec<(Value, Value)> = source
        .borrow()
        .items()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut dict = dict.borrow_mut();
    for (k, v) in entries {
        dict.set(k, v)?;
    }
    Ok(Value::None)
}

// =============================================================================
// str
// =============================================================================

fn str_arg<'a>(method: &str, value: &'a Value) -> VmResult<&'a str> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(RuntimeError::type_error(format!(
            "{method}() argument must be str, not {}",
            other.type_name()
        ))),
    }
}

fn str_join(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("join", &args, 2, 2)?;
    let sep = receiver!(args, "join", Str, "str");
    let parts = vm
        .collect_iterable(&args[1])?
        .iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(RuntimeError::type_error(format!(
                "sequence item {i}: expected string, {} found",
                other.type_name()
            ))),
        })
        .collect::<VmResult<Vec<_>>>()?;
    Ok(Value::Str(Arc::from(parts.join(&sep))))
}

fn str_upper(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("upper", &args, 1, 1)?;
    let s = receiver!(args, "upper", Str, "str");
    Ok(Value::Str(Arc::from(s.to_uppercase())))
}

fn str_lower(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("lower", &args, 1, 1)?;
    let s = receiver!(args, "lower", Str, "str");
    Ok(Value::Str(Arc::from(s.to_lowercase())))
}

fn str_strip(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("strip", &args, 1, 2)?;
    let s = receiver!(args, "strip", Str, "str");
    let stripped = match args.get(1) {
        None | Some(Value::None) => s.trim(),
        Some(chars) => {
            let chars = str_arg("strip", chars)?;
            s.trim_matches(|c| chars.contains(c))
        }
    };
    Ok(Value::str(stripped))
}

fn str_split(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("split", &args, 1, 2)?;
    let s = receiver!(args, "split", Str, "str");
    let parts: Vec<Value> = match args.get(1) {
        None | Some(Value::None) => s.split_whitespace().map(Value::str).collect(),
        Some(sep) => {
            let sep = str_arg("split", sep)?;
            if sep.is_empty() {
                return Err(RuntimeError::value_error("empty separator"));
            }
            s.split(sep).map(Value::str).collect()
        }
    };
    Ok(Value::list(parts))
}

fn str_startswith(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("startswith", &args, 2, 2)?;
    let s = receiver!(args, "startswith", Str, "str");
    Ok(Value::Bool(s.starts_with(str_arg("startswith", &args[1])?)))
}

fn str_endswith(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("endswith", &args, 2, 2)?;
    let s = receiver!(args, "endswith", Str, "str");
    Ok(Value::Bool(s.ends_with(str_arg("endswith", &args[1])?)))
}

fn str_replace(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("replace", &args, 3, 3)?;
    let s = receiver!(args, "replace", Str, "str");
    let from = str_arg("replace", &args[1])?;
    let to = str_arg("replace", &args[2])?;
    Ok(Value::Str(Arc::from(s.replace(from, to))))
}

fn str_find(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("find", &args, 2, 2)?;
    let s = receiver!(args, "find", Str, "str");
    let needle = str_arg("find", &args[1])?;
    let index = s
        .find(needle)
        .map_or(-1, |byte| s[..byte].chars().count() as i64);
    Ok(Value::Int(index))
}

// =============================================================================
// generator
// =============================================================================

fn generator_next(vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("next", &args, 1, 1)?;
    vm.next_item(&args[0])?
        .ok_or_else(RuntimeError::stop_iteration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;

    fn call(tag: TypeTag, name: &str, args: Vec<Value>) -> VmResult<Value> {
        let mut vm = Vm::new(VmConfig::for_testing());
        let globals = vm.globals.clone();
        let ctx = CallContext::new(&globals, None);
        let (_, func) = lookup(tag, name).expect("method exists");
        func(&mut vm, &ctx, args)
    }

    #[test]
    fn test_list_methods() {
        let list = Value::list(vec![Value::Int(3), Value::Int(1)]);
        call(TypeTag::List, "append", vec![list.clone(), Value::Int(2)]).unwrap();
        call(TypeTag::List, "sort", vec![list.clone()]).unwrap();
        assert_eq!(list.repr(), "[1, 2, 3]");
        let popped = call(TypeTag::List, "pop", vec![list.clone(), Value::Int(0)]).unwrap();
        assert_eq!(popped.as_int(), Some(1));
        call(TypeTag::List, "insert", vec![list.clone(), Value::Int(-1), Value::Int(9)]).unwrap();
        assert_eq!(list.repr(), "[2, 9, 3]");
        let err = call(TypeTag::List, "index", vec![list, Value::Int(7)]).unwrap_err();
        assert_eq!(&*err.message, "7 is not in list");
    }

    #[test]
    fn test_dict_methods() {
        let d = Value::dict(crate::value::Dict::new());
        if let Value::Dict(inner) = &d {
            inner.borrow_mut().set(Value::str("a"), Value::Int(1)).unwrap();
        }
        let got = call(TypeTag::Dict, "get", vec![d.clone(), Value::str("b"), Value::Int(0)]).unwrap();
        assert_eq!(got.as_int(), Some(0));
        let items = call(TypeTag::Dict, "items", vec![d.clone()]).unwrap();
        assert_eq!(items.repr(), "[('a', 1)]");
        assert!(call(TypeTag::Dict, "pop", vec![d, Value::str("z")]).is_err());
    }

    #[test]
    fn test_str_methods() {
        let s = Value::str("  a,b  ");
        let stripped = call(TypeTag::Str, "strip", vec![s]).unwrap();
        assert_eq!(stripped.to_str(), "a,b");
        let parts = call(TypeTag::Str, "split", vec![stripped, Value::str(",")]).unwrap();
        assert_eq!(parts.repr(), "['a', 'b']");
        let joined = call(TypeTag::Str, "join", vec![Value::str("-"), parts]).unwrap();
        assert_eq!(joined.to_str(), "a-b");
        let idx = call(TypeTag::Str, "find", vec![Value::str("héllo"), Value::str("l")]).unwrap();
        assert_eq!(idx.as_int(), Some(2));
        let err = call(TypeTag::Str, "join", vec![Value::str(""), Value::list(vec![Value::Int(1)])]).unwrap_err();
        assert_eq!(&*err.message, "sequence item 0: expected string, int found");
    }

    #[test]
    fn test_unknown_method() {
        assert!(lookup(TypeTag::Int, "append").is_none());
        assert!(lookup(TypeTag::List, "upper").is_none());
    }
}
