//! Container construction, subscripting and iteration handlers.

use crate::error::{RuntimeError, VmResult};
use crate::frame::Frame;
use crate::ops::ControlFlow;
use crate::value::{Dict, IterState, SliceValue, Value};
use crate::vm::Vm;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

// =============================================================================
// Iteration
// =============================================================================

/// `iter(value)`.
pub fn make_iter(value: &Value) -> VmResult<Value> {
    let state = match value {
        Value::List(list) => IterState::List {
            list: Rc::clone(list),
            index: 0,
        },
        Value::Tuple(items) => IterState::Tuple {
            items: Rc::clone(items),
            index: 0,
        },
        Value::Str(text) => IterState::Str {
            text: Arc::clone(text),
            pos: 0,
        },
        Value::Dict(d) => IterState::Keys {
            keys: d.borrow().keys().cloned().collect(),
            index: 0,
        },
        Value::Iterator(_) | Value::Generator(_) => return Ok(value.clone()),
        other => return Err(RuntimeError::not_iterable(&other.type_name())),
    };
    Ok(Value::Iterator(Rc::new(RefCell::new(state))))
}

// =============================================================================
// Indexing
// =============================================================================

/// Resolve a possibly negative index against `len`.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

fn index_of(value: &Value, container: &str) -> VmResult<i64> {
    value.as_int().ok_or_else(|| {
        RuntimeError::type_error(format!(
            "{container} indices must be integers, not {}",
            value.type_name()
        ))
    })
}

fn slice_bound(value: &Value) -> VmResult<Option<i64>> {
    match value {
        Value::None => Ok(None),
        v => v
            .as_int()
            .map(Some)
            .ok_or_else(|| RuntimeError::type_error("slice indices must be integers or None")),
    }
}

/// Positions selected by `slice` on a sequence of length `len`.
pub fn slice_positions(slice: &SliceValue, len: usize) -> VmResult<Vec<usize>> {
    let step = slice_bound(&slice.step)?.unwrap_or(1);
    if step == 0 {
        return Err(RuntimeError::value_error("slice step cannot be zero"));
    }
    let len = len as i64;
    let clamp = |bound: Option<i64>, default: i64| -> i64 {
        match bound {
            None => default,
            Some(i) if i < 0 => {
                let i = i + len;
                if i < 0 { if step < 0 { -1 } else { 0 } } else { i }
            }
            Some(i) if i >= len => {
                if step < 0 { len - 1 } else { len }
            }
            Some(i) => i,
        }
    };
    let (start, stop) = if step > 0 {
        (clamp(slice_bound(&slice.start)?, 0), clamp(slice_bound(&slice.stop)?, len))
    } else {
        (
            clamp(slice_bound(&slice.start)?, len - 1),
            clamp(slice_bound(&slice.stop)?, -1),
        )
    };

    let mut positions = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        positions.push(i as usize);
        i += step;
    }
    Ok(positions)
}

/// `container[index]`.
pub fn subscript(container: &Value, index: &Value) -> VmResult<Value> {
    match (container, index) {
        (Value::List(list), Value::Slice(slice)) => {
            let list = list.borrow();
            let picked = slice_positions(slice, list.len())?;
            Ok(Value::list(picked.into_iter().map(|i| list[i].clone()).collect()))
        }
        (Value::Tuple(items), Value::Slice(slice)) => {
            let picked = slice_positions(slice, items.len())?;
            Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        (Value::Str(s), Value::Slice(slice)) => {
            let chars: Vec<char> = s.chars().collect();
            let picked = slice_positions(slice, chars.len())?;
            Ok(Value::Str(Arc::from(
                picked.into_iter().map(|i| chars[i]).collect::<String>(),
            )))
        }
        (Value::List(list), index) => {
            let list = list.borrow();
            normalize_index(index_of(index, "list")?, list.len())
                .map(|i| list[i].clone())
                .ok_or_else(|| RuntimeError::index_error("list index out of range"))
        }
        (Value::Tuple(items), index) => normalize_index(index_of(index, "tuple")?, items.len())
            .map(|i| items[i].clone())
            .ok_or_else(|| RuntimeError::index_error("tuple index out of range")),
        (Value::Str(s), index) => {
            let i = index_of(index, "string")?;
            let len = s.chars().count();
            normalize_index(i, len)
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::Str(Arc::from(c.to_string())))
                .ok_or_else(|| RuntimeError::index_error("string index out of range"))
        }
        (Value::Dict(d), key) => d
            .borrow()
            .get(key)?
            .ok_or_else(|| RuntimeError::key_error(key.repr())),
        (other, _) => Err(RuntimeError::type_error(format!(
            "'{}' object has no attribute '__getitem__'",
            other.type_name()
        ))),
    }
}

/// `container[index] = value`.
pub fn store_subscript(container: &Value, index: &Value, value: Value) -> VmResult<()> {
    match (container, index) {
        (Value::List(list), Value::Slice(slice)) => {
            let replacement = sequence_items(&value)?;
            let mut list = list.borrow_mut();
            let positions = slice_positions(slice, list.len())?;
            let contiguous = matches!(slice.step, Value::None)
                || slice.step.as_int() == Some(1);
            if contiguous {
                let start = match positions.first() {
                    Some(&first) => first,
                    None => {
                        let len = list.len() as i64;
                        let start = match slice_bound(&slice.start)? {
                            Some(s) if s < 0 => s + len,
                            Some(s) => s,
                            None => 0,
                        };
                        start.clamp(0, len) as usize
                    }
                };
                list.splice(start..start + positions.len(), replacement);
            } else {
                if positions.len() != replacement.len() {
                    return Err(RuntimeError::value_error(format!(
                        "attempt to assign sequence of size {} to extended slice of size {}",
                        replacement.len(),
                        positions.len()
                    )));
                }
                for (i, item) in positions.into_iter().zip(replacement) {
                    list[i] = item;
                }
            }
            Ok(())
        }
        (Value::List(list), index) => {
            let mut list = list.borrow_mut();
            let i = normalize_index(index_of(index, "list")?, list.len())
                .ok_or_else(|| RuntimeError::index_error("list assignment index out of range"))?;
            list[i] = value;
            Ok(())
        }
        (Value::Dict(d), key) => d.borrow_mut().set(key.clone(), value),
        (other, _) => Err(RuntimeError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// `del container[index]`.
pub fn delete_subscript(container: &Value, index: &Value) -> VmResult<()> {
    match (container, index) {
        (Value::List(list), Value::Slice(slice)) => {
            let mut list = list.borrow_mut();
            let mut positions = slice_positions(slice, list.len())?;
            positions.sort_unstable();
            for i in positions.into_iter().rev() {
                list.remove(i);
            }
            Ok(())
        }
        (Value::List(list), index) => {
            let mut list = list.borrow_mut();
            let i = normalize_index(index_of(index, "list")?, list.len())
                .ok_or_else(|| RuntimeError::index_error("list assignment index out of range"))?;
            list.remove(i);
            Ok(())
        }
        (Value::Dict(d), key) => match d.borrow_mut().remove(key)? {
            Some(_) => Ok(()),
            None => Err(RuntimeError::key_error(key.repr())),
        },
        (other, _) => Err(RuntimeError::type_error(format!(
            "'{}' object doesn't support item deletion",
            other.type_name()
        ))),
    }
}

/// Items of a list, tuple or string without running user code.
pub fn sequence_items(value: &Value) -> VmResult<Vec<Value>> {
    match value {
        Value::List(list) => Ok(list.borrow().clone()),
        Value::Tuple(items) => Ok(items.to_vec()),
        Value::Str(s) => Ok(s
            .chars()
            .map(|c| Value::Str(Arc::from(c.to_string())))
            .collect()),
        Value::Dict(d) => Ok(d.borrow().keys().cloned().collect()),
        other => Err(RuntimeError::type_error(format!(
            "can only assign an iterable, not '{}'",
            other.type_name()
        ))),
    }
}

// =============================================================================
// Handlers
// =============================================================================

pub fn get_iter(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let value = frame.pop()?;
    frame.push(make_iter(&value)?);
    Ok(ControlFlow::Continue)
}

pub fn binary_subscr(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let index = frame.pop()?;
    let container = frame.pop()?;
    frame.push(subscript(&container, &index)?);
    Ok(ControlFlow::Continue)
}

/// TOS is the index, TOS1 the container, TOS2 the value.
pub fn store_subscr(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let index = frame.pop()?;
    let container = frame.pop()?;
    let value = frame.pop()?;
    store_subscript(&container, &index, value)?;
    Ok(ControlFlow::Continue)
}

pub fn delete_subscr(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let index = frame.pop()?;
    let container = frame.pop()?;
    delete_subscript(&container, &index)?;
    Ok(ControlFlow::Continue)
}

/// [dict, value, key] → [dict]
pub fn store_map(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let key = frame.pop()?;
    let value = frame.pop()?;
    match frame.top()? {
        Value::Dict(d) => d.borrow_mut().set(key, value)?,
        other => {
            return Err(RuntimeError::internal(format!(
                "STORE_MAP on {}",
                other.type_name()
            )));
        }
    }
    Ok(ControlFlow::Continue)
}

/// [list, item] → []
pub fn list_append(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let item = frame.pop()?;
    match frame.pop()? {
        Value::List(list) => list.borrow_mut().push(item),
        other => {
            return Err(RuntimeError::internal(format!(
                "LIST_APPEND on {}",
                other.type_name()
            )));
        }
    }
    Ok(ControlFlow::Continue)
}

pub fn build_slice_two(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let stop = frame.pop()?;
    let start = frame.pop()?;
    frame.push(Value::Slice(Rc::new(SliceValue {
        start,
        stop,
        step: Value::None,
    })));
    Ok(ControlFlow::Continue)
}

pub fn build_slice_three(_vm: &mut Vm, frame: &mut Frame, _arg: u32) -> VmResult<ControlFlow> {
    let step = frame.pop()?;
    let stop = frame.pop()?;
    let start = frame.pop()?;
    frame.push(Value::Slice(Rc::new(SliceValue { start, stop, step })));
    Ok(ControlFlow::Continue)
}

pub fn build_tuple(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let items = frame.pop_n(arg as usize)?;
    frame.push(Value::tuple(items));
    Ok(ControlFlow::Continue)
}

pub fn build_list(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let items = frame.pop_n(arg as usize)?;
    frame.push(Value::list(items));
    Ok(ControlFlow::Continue)
}

pub fn build_map(_vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    frame.push(Value::dict(Dict::with_capacity(arg as usize)));
    Ok(ControlFlow::Continue)
}

/// Pushes the items last first, so the first item ends on top.
/// Items of `value` for an `expected`-way unpacking assignment.
pub fn unpack(vm: &mut Vm, value: &Value, expected: usize) -> VmResult<Vec<Value>> {
    let items = vm.collect_iterable(value)?;
    if items.len() < expected {
        let plural = if items.len() == 1 { "value" } else { "values" };
        return Err(RuntimeError::value_error(format!(
            "need more than {} {plural} to unpack",
            items.len()
        )));
    }
    if items.len() > expected {
        return Err(RuntimeError::value_error("too many values to unpack"));
    }
    Ok(items)
}

pub fn unpack_sequence(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let value = frame.pop()?;
    let items = unpack(vm, &value, arg as usize)?;
    frame.stack.extend(items.into_iter().rev());
    Ok(ControlFlow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeErrorKind;

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().copied().map(Value::Int).collect())
    }

    fn slice(start: Value, stop: Value, step: Value) -> Value {
        Value::Slice(Rc::new(SliceValue { start, stop, step }))
    }

    // -------------------------------------------------------------------------
    // Indexing
    // -------------------------------------------------------------------------

    #[test]
    fn test_negative_indices() {
        let list = ints(&[1, 2, 3]);
        assert_eq!(subscript(&list, &Value::Int(-1)).unwrap().as_int(), Some(3));
        let err = subscript(&list, &Value::Int(3)).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::IndexError);
        assert_eq!(subscript(&Value::str("héllo"), &Value::Int(1)).unwrap().to_str(), "é");
    }

    #[test]
    fn test_slices() {
        let list = ints(&[0, 1, 2, 3, 4, 5]);
        let s = slice(Value::Int(1), Value::Int(-1), Value::None);
        assert_eq!(subscript(&list, &s).unwrap().repr(), "[1, 2, 3, 4]");
        let s = slice(Value::None, Value::None, Value::Int(-2));
        assert_eq!(subscript(&list, &s).unwrap().repr(), "[5, 3, 1]");
        let s = slice(Value::Int(10), Value::Int(20), Value::None);
        assert_eq!(subscript(&list, &s).unwrap().repr(), "[]");
        let s = slice(Value::None, Value::None, Value::Int(0));
        assert!(subscript(&list, &s).is_err());
        let s = slice(Value::None, Value::None, Value::Int(-1));
        assert_eq!(subscript(&Value::str("abc"), &s).unwrap().to_str(), "cba");
    }

    #[test]
    fn test_slice_assignment() {
        let list = ints(&[0, 1, 2, 3]);
        let s = slice(Value::Int(1), Value::Int(3), Value::None);
        store_subscript(&list, &s, ints(&[7, 8, 9])).unwrap();
        assert_eq!(list.repr(), "[0, 7, 8, 9, 3]");

        let s = slice(Value::Int(2), Value::Int(2), Value::None);
        store_subscript(&list, &s, ints(&[5])).unwrap();
        assert_eq!(list.repr(), "[0, 7, 5, 8, 9, 3]");

        let s = slice(Value::None, Value::None, Value::Int(2));
        assert!(store_subscript(&list, &s, ints(&[1])).is_err());
    }

    #[test]
    fn test_dict_subscript() {
        let d = Value::dict(Dict::new());
        store_subscript(&d, &Value::str("k"), Value::Int(1)).unwrap();
        assert_eq!(subscript(&d, &Value::str("k")).unwrap().as_int(), Some(1));
        let err = subscript(&d, &Value::str("missing")).unwrap_err();
        assert_eq!(err.to_string(), "KeyError: 'missing'");
        delete_subscript(&d, &Value::str("k")).unwrap();
        assert!(delete_subscript(&d, &Value::str("k")).is_err());
    }

    #[test]
    fn test_tuple_is_immutable() {
        let t = Value::tuple(vec![Value::Int(1)]);
        let err = store_subscript(&t, &Value::Int(0), Value::None).unwrap_err();
        assert_eq!(&*err.message, "'tuple' object does not support item assignment");
    }

    #[test]
    fn test_delete_extended_slice() {
        let list = ints(&[0, 1, 2, 3, 4]);
        let s = slice(Value::None, Value::None, Value::Int(2));
        delete_subscript(&list, &s).unwrap();
        assert_eq!(list.repr(), "[1, 3]");
    }

    // -------------------------------------------------------------------------
    // Iteration
    // -------------------------------------------------------------------------

    #[test]
    fn test_iterators() {
        let it = make_iter(&ints(&[1, 2])).unwrap();
        let Value::Iterator(state) = &it else {
            panic!("expected iterator");
        };
        assert_eq!(state.borrow_mut().next_item().and_then(|v| v.as_int()), Some(1));
        assert!(matches!(make_iter(&it).unwrap(), Value::Iterator(again) if Rc::ptr_eq(&again, state)));
        assert!(make_iter(&Value::Int(1)).is_err());
    }
}
