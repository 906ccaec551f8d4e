//! Attribute access handlers.
//!
//! Storing to or deleting from a class notifies the invalidation registry
//! before the class changes, so no specialized attribute load can observe a
//! stale value.

use crate::error::{RuntimeError, VmResult};
use crate::frame::Frame;
use crate::invalidation::InvalidationReason;
use crate::ops::ControlFlow;
use crate::value::{BoundMethod, Value};
use crate::vm::Vm;
use std::rc::Rc;
use std::sync::Arc;

// =============================================================================
// Attribute Protocol
// =============================================================================

/// Bind `attr` to `receiver` when it is a user function.
#[inline]
pub fn bind(receiver: &Value, attr: Value) -> Value {
    match attr {
        Value::Function(_) => Value::BoundMethod(Rc::new(BoundMethod {
            receiver: receiver.clone(),
            function: attr,
        })),
        other => other,
    }
}

/// `obj.name`.
pub fn get_attr(vm: &mut Vm, obj: &Value, name: &Arc<str>) -> VmResult<Value> {
    match obj {
        Value::Instance(inst) => {
            if let Some(v) = inst.attrs.borrow().get(name) {
                return Ok(v.clone());
            }
            if &**name == "__class__" {
                return Ok(Value::Class(Rc::clone(&inst.class)));
            }
            inst.class
                .lookup(name)
                .map(|attr| bind(obj, attr))
                .ok_or_else(|| RuntimeError::attribute_error(&inst.class.name, name))
        }
        Value::Class(class) => {
            if &**name == "__name__" {
                return Ok(Value::Str(Arc::clone(&class.name)));
            }
            class.lookup(name).ok_or_else(|| {
                RuntimeError::new(
                    crate::error::RuntimeErrorKind::AttributeError,
                    format!("class {} has no attribute '{name}'", class.name),
                )
            })
        }
        Value::Function(f) if &**name == "__name__" => Ok(Value::Str(Arc::clone(&f.name))),
        other => vm
            .builtin_method(other, name)
            .ok_or_else(|| RuntimeError::attribute_error(&other.type_name(), name)),
    }
}

/// `obj.name = value`.
pub fn set_attr(vm: &mut Vm, obj: &Value, name: Arc<str>, value: Value) -> VmResult<()> {
    match obj {
        Value::Instance(inst) => {
            inst.attrs.borrow_mut().insert(name, value);
            Ok(())
        }
        Value::Class(class) => {
            vm.registry
                .on_object_mutated(class.id, InvalidationReason::AttributeStored);
            class.store(name, value);
            Ok(())
        }
        other => Err(RuntimeError::attribute_error(&other.type_name(), &name)),
    }
}

/// `del obj.name`.
pub fn del_attr(vm: &mut Vm, obj: &Value, name: &Arc<str>) -> VmResult<()> {
    let removed = match obj {
        Value::Instance(inst) => inst.attrs.borrow_mut().remove(name).is_some(),
        Value::Class(class) => {
            if class.get_own(name).is_some() {
                vm.registry
                    .on_object_mutated(class.id, InvalidationReason::AttributeDeleted);
            }
            class.remove(name).is_some()
        }
        _ => false,
    };
    if removed {
        Ok(())
    } else {
        Err(RuntimeError::attribute_error(&obj.type_name(), name))
    }
}

// =============================================================================
// Handlers
// =============================================================================

pub fn load_attr(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let name = frame.name(arg)?;
    let obj = frame.pop()?;
    if let Value::Instance(inst) = &obj {
        vm.observe_attr(frame, &inst.class);
    }
    frame.push(get_attr(vm, &obj, &name)?);
    Ok(ControlFlow::Continue)
}

/// TOS is the object, TOS1 the value.
pub fn store_attr(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let name = frame.name(arg)?;
    let obj = frame.pop()?;
    let value = frame.pop()?;
    set_attr(vm, &obj, name, value)?;
    Ok(ControlFlow::Continue)
}

pub fn delete_attr(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let name = frame.name(arg)?;
    let obj = frame.pop()?;
    del_attr(vm, &obj, &name)?;
    Ok(ControlFlow::Continue)
}

/// [obj] → [function, obj] for a class-level method of an instance,
/// otherwise [attr, NULL].
pub fn load_method(vm: &mut Vm, frame: &mut Frame, arg: u32) -> VmResult<ControlFlow> {
    let name = frame.name(arg)?;
    let obj = frame.pop()?;
    if let Value::Instance(inst) = &obj {
        vm.observe_attr(frame, &inst.class);
        if !inst.attrs.borrow().contains_key(&name)
            && let Some(function @ Value::Function(_)) = inst.class.lookup(&name)
        {
            frame.push(function);
            frame.push(obj);
            return Ok(ControlFlow::Continue);
        }
    }
    let attr = get_attr(vm, &obj, &name)?;
    frame.push(attr);
    frame.push(Value::Null);
    Ok(ControlFlow::Continue)
}
