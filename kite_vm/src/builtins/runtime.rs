//! Helpers the compiler calls by reserved global names.
//!
//! Their names start with `#@`, which no identifier can spell, so source
//! code cannot shadow or call them directly.

use super::{CallContext, NativeFn, check_arity};
use crate::error::{RuntimeError, VmResult};
use crate::value::{Class, DictRef, Value};
use crate::vm::Vm;
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Name and entry point of every runtime helper.
pub const HELPERS: &[(&str, NativeFn)] = &[
    ("#@buildclass", build_class),
    ("#@locals", locals),
    ("#@exec", exec),
];

/// `#@buildclass(name, bases, namespace)`.
pub fn build_class(_vm: &mut Vm, _ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("#@buildclass", &args, 3, 3)?;
    let Value::Str(name) = &args[0] else {
        return Err(RuntimeError::internal("class name must be a string"));
    };
    let bases = match &args[1] {
        Value::Tuple(items) => items
            .iter()
            .map(|base| match base {
                Value::Class(class) => Ok(Rc::clone(class)),
                other => Err(RuntimeError::type_error(format!(
                    "Error when calling the metaclass bases: base must be a class, not '{}'",
                    other.type_name()
                ))),
            })
            .collect::<VmResult<Vec<_>>>()?,
        _ => return Err(RuntimeError::internal("class bases must be a tuple")),
    };
    let Value::Dict(namespace) = &args[2] else {
        return Err(RuntimeError::internal("class body must return its namespace"));
    };

    let mut attrs = FxHashMap::default();
    for (key, value) in namespace.borrow().items() {
        if let Value::Str(key) = key {
            attrs.insert(Arc::clone(key), value.clone());
        }
    }
    Ok(Value::Class(Class::new(Arc::clone(name), bases, attrs)))
}

/// `#@locals()`: the caller's name-based locals.
pub fn locals(_vm: &mut Vm, ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("#@locals", &args, 0, 0)?;
    Ok(Value::Dict(Rc::clone(ctx.locals_or_globals())))
}

fn namespace_arg(value: &Value, default: &DictRef, what: &str) -> VmResult<DictRef> {
    match value {
        Value::None => Ok(Rc::clone(default)),
        Value::Dict(dict) => Ok(Rc::clone(dict)),
        other => Err(RuntimeError::type_error(format!(
            "exec: arg 2 must be a dictionary or None, not '{}' ({what})",
            other.type_name()
        ))),
    }
}

/// `#@exec(code, globals, locals)`.
///
/// Only compiled code objects are accepted; there is no source compiler at
/// run time.
pub fn exec(vm: &mut Vm, ctx: &CallContext<'_>, args: Vec<Value>) -> VmResult<Value> {
    check_arity("exec", &args, 3, 3)?;
    let code = match &args[0] {
        Value::Code(code) => Arc::clone(code),
        Value::Str(_) => {
            return Err(RuntimeError::type_error(
                "exec of source text is not supported; pass a code object",
            ));
        }
        other => {
            return Err(RuntimeError::type_error(format!(
                "exec: arg 1 must be a code object, not '{}'",
                other.type_name()
            )));
        }
    };
    let globals = namespace_arg(&args[1], ctx.globals, "globals")?;
    let locals = match (&args[1], &args[2]) {
        (Value::None, Value::None) => Rc::clone(ctx.locals_or_globals()),
        (_, Value::None) => Rc::clone(&globals),
        (_, locals) => namespace_arg(locals, &globals, "locals")?,
    };
    vm.exec_code(code, globals, locals)?;
    Ok(Value::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::value::Dict;
    use kite_compiler::{CompilerConfig, compile_module};
    use kite_core::ast::{Expr, Module, Stmt};
    use std::cell::RefCell;

    fn code_value(body: Vec<Stmt>) -> Value {
        Value::Code(compile_module(&Module::new(body), &CompilerConfig::default()).unwrap())
    }

    #[test]
    fn test_build_class_from_namespace() {
        let mut vm = Vm::new(VmConfig::for_testing());
        let globals = vm.globals.clone();
        let ctx = CallContext::new(&globals, None);

        let mut namespace = Dict::new();
        namespace.set_str(Arc::from("x"), Value::Int(1));
        namespace.set(Value::Int(7), Value::None).unwrap();
        let base = vm.exception_class("ValueError").unwrap();
        let args = vec![
            Value::str("MyError"),
            Value::tuple(vec![Value::Class(Rc::clone(&base))]),
            Value::dict(namespace),
        ];
        let Value::Class(class) = build_class(&mut vm, &ctx, args).unwrap() else {
            panic!("expected a class");
        };
        assert_eq!(&*class.name, "MyError");
        assert!(class.exception);
        assert!(class.is_subclass_of(&base));
        assert_eq!(class.get_own("x").and_then(|v| v.as_int()), Some(1));
    }

    #[test]
    fn test_build_class_rejects_non_class_base() {
        let mut vm = Vm::new(VmConfig::for_testing());
        let globals = vm.globals.clone();
        let ctx = CallContext::new(&globals, None);
        let args = vec![
            Value::str("C"),
            Value::tuple(vec![Value::Int(1)]),
            Value::dict(Dict::new()),
        ];
        let err = build_class(&mut vm, &ctx, args).unwrap_err();
        assert!(err.message.contains("base must be a class, not 'int'"));
    }

    #[test]
    fn test_locals_prefers_frame_locals() {
        let mut vm = Vm::new(VmConfig::for_testing());
        let globals = vm.globals.clone();
        let frame_locals: DictRef = Rc::new(RefCell::new(Dict::new()));

        let ctx = CallContext::new(&globals, Some(&frame_locals));
        let Value::Dict(d) = locals(&mut vm, &ctx, vec![]).unwrap() else {
            panic!("expected a dict");
        };
        assert!(Rc::ptr_eq(&d, &frame_locals));

        let ctx = CallContext::new(&globals, None);
        let Value::Dict(d) = locals(&mut vm, &ctx, vec![]).unwrap() else {
            panic!("expected a dict");
        };
        assert!(Rc::ptr_eq(&d, &globals));
    }

    #[test]
    fn test_exec_namespaces() {
        let mut vm = Vm::new(VmConfig::for_testing());
        let globals = vm.globals.clone();
        let ctx = CallContext::new(&globals, None);
        let code = code_value(vec![Stmt::assign(Expr::name("y"), Expr::int(5))]);

        exec(&mut vm, &ctx, vec![code.clone(), Value::None, Value::None]).unwrap();
        assert_eq!(vm.global("y").and_then(|v| v.as_int()), Some(5));

        let target: DictRef = Rc::new(RefCell::new(Dict::new()));
        exec(&mut vm, &ctx, vec![code, Value::Dict(Rc::clone(&target)), Value::None]).unwrap();
        assert_eq!(
            target.borrow().get_str(&Arc::from("y")).and_then(|v| v.as_int()),
            Some(5)
        );
    }

    #[test]
    fn test_exec_rejects_source_text() {
        let mut vm = Vm::new(VmConfig::for_testing());
        let globals = vm.globals.clone();
        let ctx = CallContext::new(&globals, None);
        let err = exec(&mut vm, &ctx, vec![Value::str("x = 1"), Value::None, Value::None]).unwrap_err();
        assert_eq!(err.kind, crate::error::RuntimeErrorKind::TypeError);
    }
}
