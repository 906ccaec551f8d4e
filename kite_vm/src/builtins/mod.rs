//! Builtin functions, methods of builtin types, and the exception classes.
//!
//! Every builtin shares the [`NativeFn`] signature. Builtins that run user
//! code (`sorted`, `getattr`, the runtime helpers) do so through the `Vm`
//! they are handed; the [`CallContext`] names the namespaces of the calling
//! frame for helpers such as `#@locals`.

pub mod exceptions;
pub mod functions;
pub mod methods;
pub mod runtime;

use crate::error::{RuntimeError, VmResult};
use crate::value::{Builtin, Class, Dict, DictRef, Value};
use crate::vm::Vm;
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Signature of every native function.
pub type NativeFn = fn(&mut Vm, &CallContext<'_>, Vec<Value>) -> VmResult<Value>;

/// Namespaces of the frame that made the call.
#[derive(Clone, Copy)]
pub struct CallContext<'a> {
    pub globals: &'a DictRef,
    pub locals: Option<&'a DictRef>,
}

impl<'a> CallContext<'a> {
    pub fn new(globals: &'a DictRef, locals: Option<&'a DictRef>) -> Self {
        Self { globals, locals }
    }

    /// Locals of the caller, or its globals at module level.
    #[inline]
    pub fn locals_or_globals(&self) -> &'a DictRef {
        self.locals.unwrap_or(self.globals)
    }
}

/// Populate `builtins` and return the exception classes by name.
pub fn install(builtins: &mut Dict) -> FxHashMap<Arc<str>, Rc<Class>> {
    for &(name, func) in functions::FUNCTIONS {
        builtins.set_str(Arc::from(name), Builtin::value(name, func));
    }
    for &(name, func) in runtime::HELPERS {
        builtins.set_str(Arc::from(name), Builtin::value(name, func));
    }
    let classes = exceptions::hierarchy();
    for (name, class) in &classes {
        builtins.set_str(Arc::clone(name), Value::Class(Rc::clone(class)));
    }
    builtins.set_str(
        Arc::from("object"),
        Value::Class(Class::new(Arc::from("object"), Vec::new(), FxHashMap::default())),
    );
    builtins.set_str(Arc::from("None"), Value::None);
    builtins.set_str(Arc::from("True"), Value::Bool(true));
    builtins.set_str(Arc::from("False"), Value::Bool(false));
    classes
}

// =============================================================================
// Argument Helpers
// =============================================================================

/// Require between `min` and `max` arguments.
pub(crate) fn check_arity(name: &str, args: &[Value], min: usize, max: usize) -> VmResult<()> {
    let given = args.len();
    if (min..=max).contains(&given) {
        return Ok(());
    }
    let message = if min == max {
        match min {
            0 => format!("{name}() takes no arguments ({given} given)"),
            1 => format!("{name}() takes exactly one argument ({given} given)"),
            n => format!("{name}() takes exactly {n} arguments ({given} given)"),
        }
    } else if given < min {
        format!("{name} expected at least {min} arguments, got {given}")
    } else {
        format!("{name} expected at most {max} arguments, got {given}")
    };
    Err(RuntimeError::type_error(message))
}

/// Integer argument.
pub(crate) fn int_arg(name: &str, value: &Value) -> VmResult<i64> {
    value.as_int().ok_or_else(|| {
        RuntimeError::type_error(format!(
            "{name}() integer argument expected, got {}",
            value.type_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_messages() {
        let args = vec![Value::None, Value::None];
        let err = check_arity("len", &args, 1, 1).unwrap_err();
        assert_eq!(&*err.message, "len() takes exactly one argument (2 given)");
        let err = check_arity("range", &[], 1, 3).unwrap_err();
        assert_eq!(&*err.message, "range expected at least 1 arguments, got 0");
        assert!(check_arity("range", &args, 1, 3).is_ok());
    }

    #[test]
    fn test_install_defines_core_names() {
        let mut builtins = Dict::new();
        let classes = install(&mut builtins);
        for name in ["len", "print", "range", "ValueError", "#@buildclass", "True"] {
            assert!(builtins.get_str(&Arc::from(name)).is_some(), "{name}");
        }
        let zde = &classes["ZeroDivisionError"];
        assert!(zde.is_subclass_of(&classes["ArithmeticError"]));
        assert!(zde.exception);
    }
}
