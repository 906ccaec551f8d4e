//! Builtin exception classes.
//!
//! ```text
//! BaseException
//! └── Exception
//!     ├── ArithmeticError ── ZeroDivisionError
//!     ├── LookupError ──┬── IndexError
//!     │                 └── KeyError
//!     ├── TypeError, NameError, AttributeError, ValueError
//!     ├── StopIteration, AssertionError
//!     └── RuntimeError, SystemError
//! ```

use crate::value::{Class, Instance, Value};
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

/// `(name, parent)` in definition order; parents precede children.
const HIERARCHY: &[(&str, &str)] = &[
    ("Exception", "BaseException"),
    ("ArithmeticError", "Exception"),
    ("ZeroDivisionError", "ArithmeticError"),
    ("LookupError", "Exception"),
    ("IndexError", "LookupError"),
    ("KeyError", "LookupError"),
    ("TypeError", "Exception"),
    ("NameError", "Exception"),
    ("AttributeError", "Exception"),
    ("ValueError", "Exception"),
    ("StopIteration", "Exception"),
    ("AssertionError", "Exception"),
    ("RuntimeError", "Exception"),
    ("SystemError", "Exception"),
];

/// Build the builtin exception classes.
pub fn hierarchy() -> FxHashMap<Arc<str>, Rc<Class>> {
    let mut classes: FxHashMap<Arc<str>, Rc<Class>> = FxHashMap::default();
    classes.insert(
        Arc::from("BaseException"),
        Class::exception_root("BaseException"),
    );
    for &(name, parent) in HIERARCHY {
        let bases = classes.get(parent).map(Rc::clone).into_iter().collect();
        classes.insert(
            Arc::from(name),
            Class::new(Arc::from(name), bases, FxHashMap::default()),
        );
    }
    classes
}

/// Instance of an exception class with `args` and `message` set.
pub fn new_exception(class: Rc<Class>, args: Vec<Value>) -> Rc<Instance> {
    let instance = Instance::new(class);
    let message = match args.as_slice() {
        [only] => only.clone(),
        _ => Value::str(""),
    };
    {
        let mut attrs = instance.attrs.borrow_mut();
        attrs.insert(Arc::from("args"), Value::tuple(args));
        attrs.insert(Arc::from("message"), message);
    }
    instance
}
