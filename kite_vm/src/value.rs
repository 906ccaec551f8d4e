//! Runtime values and the minimal object model.
//!
//! Values are cheap to clone: scalars are inline, everything else is behind
//! an `Rc`. Mutable containers use `RefCell`; the interpreter is
//! single-threaded per `Vm`.
//!
//! Classes, functions and builtins carry an [`ObjectId`] so feedback can name
//! them and the invalidation registry can watch them.

use crate::builtins::NativeFn;
use crate::error::{RuntimeError, VmResult};
use crate::frame::Frame;
use kite_compiler::{CompiledCode, Constant};
use rustc_hash::FxHashMap;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared mutable list storage.
pub type ListRef = Rc<RefCell<Vec<Value>>>;
/// Shared mutable dict storage; also used for namespaces.
pub type DictRef = Rc<RefCell<Dict>>;
/// A closure cell; `None` while unbound.
pub type CellRef = Rc<RefCell<Option<Value>>>;

// =============================================================================
// Identity and Type Tags
// =============================================================================

/// Process-unique identity of a watchable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Allocate a fresh id.
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ObjectId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Coarse runtime type, used as the type key of feedback and guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    None,
    Bool,
    Int,
    Float,
    Str,
    Tuple,
    List,
    Dict,
    Slice,
    Function,
    Builtin,
    Class,
    Instance,
    BoundMethod,
    Code,
    Cell,
    Iterator,
    Generator,
    /// Interpreter-internal stack markers.
    Internal,
}

impl TypeTag {
    /// Type name as reported in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            TypeTag::None => "NoneType",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Str => "str",
            TypeTag::Tuple => "tuple",
            TypeTag::List => "list",
            TypeTag::Dict => "dict",
            TypeTag::Slice => "slice",
            TypeTag::Function => "function",
            TypeTag::Builtin => "builtin_function_or_method",
            TypeTag::Class => "classobj",
            TypeTag::Instance => "instance",
            TypeTag::BoundMethod => "instancemethod",
            TypeTag::Code => "code",
            TypeTag::Cell => "cell",
            TypeTag::Iterator => "iterator",
            TypeTag::Generator => "generator",
            TypeTag::Internal => "internal",
        }
    }

    /// Whether the tag is numeric (`bool` counts, as in arithmetic).
    #[inline]
    pub const fn is_numeric(self) -> bool {
        matches!(self, TypeTag::Bool | TypeTag::Int | TypeTag::Float)
    }
}

// =============================================================================
// Value
// =============================================================================

/// Pending non-exception unwind parked in a `finally` block's top slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// `return`; the value sits in the slot below.
    Return,
    /// `break`.
    Break,
    /// `continue`; the target offset sits in the slot below.
    Continue,
}

/// A runtime value.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Rc<[Value]>),
    List(ListRef),
    Dict(DictRef),
    Slice(Rc<SliceValue>),
    Function(Rc<Function>),
    Builtin(Rc<Builtin>),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    BoundMethod(Rc<BoundMethod>),
    Code(Arc<CompiledCode>),
    Cell(CellRef),
    Iterator(Rc<RefCell<IterState>>),
    Generator(Rc<Generator>),
    /// Receiver slot of `LOAD_METHOD` when the attribute is not a method.
    Null,
    /// Pending unwind carried through a `finally` block.
    Pending(Pending),
    /// Saved exception in the bottom slot of an unwind triple.
    Traceback(Rc<RuntimeError>),
}

impl Value {
    /// Convert a compile-time constant.
    pub fn from_constant(constant: &Constant) -> Value {
        match constant {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(x) => Value::Float(*x),
            Constant::Str(s) => Value::Str(s.clone()),
            Constant::Tuple(items) => Value::tuple(items.iter().map(Value::from_constant).collect()),
            Constant::Code(code) => Value::Code(code.clone()),
        }
    }

    #[inline]
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    #[inline]
    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::from(items))
    }

    #[inline]
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    #[inline]
    pub fn dict(dict: Dict) -> Value {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    /// Type key for feedback and guards.
    #[inline]
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::None => TypeTag::None,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Str(_) => TypeTag::Str,
            Value::Tuple(_) => TypeTag::Tuple,
            Value::List(_) => TypeTag::List,
            Value::Dict(_) => TypeTag::Dict,
            Value::Slice(_) => TypeTag::Slice,
            Value::Function(_) => TypeTag::Function,
            Value::Builtin(_) => TypeTag::Builtin,
            Value::Class(_) => TypeTag::Class,
            Value::Instance(_) => TypeTag::Instance,
            Value::BoundMethod(_) => TypeTag::BoundMethod,
            Value::Code(_) => TypeTag::Code,
            Value::Cell(_) => TypeTag::Cell,
            Value::Iterator(_) => TypeTag::Iterator,
            Value::Generator(_) => TypeTag::Generator,
            Value::Null | Value::Pending(_) | Value::Traceback(_) => TypeTag::Internal,
        }
    }

    /// Type name for error messages; instances report their class.
    pub fn type_name(&self) -> Cow<'_, str> {
        match self {
            Value::Instance(inst) => Cow::Borrowed(&inst.class.name),
            other => Cow::Borrowed(other.type_tag().name()),
        }
    }

    /// Identity of a watchable object.
    #[inline]
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Value::Function(f) => Some(f.id),
            Value::Builtin(b) => Some(b.id),
            Value::Class(c) => Some(c.id),
            _ => None,
        }
    }

    /// Truth value.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            _ => true,
        }
    }

    /// `self is other`.
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Generator(a), Value::Generator(b)) => Rc::ptr_eq(a, b),
            (Value::Code(a), Value::Code(b)) => a.id == b.id,
            _ => false,
        }
    }

    /// Value equality (`==`).
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b),
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow())
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.items().all(|(k, v)| {
                        matches!(b.get(k), Ok(Some(other)) if other.py_eq(v))
                    })
            }
            (Value::BoundMethod(a), Value::BoundMethod(b)) => {
                a.receiver.is(&b.receiver) && a.function.is(&b.function)
            }
            _ => match (self.as_f64_exact(), other.as_f64_exact()) {
                (Some(a), Some(b)) => match (self.as_int(), other.as_int()) {
                    (Some(x), Some(y)) => x == y,
                    _ => a == b,
                },
                _ => self.is(other),
            },
        }
    }

    /// Integer view of `bool` and `int`.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Float view of any numeric value.
    #[inline]
    pub fn as_f64_exact(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    /// `repr(self)`.
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(x) => format_float(*x),
            Value::Str(s) => quote(s),
            Value::Tuple(items) => {
                let inner = join_repr(items.iter());
                if items.len() == 1 {
                    format!("({inner},)")
                } else {
                    format!("({inner})")
                }
            }
            Value::List(items) => format!("[{}]", join_repr(items.borrow().iter())),
            Value::Dict(d) => {
                let d = d.borrow();
                let parts: Vec<String> = d
                    .items()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Slice(s) => format!(
                "slice({}, {}, {})",
                s.start.repr(),
                s.stop.repr(),
                s.step.repr()
            ),
            Value::Function(f) => format!("<function {}>", f.name),
            Value::Builtin(b) => format!("<built-in function {}>", b.name),
            Value::Class(c) => format!("<class {}>", c.name),
            Value::Instance(inst) if inst.class.exception => {
                format!("{}({})", inst.class.name, join_repr(inst.args().iter()))
            }
            Value::Instance(inst) => format!("<{} instance>", inst.class.name),
            Value::BoundMethod(m) => format!("<bound method {}>", m.function.repr()),
            Value::Code(code) => format!("<code object {}>", code.name),
            Value::Cell(_) => "<cell>".into(),
            Value::Iterator(_) => "<iterator>".into(),
            Value::Generator(g) => format!("<generator object {}>", g.name),
            Value::Null => "<null>".into(),
            Value::Pending(p) => format!("<pending {p:?}>"),
            Value::Traceback(_) => "<traceback>".into(),
        }
    }

    /// `str(self)`.
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Instance(inst) if inst.class.exception => {
                let args = inst.args();
                match args.len() {
                    0 => String::new(),
                    1 => args[0].to_str(),
                    _ => Value::Tuple(args).repr(),
                }
            }
            other => other.repr(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
}

fn join_repr<'a>(items: impl Iterator<Item = &'a Value>) -> String {
    items.map(Value::repr).collect::<Vec<_>>().join(", ")
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Float formatting with a guaranteed fractional part or exponent.
pub fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".into();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if x.fract() == 0.0 && x.abs() < 1e16 {
        return format!("{x:.1}");
    }
    if x.abs() >= 1e16 {
        let s = format!("{x:e}");
        return match s.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => s,
        };
    }
    format!("{x}")
}

// =============================================================================
// Objects
// =============================================================================

/// A user function: code plus the environment captured at definition.
pub struct Function {
    pub id: ObjectId,
    pub name: Arc<str>,
    pub code: Arc<CompiledCode>,
    pub globals: DictRef,
    pub defaults: Vec<Value>,
    pub closure: Vec<CellRef>,
}

impl Function {
    /// Whether a positional-only call with `nargs` arguments needs no binding
    /// work beyond copying the arguments into fast slots.
    pub fn is_simple_call(&self, nargs: usize) -> bool {
        use kite_compiler::CodeFlags;
        let code = &self.code;
        !code.is_generator()
            && code.flags.contains(CodeFlags::OPTIMIZED)
            && !code.flags.contains(CodeFlags::VARARGS)
            && !code.flags.contains(CodeFlags::VARKEYWORDS)
            && code.argcount as usize == nargs
    }
}

/// A function implemented in Rust.
pub struct Builtin {
    pub id: ObjectId,
    pub name: &'static str,
    pub func: NativeFn,
}

impl Builtin {
    /// Wrap `func` as a value.
    pub fn value(name: &'static str, func: NativeFn) -> Value {
        Value::Builtin(Rc::new(Builtin {
            id: ObjectId::fresh(),
            name,
            func,
        }))
    }
}

/// A class. Attribute mutation bumps `version`; callers must notify the
/// invalidation registry first.
pub struct Class {
    pub id: ObjectId,
    pub name: Arc<str>,
    pub bases: Vec<Rc<Class>>,
    /// Derives from the builtin exception root.
    pub exception: bool,
    attrs: RefCell<FxHashMap<Arc<str>, Value>>,
    version: Cell<u64>,
}

impl Class {
    /// Create a class; exception-ness is inherited from any base.
    pub fn new(name: Arc<str>, bases: Vec<Rc<Class>>, attrs: FxHashMap<Arc<str>, Value>) -> Rc<Class> {
        let exception = bases.iter().any(|b| b.exception);
        Rc::new(Class {
            id: ObjectId::fresh(),
            name,
            bases,
            exception,
            attrs: RefCell::new(attrs),
            version: Cell::new(0),
        })
    }

    /// Create the root of the exception hierarchy.
    pub fn exception_root(name: &str) -> Rc<Class> {
        Rc::new(Class {
            id: ObjectId::fresh(),
            name: Arc::from(name),
            bases: Vec::new(),
            exception: true,
            attrs: RefCell::new(FxHashMap::default()),
            version: Cell::new(0),
        })
    }

    /// Attribute lookup through the bases, depth first, left to right.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.attrs.borrow().get(name) {
            return Some(v.clone());
        }
        self.bases.iter().find_map(|base| base.lookup(name))
    }

    /// Attribute defined on this class itself.
    pub fn get_own(&self, name: &str) -> Option<Value> {
        self.attrs.borrow().get(name).cloned()
    }

    /// Store an attribute and bump the version.
    pub(crate) fn store(&self, name: Arc<str>, value: Value) {
        self.attrs.borrow_mut().insert(name, value);
        self.version.set(self.version.get() + 1);
    }

    /// Remove an attribute and bump the version.
    pub(crate) fn remove(&self, name: &str) -> Option<Value> {
        let removed = self.attrs.borrow_mut().remove(name);
        if removed.is_some() {
            self.version.set(self.version.get() + 1);
        }
        removed
    }

    /// Mutation counter.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    /// `issubclass(self, other)`.
    pub fn is_subclass_of(&self, other: &Class) -> bool {
        self.id == other.id || self.bases.iter().any(|b| b.is_subclass_of(other))
    }
}

/// An instance of a user class.
pub struct Instance {
    pub class: Rc<Class>,
    pub attrs: RefCell<FxHashMap<Arc<str>, Value>>,
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Rc<Instance> {
        Rc::new(Instance {
            class,
            attrs: RefCell::new(FxHashMap::default()),
        })
    }

    /// The `args` tuple of an exception instance.
    pub fn args(&self) -> Rc<[Value]> {
        match self.attrs.borrow().get("args") {
            Some(Value::Tuple(items)) => items.clone(),
            _ => Rc::from(Vec::new()),
        }
    }
}

/// A function bound to its receiver.
pub struct BoundMethod {
    pub receiver: Value,
    pub function: Value,
}

/// `slice(start, stop, step)`.
pub struct SliceValue {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

// =============================================================================
// Iteration
// =============================================================================

/// State of a builtin iterator.
pub enum IterState {
    List { list: ListRef, index: usize },
    Tuple { items: Rc<[Value]>, index: usize },
    Str { text: Arc<str>, pos: usize },
    Keys { keys: Vec<Value>, index: usize },
}

impl IterState {
    /// Advance; `None` once exhausted.
    pub fn next_item(&mut self) -> Option<Value> {
        match self {
            IterState::List { list, index } => {
                let item = list.borrow().get(*index).cloned();
                *index += usize::from(item.is_some());
                item
            }
            IterState::Tuple { items, index } => {
                let item = items.get(*index).cloned();
                *index += usize::from(item.is_some());
                item
            }
            IterState::Keys { keys, index } => {
                let item = keys.get(*index).cloned();
                *index += usize::from(item.is_some());
                item
            }
            IterState::Str { text, pos } => {
                let c = text[*pos..].chars().next()?;
                *pos += c.len_utf8();
                Some(Value::Str(Arc::from(c.to_string())))
            }
        }
    }
}

/// Lifecycle of a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    Created,
    Suspended,
    Running,
    Finished,
}

/// A suspended generator frame.
pub struct Generator {
    pub name: Arc<str>,
    pub(crate) frame: RefCell<Option<Box<Frame>>>,
    pub(crate) state: Cell<GenState>,
}

impl Generator {
    pub(crate) fn new(frame: Frame) -> Rc<Generator> {
        Rc::new(Generator {
            name: frame.code.name.clone(),
            frame: RefCell::new(Some(Box::new(frame))),
            state: Cell::new(GenState::Created),
        })
    }

    #[inline]
    pub fn state(&self) -> GenState {
        self.state.get()
    }
}

// =============================================================================
// Dict
// =============================================================================

/// Hashable projection of a value.
///
/// Numbers that compare equal hash equal: `True`, `1` and `1.0` share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Tuple(Box<[HashKey]>),
    Identity(usize),
}

impl HashKey {
    /// Project `value`, or fail with `unhashable type`.
    pub fn of(value: &Value) -> VmResult<HashKey> {
        Ok(match value {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(i64::from(*b)),
            Value::Int(i) => HashKey::Int(*i),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.abs() < 9.2e18 {
                    HashKey::Int(*x as i64)
                } else {
                    HashKey::Float(x.to_bits())
                }
            }
            Value::Str(s) => HashKey::Str(s.clone()),
            Value::Tuple(items) => HashKey::Tuple(
                items
                    .iter()
                    .map(HashKey::of)
                    .collect::<VmResult<Vec<_>>>()?
                    .into_boxed_slice(),
            ),
            Value::Function(f) => HashKey::Identity(Rc::as_ptr(f) as *const () as usize),
            Value::Builtin(b) => HashKey::Identity(Rc::as_ptr(b) as *const () as usize),
            Value::Class(c) => HashKey::Identity(Rc::as_ptr(c) as *const () as usize),
            Value::Instance(i) => HashKey::Identity(Rc::as_ptr(i) as *const () as usize),
            Value::Generator(g) => HashKey::Identity(Rc::as_ptr(g) as *const () as usize),
            Value::Code(c) => HashKey::Identity(Arc::as_ptr(c) as *const () as usize),
            other => {
                return Err(RuntimeError::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )));
            }
        })
    }
}

/// Insertion-ordered hash map from values to values.
#[derive(Default)]
pub struct Dict {
    entries: Vec<Option<(Value, Value)>>,
    index: FxHashMap<HashKey, usize>,
    len: usize,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: &Value) -> VmResult<Option<Value>> {
        Ok(self.get_hashed(&HashKey::of(key)?))
    }

    pub fn contains(&self, key: &Value) -> VmResult<bool> {
        Ok(self.index.contains_key(&HashKey::of(key)?))
    }

    pub fn set(&mut self, key: Value, value: Value) -> VmResult<()> {
        let hashed = HashKey::of(&key)?;
        self.set_hashed(hashed, key, value);
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> VmResult<Option<Value>> {
        Ok(self.remove_hashed(&HashKey::of(key)?))
    }

    // -------------------------------------------------------------------------
    // Namespace access by name
    // -------------------------------------------------------------------------

    #[inline]
    pub fn get_str(&self, name: &Arc<str>) -> Option<Value> {
        self.get_hashed(&HashKey::Str(name.clone()))
    }

    #[inline]
    pub fn set_str(&mut self, name: Arc<str>, value: Value) {
        self.set_hashed(HashKey::Str(name.clone()), Value::Str(name), value);
    }

    #[inline]
    pub fn remove_str(&mut self, name: &Arc<str>) -> Option<Value> {
        self.remove_hashed(&HashKey::Str(name.clone()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.items().map(|(k, _)| k)
    }

    pub fn items(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().flatten().map(|(k, v)| (k, v))
    }

    fn get_hashed(&self, key: &HashKey) -> Option<Value> {
        let slot = *self.index.get(key)?;
        self.entries[slot].as_ref().map(|(_, v)| v.clone())
    }

    fn set_hashed(&mut self, hashed: HashKey, key: Value, value: Value) {
        match self.index.get(&hashed) {
            Some(&slot) => {
                if let Some(entry) = self.entries[slot].as_mut() {
                    entry.1 = value;
                }
            }
            None => {
                self.index.insert(hashed, self.entries.len());
                self.entries.push(Some((key, value)));
                self.len += 1;
            }
        }
    }

    fn remove_hashed(&mut self, key: &HashKey) -> Option<Value> {
        let slot = self.index.remove(key)?;
        let (_, value) = self.entries[slot].take()?;
        self.len -= 1;
        if self.entries.len() > 2 * self.len + 8 {
            self.compact();
        }
        Some(value)
    }

    fn compact(&mut self) {
        self.entries.retain(Option::is_some);
        self.index.clear();
        for (slot, entry) in self.entries.iter().enumerate() {
            if let Some((key, _)) = entry
                && let Ok(hashed) = HashKey::of(key)
            {
                self.index.insert(hashed, slot);
            }
        }
    }
}

impl fmt::Debug for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.items()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_keys_collide() {
        let mut d = Dict::new();
        d.set(Value::Int(1), Value::str("int")).unwrap();
        d.set(Value::Float(1.0), Value::str("float")).unwrap();
        d.set(Value::Bool(true), Value::str("bool")).unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d.get(&Value::Int(1)).unwrap().unwrap().to_str(), "bool");
    }

    #[test]
    fn test_unhashable_list() {
        let err = HashKey::of(&Value::list(vec![])).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: unhashable type: 'list'");
    }

    #[test]
    fn test_dict_keeps_insertion_order_after_removal() {
        let mut d = Dict::new();
        for i in 0..20 {
            d.set(Value::Int(i), Value::Int(i * i)).unwrap();
        }
        for i in 0..15 {
            d.remove(&Value::Int(i)).unwrap();
        }
        let keys: Vec<i64> = d.keys().filter_map(Value::as_int).collect();
        assert_eq!(keys, vec![15, 16, 17, 18, 19]);
        assert_eq!(d.get(&Value::Int(17)).unwrap().unwrap().as_int(), Some(289));
    }

    #[test]
    fn test_repr() {
        assert_eq!(Value::Float(1.0).repr(), "1.0");
        assert_eq!(Value::Float(0.5).repr(), "0.5");
        assert_eq!(Value::Float(1e20).repr(), "1e+20");
        assert_eq!(Value::str("it's").repr(), "'it\\'s'");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(
            Value::list(vec![Value::None, Value::Bool(true)]).repr(),
            "[None, True]"
        );
    }

    #[test]
    fn test_equality_across_numeric_types() {
        assert!(Value::Int(2).py_eq(&Value::Float(2.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::str("1").py_eq(&Value::Int(1)));
        let a = Value::list(vec![Value::Int(1), Value::str("x")]);
        let b = Value::list(vec![Value::Float(1.0), Value::str("x")]);
        assert!(a.py_eq(&b));
        assert!(!a.is(&b));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.truthy());
        assert!(!Value::str("").truthy());
        assert!(Value::tuple(vec![Value::None]).truthy());
        assert!(!Value::dict(Dict::new()).truthy());
    }

    #[test]
    fn test_class_lookup_and_version() {
        let base = Class::new("Base".into(), vec![], FxHashMap::default());
        base.store("x".into(), Value::Int(1));
        let derived = Class::new("Derived".into(), vec![base.clone()], FxHashMap::default());
        assert_eq!(derived.lookup("x").and_then(|v| v.as_int()), Some(1));
        assert!(derived.get_own("x").is_none());
        assert!(derived.is_subclass_of(&base));
        assert!(!base.is_subclass_of(&derived));

        let before = base.version();
        base.remove("x");
        assert_eq!(base.version(), before + 1);
        assert!(derived.lookup("x").is_none());
    }

    #[test]
    fn test_string_iteration() {
        let mut it = IterState::Str {
            text: Arc::from("hé"),
            pos: 0,
        };
        assert_eq!(it.next_item().unwrap().to_str(), "h");
        assert_eq!(it.next_item().unwrap().to_str(), "é");
        assert!(it.next_item().is_none());
    }
}
