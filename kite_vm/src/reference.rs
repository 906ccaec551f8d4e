//! Tree-walking reference interpreter.
//!
//! Evaluates a [`Module`] straight from the AST, sharing the VM's value
//! model, operator helpers and builtins. Compiled execution is checked
//! against it: running the bytecode must leave the same globals and output,
//! or fail with the same error kind.
//!
//! The supported subset covers expressions, assignments (including
//! unpacking, subscript and attribute targets), `if`/`while`/`for` with
//! `else`, `break`/`continue`, `assert`, and module-level functions with
//! positional parameters and defaults. Functions are called by name only.
//! Anything else fails with an internal error.

use crate::config::VmConfig;
use crate::error::{RuntimeError, RuntimeErrorKind, VmResult};
use crate::ops::arithmetic::{binary_op, inplace_op, unary_op};
use crate::ops::comparison::compare;
use crate::ops::containers::{make_iter, store_subscript, subscript, unpack};
use crate::ops::objects::{get_attr, set_attr};
use crate::value::{Dict, SliceValue, Value};
use crate::vm::Vm;
use kite_core::ast::{
    BoolOp, Comprehension, Expr, ExprKind, FunctionDef, Literal, Module, Slice, Stmt, StmtKind,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::rc::Rc;
use std::sync::Arc;

/// How a statement finished.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// A module-level function definition with its defaults evaluated.
struct RefFunction {
    def: FunctionDef,
    defaults: Vec<Value>,
    /// Names assigned anywhere in the body, minus `global` declarations.
    locals: FxHashSet<Arc<str>>,
}

/// Function-local bindings. Module level has none.
struct Scope<'f> {
    function: &'f RefFunction,
    values: FxHashMap<Arc<str>, Value>,
}

/// The reference interpreter.
pub struct Reference {
    vm: Vm,
    defs: FxHashMap<Arc<str>, Rc<RefFunction>>,
    /// Target bindings of the list comprehensions being evaluated,
    /// innermost last. Each comprehension is its own scope.
    comprehensions: Vec<FxHashMap<Arc<str>, Value>>,
    depth: usize,
}

impl Reference {
    pub fn new() -> Self {
        Self {
            vm: Vm::new(VmConfig::baseline_only()),
            defs: FxHashMap::default(),
            comprehensions: Vec::new(),
            depth: 0,
        }
    }

    /// Run every statement of `module`.
    pub fn run_module(&mut self, module: &Module) -> VmResult<()> {
        match self.exec_block(&module.body, &mut None)? {
            Flow::Normal => Ok(()),
            Flow::Return(_) => Err(unsupported("'return' outside function")),
            Flow::Break | Flow::Continue => Err(unsupported("loop control outside a loop")),
        }
    }

    /// Global `name`; functions are not first-class here and read as `None`.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.vm.global(name)
    }

    /// Everything printed so far.
    pub fn output(&self) -> &str {
        self.vm.output()
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn exec_block(&mut self, body: &[Stmt], scope: &mut Option<Scope<'_>>) -> VmResult<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &mut Option<Scope<'_>>) -> VmResult<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, scope)?;
                for target in targets {
                    self.assign(target, value.clone(), scope)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value, scope)?,
            StmtKind::If { test, body, orelse } => {
                let branch = if self.eval(test, scope)?.truthy() { body } else { orelse };
                return self.exec_block(branch, scope);
            }
            StmtKind::While { test, body, orelse } => {
                loop {
                    if !self.eval(test, scope)?.truthy() {
                        return self.exec_block(orelse, scope);
                    }
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
            }
            StmtKind::For { target, iter, body, orelse } => {
                let iterable = self.eval(iter, scope)?;
                let iter = make_iter(&iterable)?;
                loop {
                    let Some(item) = self.vm.next_item(&iter)? else {
                        return self.exec_block(orelse, scope);
                    };
                    self.assign(target, item, scope)?;
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Return(value) => {
                if scope.is_none() {
                    return Err(unsupported("'return' outside function"));
                }
                let value = match value {
                    Some(value) => self.eval(value, scope)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::FunctionDef(def) => {
                if scope.is_some() {
                    return Err(unsupported("nested function definitions"));
                }
                self.define(def, scope)?;
            }
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, scope)?.truthy() {
                    let message = match msg {
                        Some(msg) => self.eval(msg, scope)?.to_str(),
                        None => String::new(),
                    };
                    return Err(RuntimeError::new(RuntimeErrorKind::AssertionError, message));
                }
            }
            StmtKind::Global(_) | StmtKind::Pass => {}
            _ => return Err(unsupported("this statement")),
        }
        Ok(Flow::Normal)
    }

    fn define(&mut self, def: &FunctionDef, scope: &mut Option<Scope<'_>>) -> VmResult<()> {
        if !def.decorators.is_empty() || def.args.vararg.is_some() || def.args.kwarg.is_some() {
            return Err(unsupported("decorators and star parameters"));
        }
        let defaults = def
            .args
            .defaults
            .iter()
            .map(|d| self.eval(d, scope))
            .collect::<VmResult<Vec<_>>>()?;
        let name: Arc<str> = Arc::from(def.name.as_str());
        let function = RefFunction {
            locals: local_names(def),
            def: def.clone(),
            defaults,
        };
        self.vm.set_global(&name, Value::None);
        self.defs.insert(name, Rc::new(function));
        Ok(())
    }

    fn aug_assign(
        &mut self,
        target: &Expr,
        op: kite_core::ast::BinOp,
        value: &Expr,
        scope: &mut Option<Scope<'_>>,
    ) -> VmResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                let current = self.load(name, scope)?;
                let rhs = self.eval(value, scope)?;
                let result = inplace_op(op, &current, &rhs)?;
                self.store(name, result, scope);
            }
            ExprKind::Subscript { value: container, slice } => {
                let container = self.eval(container, scope)?;
                let index = self.eval_slice(slice, scope)?;
                let current = subscript(&container, &index)?;
                let rhs = self.eval(value, scope)?;
                let result = inplace_op(op, &current, &rhs)?;
                store_subscript(&container, &index, result)?;
            }
            ExprKind::Attribute { value: obj, attr } => {
                let obj = self.eval(obj, scope)?;
                let attr: Arc<str> = Arc::from(attr.as_str());
                let current = get_attr(&mut self.vm, &obj, &attr)?;
                let rhs = self.eval(value, scope)?;
                let result = inplace_op(op, &current, &rhs)?;
                set_attr(&mut self.vm, &obj, attr, result)?;
            }
            _ => return Err(unsupported("this augmented assignment target")),
        }
        Ok(())
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    fn assign(&mut self, target: &Expr, value: Value, scope: &mut Option<Scope<'_>>) -> VmResult<()> {
        match &target.kind {
            ExprKind::Name(name) => self.store(name, value, scope),
            ExprKind::Tuple(elts) | ExprKind::List(elts) => {
                let items = unpack(&mut self.vm, &value, elts.len())?;
                for (elt, item) in elts.iter().zip(items) {
                    self.assign(elt, item, scope)?;
                }
            }
            ExprKind::Subscript { value: container, slice } => {
                let container = self.eval(container, scope)?;
                let index = self.eval_slice(slice, scope)?;
                store_subscript(&container, &index, value)?;
            }
            ExprKind::Attribute { value: obj, attr } => {
                let obj = self.eval(obj, scope)?;
                set_attr(&mut self.vm, &obj, Arc::from(attr.as_str()), value)?;
            }
            _ => return Err(unsupported("this assignment target")),
        }
        Ok(())
    }

    fn store(&mut self, name: &str, value: Value, scope: &mut Option<Scope<'_>>) {
        if let Some(targets) = self.comprehensions.last_mut() {
            targets.insert(Arc::from(name), value);
            return;
        }
        if let Some(scope) = scope
            && scope.function.locals.contains(name)
        {
            scope.values.insert(Arc::from(name), value);
            return;
        }
        self.defs.remove(name);
        self.vm.set_global(name, value);
    }

    fn load(&self, name: &str, scope: &Option<Scope<'_>>) -> VmResult<Value> {
        if let Some(value) = self.comprehensions.iter().rev().find_map(|c| c.get(name)) {
            return Ok(value.clone());
        }
        if let Some(scope) = scope
            && scope.function.locals.contains(name)
        {
            return scope
                .values
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::unbound_local(name));
        }
        if self.defs.contains_key(name) {
            return Err(unsupported("functions used as values"));
        }
        self.vm
            .global(name)
            .or_else(|| self.vm.builtin(name))
            .ok_or_else(|| match scope {
                Some(_) => RuntimeError::global_name_error(name),
                None => RuntimeError::name_error(name),
            })
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn eval(&mut self, expr: &Expr, scope: &mut Option<Scope<'_>>) -> VmResult<Value> {
        match &expr.kind {
            ExprKind::Constant(literal) => Ok(match literal {
                Literal::None => Value::None,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Int(i) => Value::Int(*i),
                Literal::Float(x) => Value::Float(*x),
                Literal::Str(s) => Value::str(s),
            }),
            ExprKind::Name(name) => self.load(name, scope),
            ExprKind::BinOp { left, op, right } => {
                let lhs = self.eval(left, scope)?;
                let rhs = self.eval(right, scope)?;
                binary_op(*op, &lhs, &rhs)
            }
            ExprKind::UnaryOp { op, operand } => {
                let value = self.eval(operand, scope)?;
                unary_op(*op, &value)
            }
            ExprKind::BoolOp { op, values } => {
                let mut result = Value::None;
                for value in values {
                    result = self.eval(value, scope)?;
                    let decided = match op {
                        BoolOp::And => !result.truthy(),
                        BoolOp::Or => result.truthy(),
                    };
                    if decided {
                        break;
                    }
                }
                Ok(result)
            }
            ExprKind::Compare { left, ops, comparators } => {
                let mut lhs = self.eval(left, scope)?;
                let mut result = Value::Bool(true);
                for (op, comparator) in ops.iter().zip(comparators) {
                    let rhs = self.eval(comparator, scope)?;
                    result = compare(*op, &lhs, &rhs)?;
                    if !result.truthy() {
                        break;
                    }
                    lhs = rhs;
                }
                Ok(result)
            }
            ExprKind::IfExp { test, body, orelse } => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(body, scope)
                } else {
                    self.eval(orelse, scope)
                }
            }
            ExprKind::List(elts) => Ok(Value::list(self.eval_all(elts, scope)?)),
            ExprKind::Tuple(elts) => Ok(Value::tuple(self.eval_all(elts, scope)?)),
            ExprKind::Dict { keys, values } => {
                let mut dict = Dict::with_capacity(keys.len());
                for (key, value) in keys.iter().zip(values) {
                    let value = self.eval(value, scope)?;
                    let key = self.eval(key, scope)?;
                    dict.set(key, value)?;
                }
                Ok(Value::dict(dict))
            }
            ExprKind::Subscript { value, slice } => {
                let container = self.eval(value, scope)?;
                let index = self.eval_slice(slice, scope)?;
                subscript(&container, &index)
            }
            ExprKind::Attribute { value, attr } => {
                let obj = self.eval(value, scope)?;
                get_attr(&mut self.vm, &obj, &Arc::from(attr.as_str()))
            }
            ExprKind::Call { func, args, keywords, starargs, kwargs } => {
                if !keywords.is_empty() || starargs.is_some() || kwargs.is_some() {
                    return Err(unsupported("keyword and star arguments"));
                }
                if let ExprKind::Name(name) = &func.kind
                    && !scope.as_ref().is_some_and(|s| s.function.locals.contains(name.as_str()))
                    && let Some(function) = self.defs.get(name.as_str()).cloned()
                {
                    let args = self.eval_all(args, scope)?;
                    return self.call_function(&function, args);
                }
                let callee = self.eval(func, scope)?;
                let args = self.eval_all(args, scope)?;
                self.vm.call(&callee, args)
            }
            ExprKind::ListComp { elt, generators } => {
                let Some(first) = generators.first() else {
                    return Err(unsupported("a comprehension without loops"));
                };
                let outermost = self.eval(&first.iter, scope)?;
                let mut out = Vec::new();
                self.comprehensions.push(FxHashMap::default());
                let result = self.comprehension(elt, generators, Some(outermost), scope, &mut out);
                self.comprehensions.pop();
                result?;
                Ok(Value::list(out))
            }
            _ => Err(unsupported("this expression")),
        }
    }

    fn eval_all(&mut self, exprs: &[Expr], scope: &mut Option<Scope<'_>>) -> VmResult<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e, scope)).collect()
    }

    fn eval_slice(&mut self, slice: &Slice, scope: &mut Option<Scope<'_>>) -> VmResult<Value> {
        match slice {
            Slice::Index(index) => self.eval(index, scope),
            Slice::Slice { lower, upper, step } => {
                let start = self.eval_opt(lower.as_ref(), scope)?;
                let stop = self.eval_opt(upper.as_ref(), scope)?;
                let step = self.eval_opt(step.as_ref(), scope)?;
                Ok(Value::Slice(Rc::new(SliceValue { start, stop, step })))
            }
        }
    }

    fn eval_opt(&mut self, expr: Option<&Expr>, scope: &mut Option<Scope<'_>>) -> VmResult<Value> {
        match expr {
            Some(expr) => self.eval(expr, scope),
            None => Ok(Value::None),
        }
    }

    /// Nested loops of a list comprehension. The outermost iterable is
    /// evaluated by the caller in the enclosing scope; inner ones are
    /// evaluated afresh for every item.
    fn comprehension(
        &mut self,
        elt: &Expr,
        generators: &[Comprehension],
        outermost: Option<Value>,
        scope: &mut Option<Scope<'_>>,
        out: &mut Vec<Value>,
    ) -> VmResult<()> {
        let Some((first, rest)) = generators.split_first() else {
            out.push(self.eval(elt, scope)?);
            return Ok(());
        };
        let iterable = match outermost {
            Some(iterable) => iterable,
            None => self.eval(&first.iter, scope)?,
        };
        let iter = make_iter(&iterable)?;
        'items: while let Some(item) = self.vm.next_item(&iter)? {
            self.assign(&first.target, item, scope)?;
            for cond in &first.ifs {
                if !self.eval(cond, scope)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehension(elt, rest, None, scope, out)?;
        }
        Ok(())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call_function(&mut self, function: &RefFunction, args: Vec<Value>) -> VmResult<Value> {
        let params = &function.def.args.args;
        let given = args.len();
        let ndefaults = function.defaults.len().min(params.len());
        if given > params.len() || given + ndefaults < params.len() {
            return Err(arity_error(function, given));
        }
        if self.depth >= self.vm.config().max_recursion_depth {
            return Err(RuntimeError::recursion_limit());
        }

        let mut values = FxHashMap::default();
        let first_default = params.len() - ndefaults;
        let skipped = function.defaults.len() - ndefaults;
        for (i, param) in params.iter().enumerate() {
            let value = match args.get(i) {
                Some(arg) => arg.clone(),
                None => function.defaults[skipped + i - first_default].clone(),
            };
            values.insert(Arc::from(param.as_str()), value);
        }

        let mut scope = Some(Scope { function, values });
        // The callee's body does not see the caller's comprehension scopes.
        let comprehensions = std::mem::take(&mut self.comprehensions);
        self.depth += 1;
        let flow = self.exec_block(&function.def.body, &mut scope);
        self.depth -= 1;
        self.comprehensions = comprehensions;
        match flow? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::None),
            Flow::Break | Flow::Continue => Err(unsupported("loop control outside a loop")),
        }
    }
}

impl Default for Reference {
    fn default() -> Self {
        Self::new()
    }
}

fn unsupported(what: &str) -> RuntimeError {
    RuntimeError::internal(format!("reference interpreter does not support {what}"))
}

fn arity_error(function: &RefFunction, given: usize) -> RuntimeError {
    let argcount = function.def.args.args.len();
    let ndefaults = function.defaults.len().min(argcount);
    let (qualifier, expected) = if given > argcount {
        (if ndefaults > 0 { "at most" } else { "exactly" }, argcount)
    } else if ndefaults > 0 {
        ("at least", argcount - ndefaults)
    } else {
        ("exactly", argcount)
    };
    let plural = if expected == 1 { "" } else { "s" };
    RuntimeError::type_error(format!(
        "{}() takes {qualifier} {expected} argument{plural} ({given} given)",
        function.def.name
    ))
}

// =============================================================================
// Local Scanning
// =============================================================================

/// Parameters plus every name the body binds, minus `global` names.
fn local_names(def: &FunctionDef) -> FxHashSet<Arc<str>> {
    let mut bound = FxHashSet::default();
    let mut globals = FxHashSet::default();
    for param in &def.args.args {
        bound.insert(Arc::from(param.as_str()));
    }
    scan_block(&def.body, &mut bound, &mut globals);
    bound.retain(|name| !globals.contains(name));
    bound
}

fn scan_block(body: &[Stmt], bound: &mut FxHashSet<Arc<str>>, globals: &mut FxHashSet<Arc<str>>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => {
                targets.iter().for_each(|t| scan_target(t, bound));
            }
            StmtKind::AugAssign { target, .. } => scan_target(target, bound),
            StmtKind::For { target, body, orelse, .. } => {
                scan_target(target, bound);
                scan_block(body, bound, globals);
                scan_block(orelse, bound, globals);
            }
            StmtKind::While { body, orelse, .. } | StmtKind::If { body, orelse, .. } => {
                scan_block(body, bound, globals);
                scan_block(orelse, bound, globals);
            }
            StmtKind::Global(names) => {
                globals.extend(names.iter().map(|n| Arc::from(n.as_str())));
            }
            StmtKind::FunctionDef(def) => {
                bound.insert(Arc::from(def.name.as_str()));
            }
            _ => {}
        }
    }
}

fn scan_target(target: &Expr, bound: &mut FxHashSet<Arc<str>>) {
    match &target.kind {
        ExprKind::Name(name) => {
            bound.insert(Arc::from(name.as_str()));
        }
        ExprKind::Tuple(elts) | ExprKind::List(elts) => {
            elts.iter().for_each(|e| scan_target(e, bound));
        }
        _ => {}
    }
}
