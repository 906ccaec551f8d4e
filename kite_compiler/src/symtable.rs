//! Scope analysis.
//!
//! Builds one [`Scope`] per module, class body, function, lambda and
//! comprehension, then classifies every name used in each scope:
//!
//! - **Local**: bound in this scope (assignment, parameter, `def`, `for`, ...)
//! - **GlobalExplicit**: declared with `global`
//! - **GlobalImplicit**: used but bound nowhere in an enclosing function
//! - **Free**: bound in an enclosing function and used here
//! - **Cell**: bound here and used as free by a nested scope
//!
//! # Algorithm
//!
//! 1. Walk the AST collecting per-scope flags (`DEF_LOCAL`, `DEF_PARAM`,
//!    `DEF_GLOBAL`, `USE`).
//! 2. Walk the scope tree top-down carrying the names bound by enclosing
//!    functions. Class bodies do not contribute bindings to nested scopes.
//! 3. On the way back up, names free in children become cells where they are
//!    bound, or pass-through free variables in the scopes between.
//!
//! Scopes are keyed by the address of the AST node that opens them, so the
//! compiler can find a scope even after skipping statically dead code.

use crate::error::{CompileError, CompileResult};
use kite_core::ast::{
    Arguments, Comprehension, Expr, ExprKind, Module, Slice, Stmt, StmtKind,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

// =============================================================================
// Symbols
// =============================================================================

/// Per-name definition and use bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SymbolFlags(u8);

impl SymbolFlags {
    /// Bound by assignment, `def`, `class`, `for`, `del`, ...
    pub const DEF_LOCAL: SymbolFlags = SymbolFlags(0x01);
    /// Formal parameter.
    pub const DEF_PARAM: SymbolFlags = SymbolFlags(0x02);
    /// Named in a `global` statement.
    pub const DEF_GLOBAL: SymbolFlags = SymbolFlags(0x04);
    /// Read.
    pub const USE: SymbolFlags = SymbolFlags(0x08);
    /// Bound in a class body but also passed through to a nested scope.
    pub const DEF_FREE_CLASS: SymbolFlags = SymbolFlags(0x10);

    /// Whether every bit of `other` is set.
    #[inline]
    pub const fn contains(self, other: SymbolFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the name is bound in its own scope.
    #[inline]
    pub const fn is_bound(self) -> bool {
        self.0 & (Self::DEF_LOCAL.0 | Self::DEF_PARAM.0) != 0
    }
}

impl BitOr for SymbolFlags {
    type Output = SymbolFlags;

    fn bitor(self, rhs: SymbolFlags) -> SymbolFlags {
        SymbolFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SymbolFlags {
    fn bitor_assign(&mut self, rhs: SymbolFlags) {
        self.0 |= rhs.0;
    }
}

/// Resolved storage class of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolScope {
    /// Local to the scope.
    Local,
    /// `global` declaration.
    GlobalExplicit,
    /// Resolved in globals then builtins.
    GlobalImplicit,
    /// Captured from an enclosing function.
    Free,
    /// Local captured by a nested scope.
    Cell,
}

/// One name in one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// Collected flags.
    pub flags: SymbolFlags,
    /// Resolution; valid after analysis.
    pub scope: SymbolScope,
}

// =============================================================================
// Scopes
// =============================================================================

/// Index of a scope in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// Identity of the AST node that opens a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeKey(usize);

impl ScopeKey {
    /// Key for `node`. Stable for as long as the tree is borrowed.
    #[inline]
    pub fn of<T>(node: &T) -> Self {
        ScopeKey(std::ptr::from_ref(node) as usize)
    }
}

/// Kind of block a scope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// Top level.
    Module,
    /// Class body.
    Class,
    /// `def`
    Function,
    /// `lambda`
    Lambda,
    /// Generator expression.
    GeneratorExp,
    /// List comprehension.
    ListComp,
}

impl ScopeKind {
    /// Whether the scope executes as a function (fast locals, arguments).
    #[inline]
    pub const fn is_function(self) -> bool {
        matches!(
            self,
            ScopeKind::Function | ScopeKind::Lambda | ScopeKind::GeneratorExp | ScopeKind::ListComp
        )
    }
}

/// Analysis result for one scope.
#[derive(Debug, Clone)]
pub struct Scope {
    /// Block kind.
    pub kind: ScopeKind,
    /// Name of the defined object.
    pub name: Arc<str>,
    /// Line of the defining node.
    pub line: u32,
    /// Every name seen in the scope.
    pub symbols: FxHashMap<Arc<str>, Symbol>,
    /// Parameters in order: positional, then `*args`, then `**kwargs`.
    pub params: Vec<Arc<str>>,
    /// Nested scopes in source order.
    pub children: Vec<ScopeId>,
    /// Contains `yield` (or is a generator expression).
    pub generator: bool,
    /// Has a `*args` parameter.
    pub varargs: bool,
    /// Has a `**kwargs` parameter.
    pub varkeywords: bool,
    /// Defined inside a function.
    pub nested: bool,
    /// Contains `exec`; locals cannot all be resolved statically.
    pub unoptimized: bool,
    /// Contains `try` or `with`.
    pub blockstack: bool,
    /// Line of the first `return value`, if any.
    pub return_with_value: Option<u32>,
    tmpnames: u32,
}

impl Scope {
    fn new(kind: ScopeKind, name: &str, line: u32) -> Self {
        Self {
            kind,
            name: Arc::from(name),
            line,
            symbols: FxHashMap::default(),
            params: Vec::new(),
            children: Vec::new(),
            generator: kind == ScopeKind::GeneratorExp,
            varargs: false,
            varkeywords: false,
            nested: false,
            unoptimized: false,
            blockstack: false,
            return_with_value: None,
            tmpnames: 0,
        }
    }

    fn add(&mut self, name: &str, flags: SymbolFlags) {
        if let Some(sym) = self.symbols.get_mut(name) {
            sym.flags |= flags;
            return;
        }
        self.symbols.insert(
            Arc::from(name),
            Symbol {
                flags,
                scope: SymbolScope::GlobalImplicit,
            },
        );
    }

    /// Resolution of `name`, if it occurs in this scope.
    pub fn lookup(&self, name: &str) -> Option<SymbolScope> {
        self.symbols.get(name).map(|s| s.scope)
    }

    /// Sorted names of cell variables.
    pub fn cellvars(&self) -> Vec<Arc<str>> {
        let mut out: Vec<_> = self
            .symbols
            .iter()
            .filter(|(_, s)| s.scope == SymbolScope::Cell)
            .map(|(n, _)| n.clone())
            .collect();
        out.sort();
        out
    }

    /// Sorted names of free variables, including names a class body passes
    /// through to its methods.
    pub fn freevars(&self) -> Vec<Arc<str>> {
        let mut out: Vec<_> = self
            .symbols
            .iter()
            .filter(|(_, s)| {
                s.scope == SymbolScope::Free || s.flags.contains(SymbolFlags::DEF_FREE_CLASS)
            })
            .map(|(n, _)| n.clone())
            .collect();
        out.sort();
        out
    }
}

/// Scopes of a whole module.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    keys: FxHashMap<ScopeKey, ScopeId>,
}

impl SymbolTable {
    /// Analyze `module`.
    pub fn build(module: &Module) -> CompileResult<Self> {
        let mut builder = Builder {
            table: SymbolTable {
                scopes: vec![Scope::new(ScopeKind::Module, "<module>", 1)],
                keys: FxHashMap::default(),
            },
            stack: vec![ScopeId(0)],
            line: 0,
        };
        builder.table.keys.insert(ScopeKey::of(module), ScopeId(0));
        for stmt in &module.body {
            builder.visit_stmt(stmt)?;
        }
        let mut table = builder.table;
        table.analyze(ScopeId(0), &FxHashSet::default(), &FxHashSet::default());
        Ok(table)
    }

    /// The module scope.
    #[inline]
    pub const fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    /// Borrow a scope.
    #[inline]
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    /// Scope opened by the node with `key`.
    pub fn lookup(&self, key: ScopeKey) -> Option<ScopeId> {
        self.keys.get(&key).copied()
    }

    /// Number of scopes.
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Always false: the module scope exists.
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Resolve one scope and its children. Returns the names this scope needs
    /// from enclosing scopes.
    fn analyze(
        &mut self,
        id: ScopeId,
        bound: &FxHashSet<Arc<str>>,
        global: &FxHashSet<Arc<str>>,
    ) -> FxHashSet<Arc<str>> {
        let idx = id.0 as usize;
        let kind = self.scopes[idx].kind;

        let mut local = FxHashSet::default();
        let mut free = FxHashSet::default();
        let mut newglobal = global.clone();
        let mut newbound = bound.clone();

        for (name, sym) in self.scopes[idx].symbols.iter_mut() {
            sym.scope = if sym.flags.contains(SymbolFlags::DEF_GLOBAL) {
                newglobal.insert(name.clone());
                newbound.remove(name);
                SymbolScope::GlobalExplicit
            } else if sym.flags.is_bound() {
                local.insert(name.clone());
                newglobal.remove(name);
                SymbolScope::Local
            } else if kind != ScopeKind::Module && bound.contains(name) {
                free.insert(name.clone());
                SymbolScope::Free
            } else {
                SymbolScope::GlobalImplicit
            };
        }

        if kind.is_function() {
            for name in &local {
                newbound.insert(name.clone());
            }
        }

        let children = self.scopes[idx].children.clone();
        let mut child_free = FxHashSet::default();
        for child in children {
            child_free.extend(self.analyze(child, &newbound, &newglobal));
        }

        let scope = &mut self.scopes[idx];
        for name in child_free {
            match scope.symbols.get_mut(&name) {
                Some(sym) if kind.is_function() && sym.scope == SymbolScope::Local => {
                    sym.scope = SymbolScope::Cell;
                }
                Some(sym) if kind == ScopeKind::Class && sym.scope == SymbolScope::Local => {
                    sym.flags |= SymbolFlags::DEF_FREE_CLASS;
                    free.insert(name);
                }
                Some(sym) if sym.scope == SymbolScope::Free || sym.scope == SymbolScope::Cell => {
                    if sym.scope == SymbolScope::Free {
                        free.insert(name);
                    }
                }
                Some(_) => {}
                None if kind != ScopeKind::Module && bound.contains(&name) => {
                    scope.symbols.insert(
                        name.clone(),
                        Symbol {
                            flags: SymbolFlags::default(),
                            scope: SymbolScope::Free,
                        },
                    );
                    free.insert(name);
                }
                None => {}
            }
        }

        if kind == ScopeKind::Module {
            FxHashSet::default()
        } else {
            free
        }
    }
}

// =============================================================================
// Collection Pass
// =============================================================================

struct Builder {
    table: SymbolTable,
    stack: Vec<ScopeId>,
    line: u32,
}

impl Builder {
    fn cur(&mut self) -> &mut Scope {
        let id = self.stack[self.stack.len() - 1];
        &mut self.table.scopes[id.0 as usize]
    }

    fn add(&mut self, name: &str, flags: SymbolFlags) {
        self.cur().add(name, flags);
    }

    fn enter<T>(&mut self, node: &T, kind: ScopeKind, name: &str, line: u32) {
        let parent = self.stack[self.stack.len() - 1];
        let parent_scope = &self.table.scopes[parent.0 as usize];
        let nested = parent_scope.kind.is_function() || parent_scope.nested;
        let id = ScopeId(self.table.scopes.len() as u32);
        let mut scope = Scope::new(kind, name, line);
        scope.nested = nested;
        self.table.scopes.push(scope);
        self.table.scopes[parent.0 as usize].children.push(id);
        self.table.keys.insert(ScopeKey::of(node), id);
        self.stack.push(id);
    }

    fn exit(&mut self) {
        self.stack.pop();
    }

    fn new_tmpname(&mut self) {
        let scope = self.cur();
        scope.tmpnames += 1;
        let name = format!("_[{}]", scope.tmpnames);
        scope.add(&name, SymbolFlags::DEF_LOCAL);
    }

    fn params(&mut self, args: &Arguments) {
        let scope = self.cur();
        for name in &args.args {
            scope.add(name, SymbolFlags::DEF_PARAM);
            scope.params.push(Arc::from(name.as_str()));
        }
        if let Some(name) = &args.vararg {
            scope.add(name, SymbolFlags::DEF_PARAM);
            scope.params.push(Arc::from(name.as_str()));
            scope.varargs = true;
        }
        if let Some(name) = &args.kwarg {
            scope.add(name, SymbolFlags::DEF_PARAM);
            scope.params.push(Arc::from(name.as_str()));
            scope.varkeywords = true;
        }
    }

    fn visit_body(&mut self, body: &[Stmt]) -> CompileResult<()> {
        body.iter().try_for_each(|s| self.visit_stmt(s))
    }

    fn visit_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                self.add(&def.name, SymbolFlags::DEF_LOCAL);
                for e in def.args.defaults.iter().chain(&def.decorators) {
                    self.visit_expr(e)?;
                }
                self.enter(&**def, ScopeKind::Function, &def.name, stmt.line);
                self.params(&def.args);
                self.visit_body(&def.body)?;
                self.exit();
            }
            StmtKind::ClassDef(class) => {
                self.add(&class.name, SymbolFlags::DEF_LOCAL);
                for e in class.bases.iter().chain(&class.decorators) {
                    self.visit_expr(e)?;
                }
                self.enter(&**class, ScopeKind::Class, &class.name, stmt.line);
                self.visit_body(&class.body)?;
                self.exit();
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.visit_expr(value)?;
                    let line = stmt.line;
                    let scope = self.cur();
                    scope.return_with_value.get_or_insert(line);
                }
            }
            StmtKind::Delete(targets) => {
                for t in targets {
                    self.visit_target(t)?;
                }
            }
            StmtKind::Assign { targets, value } => {
                self.visit_expr(value)?;
                for t in targets {
                    self.visit_target(t)?;
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                match &target.kind {
                    ExprKind::Name(id) => self.add(id, SymbolFlags::DEF_LOCAL | SymbolFlags::USE),
                    _ => self.visit_expr(target)?,
                }
                self.visit_expr(value)?;
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.visit_target(target)?;
                self.visit_expr(iter)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }
            StmtKind::While { test, body, orelse } | StmtKind::If { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }
            StmtKind::With {
                context,
                target,
                body,
            } => {
                self.cur().blockstack = true;
                self.visit_expr(context)?;
                if let Some(target) = target {
                    self.new_tmpname();
                    self.visit_target(target)?;
                }
                self.visit_body(body)?;
            }
            StmtKind::Raise {
                exc,
                value,
                traceback,
            } => {
                for e in [exc, value, traceback].into_iter().flatten() {
                    self.visit_expr(e)?;
                }
            }
            StmtKind::TryExcept {
                body,
                handlers,
                orelse,
            } => {
                self.cur().blockstack = true;
                self.visit_body(body)?;
                for h in handlers {
                    if let Some(typ) = &h.typ {
                        self.visit_expr(typ)?;
                    }
                    if let Some(name) = &h.name {
                        self.visit_target(name)?;
                    }
                    self.visit_body(&h.body)?;
                }
                self.visit_body(orelse)?;
            }
            StmtKind::TryFinally { body, finalbody } => {
                self.cur().blockstack = true;
                self.visit_body(body)?;
                self.visit_body(finalbody)?;
            }
            StmtKind::Assert { test, msg } => {
                self.visit_expr(test)?;
                if let Some(msg) = msg {
                    self.visit_expr(msg)?;
                }
            }
            StmtKind::Exec {
                body,
                globals,
                locals,
            } => {
                self.cur().unoptimized = true;
                self.visit_expr(body)?;
                for e in [globals, locals].into_iter().flatten() {
                    self.visit_expr(e)?;
                }
            }
            StmtKind::Global(names) => {
                for name in names {
                    self.add(name, SymbolFlags::DEF_GLOBAL);
                }
            }
            StmtKind::Expr(value) => self.visit_expr(value)?,
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
        }
        Ok(())
    }

    /// Visit an assignment or deletion target.
    fn visit_target(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(id) => {
                self.add(id, SymbolFlags::DEF_LOCAL);
                Ok(())
            }
            ExprKind::Tuple(elts) | ExprKind::List(elts) => {
                elts.iter().try_for_each(|e| self.visit_target(e))
            }
            _ => self.visit_expr(target),
        }
    }

    fn visit_slice(&mut self, slice: &Slice) -> CompileResult<()> {
        match slice {
            Slice::Index(e) => self.visit_expr(e),
            Slice::Slice { lower, upper, step } => [lower, upper, step]
                .into_iter()
                .flatten()
                .try_for_each(|e| self.visit_expr(e)),
        }
    }

    fn visit_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::BoolOp { values, .. } => values.iter().try_for_each(|e| self.visit_expr(e))?,
            ExprKind::BinOp { left, right, .. } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
            }
            ExprKind::UnaryOp { operand, .. } => self.visit_expr(operand)?,
            ExprKind::Lambda { args, body } => {
                for d in &args.defaults {
                    self.visit_expr(d)?;
                }
                self.enter(expr, ScopeKind::Lambda, "<lambda>", expr.line);
                self.params(args);
                self.visit_expr(body)?;
                self.exit();
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_expr(body)?;
                self.visit_expr(orelse)?;
            }
            ExprKind::Dict { keys, values } => {
                for (k, v) in keys.iter().zip(values) {
                    self.visit_expr(v)?;
                    self.visit_expr(k)?;
                }
            }
            ExprKind::ListComp { elt, generators } => {
                self.visit_comprehension(expr, ScopeKind::ListComp, "<listcomp>", elt, generators)?;
            }
            ExprKind::GeneratorExp { elt, generators } => {
                self.visit_comprehension(expr, ScopeKind::GeneratorExp, "<genexpr>", elt, generators)?;
            }
            ExprKind::Yield(value) => {
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
                let line = if expr.line > 0 { expr.line } else { self.line };
                let scope = self.cur();
                if !scope.kind.is_function() {
                    return Err(CompileError::syntax("'yield' outside function", line));
                }
                scope.generator = true;
            }
            ExprKind::Compare {
                left, comparators, ..
            } => {
                self.visit_expr(left)?;
                comparators.iter().try_for_each(|e| self.visit_expr(e))?;
            }
            ExprKind::Call {
                func,
                args,
                keywords,
                starargs,
                kwargs,
            } => {
                self.visit_expr(func)?;
                args.iter().try_for_each(|e| self.visit_expr(e))?;
                keywords.iter().try_for_each(|k| self.visit_expr(&k.value))?;
                for e in [starargs, kwargs].into_iter().flatten() {
                    self.visit_expr(e)?;
                }
            }
            ExprKind::Constant(_) => {}
            ExprKind::Attribute { value, .. } => self.visit_expr(value)?,
            ExprKind::Subscript { value, slice } => {
                self.visit_expr(value)?;
                self.visit_slice(slice)?;
            }
            ExprKind::Name(id) => self.add(id, SymbolFlags::USE),
            ExprKind::List(elts) | ExprKind::Tuple(elts) => {
                elts.iter().try_for_each(|e| self.visit_expr(e))?;
            }
        }
        Ok(())
    }

    fn visit_comprehension(
        &mut self,
        node: &Expr,
        kind: ScopeKind,
        name: &str,
        elt: &Expr,
        generators: &[Comprehension],
    ) -> CompileResult<()> {
        let Some((outermost, inner)) = generators.split_first() else {
            return Err(CompileError::syntax("comprehension without a 'for' clause", node.line));
        };
        // The outermost iterable is evaluated in the enclosing scope.
        self.visit_expr(&outermost.iter)?;
        self.enter(node, kind, name, node.line);
        self.cur().add(".0", SymbolFlags::DEF_PARAM);
        self.cur().params.push(Arc::from(".0"));
        if kind == ScopeKind::ListComp {
            self.new_tmpname();
        }
        self.visit_target(&outermost.target)?;
        outermost.ifs.iter().try_for_each(|e| self.visit_expr(e))?;
        for generator in inner {
            self.visit_expr(&generator.iter)?;
            self.visit_target(&generator.target)?;
            generator.ifs.iter().try_for_each(|e| self.visit_expr(e))?;
        }
        self.visit_expr(elt)?;
        self.exit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_core::ast::{Arguments, FunctionDef};

    fn def(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
        Stmt::def(name, params, body)
    }

    fn child(table: &SymbolTable, parent: ScopeId, idx: usize) -> ScopeId {
        table.scope(parent).children[idx]
    }

    // -------------------------------------------------------------------------
    // Basic Classification
    // -------------------------------------------------------------------------

    #[test]
    fn test_module_names_are_implicit_globals() {
        let m = Module::new(vec![Stmt::assign(Expr::name("x"), Expr::name("y"))]);
        let t = SymbolTable::build(&m).unwrap();
        let root = t.scope(t.root());
        assert_eq!(root.lookup("x"), Some(SymbolScope::Local));
        assert_eq!(root.lookup("y"), Some(SymbolScope::GlobalImplicit));
    }

    #[test]
    fn test_function_params_and_locals() {
        let m = Module::new(vec![def(
            "f",
            &["a"],
            vec![
                Stmt::assign(Expr::name("b"), Expr::name("a")),
                Stmt::ret(Some(Expr::name("g"))),
            ],
        )]);
        let t = SymbolTable::build(&m).unwrap();
        let f = t.scope(child(&t, t.root(), 0));
        assert_eq!(f.kind, ScopeKind::Function);
        assert_eq!(f.params, vec![Arc::from("a")]);
        assert_eq!(f.lookup("a"), Some(SymbolScope::Local));
        assert_eq!(f.lookup("b"), Some(SymbolScope::Local));
        assert_eq!(f.lookup("g"), Some(SymbolScope::GlobalImplicit));
        assert!(!f.nested);
    }

    #[test]
    fn test_explicit_global() {
        let m = Module::new(vec![def(
            "f",
            &[],
            vec![
                Stmt::new(StmtKind::Global(vec!["x".into()])),
                Stmt::assign(Expr::name("x"), Expr::int(1)),
            ],
        )]);
        let t = SymbolTable::build(&m).unwrap();
        let f = t.scope(child(&t, t.root(), 0));
        assert_eq!(f.lookup("x"), Some(SymbolScope::GlobalExplicit));
    }

    // -------------------------------------------------------------------------
    // Closures
    // -------------------------------------------------------------------------

    #[test]
    fn test_cell_and_free() {
        let inner = def("inner", &[], vec![Stmt::ret(Some(Expr::name("x")))]);
        let m = Module::new(vec![def(
            "outer",
            &[],
            vec![Stmt::assign(Expr::name("x"), Expr::int(1)), inner],
        )]);
        let t = SymbolTable::build(&m).unwrap();
        let outer_id = child(&t, t.root(), 0);
        let inner_id = child(&t, outer_id, 0);
        assert_eq!(t.scope(outer_id).lookup("x"), Some(SymbolScope::Cell));
        assert_eq!(t.scope(outer_id).cellvars(), vec![Arc::from("x")]);
        assert_eq!(t.scope(inner_id).lookup("x"), Some(SymbolScope::Free));
        assert_eq!(t.scope(inner_id).freevars(), vec![Arc::from("x")]);
        assert!(t.scope(inner_id).nested);
    }

    #[test]
    fn test_free_passes_through_middle_scope() {
        let innermost = def("c", &[], vec![Stmt::ret(Some(Expr::name("x")))]);
        let middle = def("b", &[], vec![innermost]);
        let m = Module::new(vec![def(
            "a",
            &["x"],
            vec![middle],
        )]);
        let t = SymbolTable::build(&m).unwrap();
        let a = child(&t, t.root(), 0);
        let b = child(&t, a, 0);
        let c = child(&t, b, 0);
        assert_eq!(t.scope(a).lookup("x"), Some(SymbolScope::Cell));
        assert_eq!(t.scope(b).lookup("x"), Some(SymbolScope::Free));
        assert_eq!(t.scope(c).lookup("x"), Some(SymbolScope::Free));
    }

    #[test]
    fn test_class_body_not_visible_to_methods() {
        let method = def("m", &["self"], vec![Stmt::ret(Some(Expr::name("attr")))]);
        let class = Stmt::new(StmtKind::ClassDef(Box::new(kite_core::ast::ClassDef {
            name: "C".into(),
            bases: vec![],
            body: vec![Stmt::assign(Expr::name("attr"), Expr::int(1)), method],
            decorators: vec![],
        })));
        let t = SymbolTable::build(&Module::new(vec![class])).unwrap();
        let c = child(&t, t.root(), 0);
        let m = child(&t, c, 0);
        assert_eq!(t.scope(c).lookup("attr"), Some(SymbolScope::Local));
        assert_eq!(t.scope(m).lookup("attr"), Some(SymbolScope::GlobalImplicit));
    }

    #[test]
    fn test_class_passes_through_free_variable() {
        let method = def("m", &["self"], vec![Stmt::ret(Some(Expr::name("x")))]);
        let class = Stmt::new(StmtKind::ClassDef(Box::new(kite_core::ast::ClassDef {
            name: "C".into(),
            bases: vec![],
            body: vec![Stmt::assign(Expr::name("x"), Expr::int(2)), method],
            decorators: vec![],
        })));
        let m = Module::new(vec![def(
            "f",
            &["x"],
            vec![class],
        )]);
        let t = SymbolTable::build(&m).unwrap();
        let f = child(&t, t.root(), 0);
        let c = child(&t, f, 0);
        assert_eq!(t.scope(f).lookup("x"), Some(SymbolScope::Cell));
        assert_eq!(t.scope(c).lookup("x"), Some(SymbolScope::Local));
        assert_eq!(t.scope(c).freevars(), vec![Arc::from("x")]);
    }

    // -------------------------------------------------------------------------
    // Comprehensions, Generators, Flags
    // -------------------------------------------------------------------------

    #[test]
    fn test_genexp_scope() {
        let genexp = Expr::new(ExprKind::GeneratorExp {
            elt: Box::new(Expr::name("i")),
            generators: vec![Comprehension {
                target: Expr::name("i"),
                iter: Expr::name("seq"),
                ifs: vec![],
            }],
        });
        let m = Module::new(vec![Stmt::expr(genexp)]);
        let t = SymbolTable::build(&m).unwrap();
        let g = t.scope(child(&t, t.root(), 0));
        assert_eq!(g.kind, ScopeKind::GeneratorExp);
        assert!(g.generator);
        assert_eq!(g.params, vec![Arc::from(".0")]);
        assert_eq!(g.lookup("i"), Some(SymbolScope::Local));
        assert_eq!(g.lookup("seq"), None);
        assert_eq!(t.scope(t.root()).lookup("seq"), Some(SymbolScope::GlobalImplicit));
    }

    #[test]
    fn test_listcomp_declares_tmpname() {
        let lc = Expr::new(ExprKind::ListComp {
            elt: Box::new(Expr::name("i")),
            generators: vec![Comprehension {
                target: Expr::name("i"),
                iter: Expr::name("seq"),
                ifs: vec![],
            }],
        });
        let t = SymbolTable::build(&Module::new(vec![Stmt::expr(lc)])).unwrap();
        let l = t.scope(child(&t, t.root(), 0));
        assert_eq!(l.lookup("_[1]"), Some(SymbolScope::Local));
    }

    #[test]
    fn test_yield_outside_function() {
        let m = Module::new(vec![Stmt::expr(Expr::new(ExprKind::Yield(None))).at(4)]);
        let err = SymbolTable::build(&m).unwrap_err();
        assert_eq!(err, CompileError::syntax("'yield' outside function", 4));
    }

    #[test]
    fn test_function_flags() {
        let body = vec![
            Stmt::expr(Expr::new(ExprKind::Yield(Some(Box::new(Expr::int(1)))))),
            Stmt::new(StmtKind::TryFinally {
                body: vec![Stmt::pass()],
                finalbody: vec![Stmt::pass()],
            }),
        ];
        let f = Stmt::new(StmtKind::FunctionDef(Box::new(FunctionDef {
            name: "f".into(),
            args: Arguments {
                args: vec!["a".into()],
                vararg: Some("rest".into()),
                kwarg: Some("kw".into()),
                defaults: vec![],
            },
            body,
            decorators: vec![],
        })));
        let t = SymbolTable::build(&Module::new(vec![f])).unwrap();
        let s = t.scope(child(&t, t.root(), 0));
        assert!(s.generator && s.varargs && s.varkeywords && s.blockstack);
        assert_eq!(s.params.len(), 3);
    }

    #[test]
    fn test_lookup_by_node() {
        let m = Module::new(vec![def("f", &[], vec![Stmt::pass()])]);
        let t = SymbolTable::build(&m).unwrap();
        let StmtKind::FunctionDef(f) = &m.body[0].kind else {
            unreachable!()
        };
        let id = t.lookup(ScopeKey::of(&**f)).unwrap();
        assert_eq!(&*t.scope(id).name, "f");
        assert_eq!(t.lookup(ScopeKey::of(&m)), Some(t.root()));
    }
}
