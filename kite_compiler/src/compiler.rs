//! AST to stack bytecode compiler.
//!
//! The compiler works in two phases:
//!
//! 1. **Scope analysis**: [`SymbolTable::build`] classifies every name.
//! 2. **Code generation**: one [`CompilationUnit`] per scope, filled by a
//!    visitor over statements and expressions, then assembled.
//!
//! Statement compilation lives here; expressions, functions and exception
//! handling are split into sibling modules that extend [`Compiler`].

use crate::bytecode::assembler::assemble;
use crate::bytecode::code::{CodeFlags, CompiledCode, Constant};
use crate::bytecode::opcode::Opcode;
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::symtable::{ScopeKey, SymbolScope, SymbolTable};
use crate::unit::{CompilationUnit, FrameBlockKind};
use kite_core::ast::{Expr, ExprKind, Literal, Module, Stmt, StmtKind};
use std::sync::Arc;
use tracing::{debug, trace};

/// How a name is being accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NameCtx {
    Load,
    Store,
    Delete,
}

// =============================================================================
// Compiler
// =============================================================================

/// Bytecode compiler for one module.
pub struct Compiler<'a> {
    pub(crate) config: &'a CompilerConfig,
    pub(crate) symtable: SymbolTable,
    /// Unit being compiled.
    pub(crate) unit: CompilationUnit,
    /// Enclosing units, outermost first.
    stack: Vec<CompilationUnit>,
}

impl<'a> Compiler<'a> {
    /// Compile a module to its code object.
    pub fn compile_module(
        module: &Module,
        config: &'a CompilerConfig,
    ) -> CompileResult<Arc<CompiledCode>> {
        let symtable = SymbolTable::build(module)?;
        let root = symtable.root();
        debug!(scopes = symtable.len(), filename = %config.filename, "scope analysis done");

        let unit = CompilationUnit::new(
            root,
            symtable.scope(root),
            0,
            config.limits.max_nested_blocks,
        );
        let mut compiler = Compiler {
            config,
            symtable,
            unit,
            stack: Vec::new(),
        };
        compiler.unit.graph.next_block();
        compiler.compile_body(&module.body)?;
        let code = assemble(compiler.unit, &config.filename, &config.limits)?;
        Ok(Arc::new(code))
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    /// Push a unit for the scope opened by `node`.
    pub(crate) fn enter_scope<T>(&mut self, node: &T, first_line: u32) -> CompileResult<()> {
        let id = self
            .symtable
            .lookup(ScopeKey::of(node))
            .ok_or_else(|| CompileError::internal("no scope recorded for node"))?;
        let scope = self.symtable.scope(id);
        if scope.generator {
            if let Some(line) = scope.return_with_value {
                return Err(CompileError::syntax(
                    "'return' with argument inside generator",
                    line,
                ));
            }
        }
        let unit = CompilationUnit::new(
            id,
            scope,
            first_line,
            self.config.limits.max_nested_blocks,
        );
        trace!(name = %unit.name, depth = self.stack.len() + 1, "enter scope");
        let parent = std::mem::replace(&mut self.unit, unit);
        self.stack.push(parent);
        self.unit.graph.next_block();
        Ok(())
    }

    /// Pop and assemble the current unit.
    pub(crate) fn exit_scope(&mut self) -> CompileResult<Arc<CompiledCode>> {
        let parent = self
            .stack
            .pop()
            .ok_or_else(|| CompileError::internal("exit_scope at module level"))?;
        let unit = std::mem::replace(&mut self.unit, parent);
        let code = assemble(unit, &self.config.filename, &self.config.limits)?;
        Ok(Arc::new(code))
    }

    /// Module or class body: stores a leading docstring in `__doc__`.
    pub(crate) fn compile_body(&mut self, body: &[Stmt]) -> CompileResult<()> {
        let rest = match docstring(body) {
            Some(doc) if !self.config.optimize => {
                self.unit.set_line(body[0].line);
                self.unit.emit_const(Constant::Str(Arc::from(doc)))?;
                self.nameop("__doc__", NameCtx::Store)?;
                &body[1..]
            }
            _ => body,
        };
        self.visit_stmts(rest)
    }

    // =========================================================================
    // Names
    // =========================================================================

    /// Emit the load, store or delete of `name` appropriate to its scope.
    pub(crate) fn nameop(&mut self, name: &str, ctx: NameCtx) -> CompileResult<()> {
        if ctx != NameCtx::Load && name == "__debug__" {
            return Err(CompileError::syntax(
                "can not assign to __debug__",
                self.unit.line(),
            ));
        }

        let scope = self.symtable.scope(self.unit.scope).lookup(name);
        let is_function = self.unit.kind.is_function();
        let optimized = self.unit.flags.contains(CodeFlags::OPTIMIZED);

        match scope {
            Some(SymbolScope::Free) | Some(SymbolScope::Cell) => {
                let arg = self.deref_index(name, scope == Some(SymbolScope::Cell))?;
                let op = match ctx {
                    NameCtx::Load => Opcode::LoadDeref,
                    NameCtx::Store => Opcode::StoreDeref,
                    NameCtx::Delete => {
                        return Err(CompileError::syntax(
                            format!("can not delete variable '{name}' referenced in nested scope"),
                            self.unit.line(),
                        ));
                    }
                };
                self.unit.emit_arg(op, arg)
            }
            Some(SymbolScope::Local) if is_function => {
                let arg = self.unit.varnames.add(name);
                let op = match ctx {
                    NameCtx::Load => Opcode::LoadFast,
                    NameCtx::Store => Opcode::StoreFast,
                    NameCtx::Delete => Opcode::DeleteFast,
                };
                self.unit.emit_arg(op, arg)
            }
            Some(SymbolScope::GlobalExplicit) => self.global_op(name, ctx),
            Some(SymbolScope::GlobalImplicit) if is_function && optimized => {
                self.global_op(name, ctx)
            }
            _ => {
                let arg = self.unit.names.add(name);
                let op = match ctx {
                    NameCtx::Load => Opcode::LoadName,
                    NameCtx::Store => Opcode::StoreName,
                    NameCtx::Delete => Opcode::DeleteName,
                };
                self.unit.emit_arg(op, arg)
            }
        }
    }

    fn global_op(&mut self, name: &str, ctx: NameCtx) -> CompileResult<()> {
        let arg = self.unit.names.add(name);
        let op = match ctx {
            NameCtx::Load => Opcode::LoadGlobal,
            NameCtx::Store => Opcode::StoreGlobal,
            NameCtx::Delete => Opcode::DeleteGlobal,
        };
        self.unit.emit_arg(op, arg)
    }

    /// `LOAD_GLOBAL` of a runtime helper or builtin.
    pub(crate) fn load_global(&mut self, name: &str) -> CompileResult<()> {
        self.global_op(name, NameCtx::Load)
    }

    /// Slot of a cell or free variable; free slots follow the cells.
    pub(crate) fn deref_index(&self, name: &str, is_cell: bool) -> CompileResult<u32> {
        let found = if is_cell {
            self.unit.cellvars.get(name)
        } else {
            self.unit
                .freevars
                .get(name)
                .map(|i| i + self.unit.cellvars.len() as u32)
        };
        found.ok_or_else(|| {
            CompileError::internal(format!("'{name}' missing from closure tables of {}", self.unit.name))
        })
    }

    // =========================================================================
    // Statements
    // =========================================================================

    pub(crate) fn visit_stmts(&mut self, body: &[Stmt]) -> CompileResult<()> {
        body.iter().try_for_each(|s| self.visit_stmt(s))
    }

    pub(crate) fn visit_stmt(&mut self, s: &Stmt) -> CompileResult<()> {
        self.unit.set_line(s.line);
        match &s.kind {
            StmtKind::FunctionDef(def) => self.compile_function(def, s.line),
            StmtKind::ClassDef(class) => self.compile_class(class, s.line),
            StmtKind::Return(value) => {
                if !self.unit.kind.is_function() {
                    return Err(CompileError::syntax("'return' outside function", s.line));
                }
                match value {
                    Some(v) => self.visit_expr(v)?,
                    None => self.unit.emit_const(Constant::None)?,
                }
                self.unit.emit(Opcode::ReturnValue)
            }
            StmtKind::Delete(targets) => targets.iter().try_for_each(|t| self.visit_delete(t)),
            StmtKind::Assign { targets, value } => {
                self.visit_expr(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.unit.emit(Opcode::DupTop)?;
                    }
                    self.visit_store(target)?;
                }
                Ok(())
            }
            StmtKind::AugAssign { target, op, value } => self.compile_augassign(target, *op, value),
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => self.compile_for(target, iter, body, orelse),
            StmtKind::While { test, body, orelse } => self.compile_while(test, body, orelse),
            StmtKind::If { test, body, orelse } => self.compile_if(test, body, orelse),
            StmtKind::With {
                context,
                target,
                body,
            } => self.compile_with(context, target.as_ref(), body),
            StmtKind::Raise {
                exc,
                value,
                traceback,
            } => self.compile_raise(exc.as_ref(), value.as_ref(), traceback.as_ref()),
            StmtKind::TryExcept {
                body,
                handlers,
                orelse,
            } => self.compile_try_except(body, handlers, orelse),
            StmtKind::TryFinally { body, finalbody } => self.compile_try_finally(body, finalbody),
            StmtKind::Assert { test, msg } => self.compile_assert(test, msg.as_ref()),
            StmtKind::Exec {
                body,
                globals,
                locals,
            } => self.compile_exec(body, globals.as_ref(), locals.as_ref()),
            StmtKind::Global(_) | StmtKind::Pass => Ok(()),
            StmtKind::Expr(value) => {
                if matches!(value.kind, ExprKind::Constant(_)) {
                    return Ok(());
                }
                self.visit_expr(value)?;
                self.unit.emit(Opcode::PopTop)
            }
            StmtKind::Break => self.compile_break(s.line),
            StmtKind::Continue => self.compile_continue(s.line),
        }
    }

    // =========================================================================
    // Control Flow
    // =========================================================================

    fn compile_if(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CompileResult<()> {
        let end = self.unit.graph.new_block();
        match self.expr_constant(test) {
            Some(false) => self.visit_stmts(orelse)?,
            Some(true) => self.visit_stmts(body)?,
            None => {
                let next = if orelse.is_empty() {
                    end
                } else {
                    self.unit.graph.new_block()
                };
                self.visit_expr(test)?;
                self.unit.emit_jump(Opcode::PopJumpIfFalse, next)?;
                self.visit_stmts(body)?;
                self.unit.emit_jump(Opcode::JumpForward, end)?;
                if !orelse.is_empty() {
                    self.unit.graph.use_block(next);
                    self.visit_stmts(orelse)?;
                }
            }
        }
        self.unit.graph.use_block(end);
        Ok(())
    }

    fn compile_while(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CompileResult<()> {
        let constant = self.expr_constant(test);
        if constant == Some(false) {
            return self.visit_stmts(orelse);
        }

        let blockstack = self.unit.has_blockstack();
        let lp = self.unit.graph.new_block();
        let end = self.unit.graph.new_block();
        let anchor = if constant.is_none() {
            Some(self.unit.graph.new_block())
        } else {
            None
        };

        if blockstack {
            self.unit.emit_jump(Opcode::SetupLoop, end)?;
        }
        self.unit.graph.use_block(lp);
        self.unit
            .push_fblock(FrameBlockKind::WhileLoop, lp, Some(end))?;
        if let Some(anchor) = anchor {
            self.visit_expr(test)?;
            self.unit.emit_jump(Opcode::PopJumpIfFalse, anchor)?;
        }
        self.visit_stmts(body)?;
        self.unit.emit_jump(Opcode::JumpAbsolute, lp)?;

        if let Some(anchor) = anchor {
            self.unit.graph.use_block(anchor);
            if blockstack {
                self.unit.emit(Opcode::PopBlock)?;
            }
        }
        self.unit.pop_fblock(FrameBlockKind::WhileLoop)?;
        if !orelse.is_empty() {
            let block = self.unit.graph.new_block();
            self.unit.graph.use_block(block);
            self.visit_stmts(orelse)?;
        }
        self.unit.graph.use_block(end);
        Ok(())
    }

    fn compile_for(
        &mut self,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> CompileResult<()> {
        let blockstack = self.unit.has_blockstack();
        let start = self.unit.graph.new_block();
        let cleanup = self.unit.graph.new_block();
        let end = self.unit.graph.new_block();

        if blockstack {
            self.unit.emit_jump(Opcode::SetupLoop, end)?;
        }
        self.unit
            .push_fblock(FrameBlockKind::ForLoop, start, Some(end))?;
        self.visit_expr(iter)?;
        self.unit.emit(Opcode::GetIter)?;
        self.unit.graph.use_block(start);
        self.unit.emit_jump(Opcode::ForIter, cleanup)?;
        self.visit_store(target)?;
        self.visit_stmts(body)?;
        self.unit.emit_jump(Opcode::JumpAbsolute, start)?;
        self.unit.graph.use_block(cleanup);
        if blockstack {
            self.unit.emit(Opcode::PopBlock)?;
        }
        self.unit.pop_fblock(FrameBlockKind::ForLoop)?;
        self.visit_stmts(orelse)?;
        self.unit.graph.use_block(end);
        Ok(())
    }

    fn compile_break(&mut self, line: u32) -> CompileResult<()> {
        if !self.unit.in_loop() {
            return Err(CompileError::syntax("'break' outside loop", line));
        }
        if self.unit.has_blockstack() {
            return self.unit.emit(Opcode::BreakLoop);
        }
        let top = self
            .unit
            .fblocks()
            .last()
            .copied()
            .filter(|fb| fb.kind.is_loop())
            .ok_or_else(|| CompileError::internal("break without block stack crosses a handler"))?;
        if top.kind == FrameBlockKind::ForLoop {
            self.unit.emit(Opcode::PopTop)?;
        }
        let exit = top
            .exit
            .ok_or_else(|| CompileError::internal("loop frame block without exit"))?;
        self.unit.emit_jump(Opcode::JumpAbsolute, exit)
    }

    fn compile_continue(&mut self, line: u32) -> CompileResult<()> {
        const NOT_IN_LOOP: &str = "'continue' not properly in loop";
        const IN_FINALLY: &str = "'continue' not supported inside 'finally' clause";

        let fblocks = self.unit.fblocks();
        let Some(top) = fblocks.last().copied() else {
            return Err(CompileError::syntax(NOT_IN_LOOP, line));
        };
        match top.kind {
            FrameBlockKind::WhileLoop | FrameBlockKind::ForLoop => {
                self.unit.emit_jump(Opcode::JumpAbsolute, top.block)
            }
            FrameBlockKind::Except | FrameBlockKind::FinallyTry => {
                let mut target = None;
                for fb in fblocks.iter().rev().skip(1) {
                    if fb.kind.is_loop() {
                        target = Some(fb.block);
                        break;
                    }
                    if fb.kind == FrameBlockKind::FinallyEnd {
                        return Err(CompileError::syntax(IN_FINALLY, line));
                    }
                }
                let target = target.ok_or_else(|| CompileError::syntax(NOT_IN_LOOP, line))?;
                self.unit.emit_jump(Opcode::ContinueLoop, target)
            }
            FrameBlockKind::FinallyEnd => Err(CompileError::syntax(IN_FINALLY, line)),
        }
    }

    /// Truth value of `e` when it is known at compile time.
    pub(crate) fn expr_constant(&self, e: &Expr) -> Option<bool> {
        match &e.kind {
            ExprKind::Constant(lit) => Some(match lit {
                Literal::None => false,
                Literal::Bool(b) => *b,
                Literal::Int(i) => *i != 0,
                Literal::Float(f) => *f != 0.0,
                Literal::Str(s) => !s.is_empty(),
            }),
            ExprKind::Name(name) if name == "__debug__" => Some(!self.config.optimize),
            _ => None,
        }
    }
}

/// Leading string-literal statement of a body.
pub(crate) fn docstring(body: &[Stmt]) -> Option<&str> {
    match body.first().map(|s| &s.kind) {
        Some(StmtKind::Expr(Expr {
            kind: ExprKind::Constant(Literal::Str(doc)),
            ..
        })) => Some(doc),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::decode;
    use kite_core::ast::{BoolOp, CmpOp};

    fn compile(body: Vec<Stmt>) -> Arc<CompiledCode> {
        Compiler::compile_module(&Module::new(body), &CompilerConfig::default()).unwrap()
    }

    fn compile_err(body: Vec<Stmt>) -> CompileError {
        Compiler::compile_module(&Module::new(body), &CompilerConfig::default()).unwrap_err()
    }

    fn ops(code: &CompiledCode) -> Vec<Opcode> {
        decode(&code.bytecode).map(|d| d.unwrap().opcode).collect()
    }

    fn first_function(code: &CompiledCode) -> Arc<CompiledCode> {
        code.nested().next().unwrap().clone()
    }

    // -------------------------------------------------------------------------
    // Names
    // -------------------------------------------------------------------------

    #[test]
    fn test_module_assignment_uses_name_ops() {
        let code = compile(vec![Stmt::assign(Expr::name("x"), Expr::int(1))]);
        assert_eq!(
            ops(&code),
            vec![
                Opcode::LoadConst,
                Opcode::StoreName,
                Opcode::LoadConst,
                Opcode::ReturnValue
            ]
        );
        assert_eq!(&*code.names[0], "x");
    }

    #[test]
    fn test_function_locals_and_globals() {
        let code = compile(vec![Stmt::def(
            "f",
            &["a"],
            vec![
                Stmt::assign(Expr::name("b"), Expr::name("a").add(Expr::name("g"))),
                Stmt::ret(Some(Expr::name("b"))),
            ],
        )]);
        let f = first_function(&code);
        assert_eq!(
            ops(&f),
            vec![
                Opcode::LoadFast,
                Opcode::LoadGlobal,
                Opcode::BinaryAdd,
                Opcode::StoreFast,
                Opcode::LoadFast,
                Opcode::ReturnValue
            ]
        );
        assert_eq!(f.argcount, 1);
        assert_eq!(f.varnames.len(), 2);
        assert!(f.flags.contains(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS | CodeFlags::NOFREE));
    }

    #[test]
    fn test_chained_assignment_dups() {
        let code = compile(vec![Stmt::new(StmtKind::Assign {
            targets: vec![Expr::name("a"), Expr::name("b")],
            value: Expr::int(0),
        })]);
        assert_eq!(
            &ops(&code)[..4],
            &[Opcode::LoadConst, Opcode::DupTop, Opcode::StoreName, Opcode::StoreName]
        );
    }

    #[test]
    fn test_assign_to_debug_rejected() {
        let err = compile_err(vec![Stmt::assign(Expr::name("__debug__"), Expr::int(1)).at(2)]);
        assert_eq!(err, CompileError::syntax("can not assign to __debug__", 2));
    }

    #[test]
    fn test_docstring_stored_in_module() {
        let code = compile(vec![Stmt::expr(Expr::str("doc")).at(1)]);
        assert_eq!(ops(&code)[..2], [Opcode::LoadConst, Opcode::StoreName]);
        assert_eq!(&*code.names[0], "__doc__");

        let config = CompilerConfig::optimized();
        let stripped = Compiler::compile_module(
            &Module::new(vec![Stmt::expr(Expr::str("doc"))]),
            &config,
        )
        .unwrap();
        assert_eq!(ops(&stripped), vec![Opcode::LoadConst, Opcode::ReturnValue]);
    }

    // -------------------------------------------------------------------------
    // Control Flow
    // -------------------------------------------------------------------------

    #[test]
    fn test_constant_if_drops_dead_branch() {
        let code = compile(vec![Stmt::if_(
            Expr::bool(false),
            vec![Stmt::expr(Expr::name("dead").call(vec![]))],
            vec![Stmt::expr(Expr::name("live").call(vec![]))],
        )]);
        assert!(code.names.iter().any(|n| &**n == "live"));
        assert!(!code.names.iter().any(|n| &**n == "dead"));
    }

    #[test]
    fn test_constant_tests_emit_no_dead_code() {
        let call = |name: &str| Stmt::expr(Expr::name(name).call(vec![]));

        // if 0: x()
        let code = compile(vec![Stmt::if_(Expr::int(0), vec![call("x")], vec![])]);
        assert_eq!(ops(&code), vec![Opcode::LoadConst, Opcode::ReturnValue]);
        assert!(code.names.is_empty());

        // while 0: x()
        let code = compile(vec![Stmt::while_(Expr::int(0), vec![call("x")])]);
        assert_eq!(ops(&code), vec![Opcode::LoadConst, Opcode::ReturnValue]);
        assert!(code.names.is_empty());

        // if 1: a = 1
        // else: x()
        let code = compile(vec![Stmt::if_(
            Expr::int(1),
            vec![Stmt::assign(Expr::name("a"), Expr::int(1))],
            vec![call("x")],
        )]);
        assert_eq!(
            ops(&code),
            vec![
                Opcode::LoadConst,
                Opcode::StoreName,
                Opcode::LoadConst,
                Opcode::ReturnValue
            ]
        );
        assert_eq!(code.names.iter().map(|n| &**n).collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_if_else_shape() {
        let code = compile(vec![Stmt::if_(
            Expr::name("c"),
            vec![Stmt::assign(Expr::name("x"), Expr::int(1))],
            vec![Stmt::assign(Expr::name("x"), Expr::int(2))],
        )]);
        assert_eq!(
            ops(&code),
            vec![
                Opcode::LoadName,
                Opcode::PopJumpIfFalse,
                Opcode::LoadConst,
                Opcode::StoreName,
                Opcode::JumpForward,
                Opcode::LoadConst,
                Opcode::StoreName,
                Opcode::LoadConst,
                Opcode::ReturnValue
            ]
        );
    }

    #[test]
    fn test_while_without_blockstack_has_no_setup_loop() {
        let code = compile(vec![Stmt::while_(
            Expr::name("c"),
            vec![Stmt::new(StmtKind::Break)],
        )]);
        let ops = ops(&code);
        assert!(!ops.contains(&Opcode::SetupLoop));
        assert!(!ops.contains(&Opcode::BreakLoop));
        assert!(!code.flags.contains(CodeFlags::BLOCKSTACK));
    }

    #[test]
    fn test_break_in_for_pops_iterator() {
        let code = compile(vec![Stmt::for_(
            Expr::name("i"),
            Expr::name("seq"),
            vec![Stmt::new(StmtKind::Break)],
        )]);
        let ops = ops(&code);
        let pos = ops.iter().position(|o| *o == Opcode::StoreName).unwrap();
        assert_eq!(ops[pos + 1], Opcode::PopTop);
        assert_eq!(ops[pos + 2], Opcode::JumpAbsolute);
        assert_eq!(code.max_stack_depth, 2);
    }

    #[test]
    fn test_break_with_blockstack_uses_break_loop() {
        let code = compile(vec![
            Stmt::new(StmtKind::TryFinally {
                body: vec![Stmt::pass()],
                finalbody: vec![Stmt::pass()],
            }),
            Stmt::while_(Expr::name("c"), vec![Stmt::new(StmtKind::Break)]),
        ]);
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::SetupLoop));
        assert!(ops.contains(&Opcode::BreakLoop));
        assert!(ops.contains(&Opcode::PopBlock));
        assert!(code.flags.contains(CodeFlags::BLOCKSTACK));
    }

    #[test]
    fn test_loop_errors() {
        assert_eq!(
            compile_err(vec![Stmt::new(StmtKind::Break).at(3)]),
            CompileError::syntax("'break' outside loop", 3)
        );
        assert_eq!(
            compile_err(vec![Stmt::new(StmtKind::Continue).at(4)]),
            CompileError::syntax("'continue' not properly in loop", 4)
        );
        let in_finally = Stmt::while_(
            Expr::name("c"),
            vec![Stmt::new(StmtKind::TryFinally {
                body: vec![Stmt::pass()],
                finalbody: vec![Stmt::new(StmtKind::Continue).at(7)],
            })],
        );
        assert_eq!(
            compile_err(vec![in_finally]),
            CompileError::syntax("'continue' not supported inside 'finally' clause", 7)
        );
    }

    #[test]
    fn test_continue_in_try_uses_continue_loop() {
        let code = compile(vec![Stmt::while_(
            Expr::name("c"),
            vec![Stmt::new(StmtKind::TryFinally {
                body: vec![Stmt::new(StmtKind::Continue)],
                finalbody: vec![Stmt::pass()],
            })],
        )]);
        assert!(ops(&code).contains(&Opcode::ContinueLoop));
    }

    #[test]
    fn test_return_outside_function() {
        assert_eq!(
            compile_err(vec![Stmt::ret(None).at(9)]),
            CompileError::syntax("'return' outside function", 9)
        );
    }

    #[test]
    fn test_return_value_in_generator() {
        let body = vec![
            Stmt::expr(Expr::new(ExprKind::Yield(None))),
            Stmt::ret(Some(Expr::int(1))).at(5),
        ];
        assert_eq!(
            compile_err(vec![Stmt::def("g", &[], body)]),
            CompileError::syntax("'return' with argument inside generator", 5)
        );
    }

    #[test]
    fn test_too_many_nested_blocks() {
        let mut stmt = Stmt::pass();
        for _ in 0..21 {
            stmt = Stmt::while_(Expr::name("c"), vec![stmt]);
        }
        let err = compile_err(vec![stmt]);
        assert!(matches!(err, CompileError::Syntax { ref message, .. } if message == "too many statically nested blocks"));
    }

    #[test]
    fn test_boolop_in_statement() {
        let code = compile(vec![Stmt::expr(Expr::boolop(
            BoolOp::And,
            vec![Expr::name("a"), Expr::name("b")],
        ))]);
        assert_eq!(ops(&code)[1], Opcode::JumpIfFalseOrPop);
    }

    #[test]
    fn test_compare_single() {
        let code = compile(vec![Stmt::expr(Expr::name("a").compare(CmpOp::Lt, Expr::int(1)))]);
        assert_eq!(
            ops(&code)[..3],
            [Opcode::LoadName, Opcode::LoadConst, Opcode::CompareOp]
        );
    }
}
