//! Functions, lambdas, classes, closures and comprehensions.
//!
//! Each of these opens a nested scope: the body is compiled into its own
//! [`CompiledCode`], which the enclosing unit then loads as a constant and
//! turns into a callable with `MAKE_FUNCTION` or `MAKE_CLOSURE`.

use crate::bytecode::code::{CodeFlags, CompiledCode, Constant};
use crate::bytecode::opcode::Opcode;
use crate::compiler::{Compiler, NameCtx, docstring};
use crate::error::{CompileError, CompileResult};
use crate::symtable::SymbolScope;
use kite_core::ast::{Arguments, ClassDef, Comprehension, Expr, FunctionDef};
use std::sync::Arc;

/// Runtime helper that creates a class from `(name, bases, namespace)`.
pub const BUILD_CLASS: &str = "#@buildclass";
/// Runtime helper returning the current locals mapping.
pub const LOCALS: &str = "#@locals";

#[derive(Clone, Copy, PartialEq, Eq)]
enum ComprehensionKind {
    Generator,
    List { tmp: u32 },
}

impl Compiler<'_> {
    // =========================================================================
    // Functions
    // =========================================================================

    pub(crate) fn compile_function(&mut self, def: &FunctionDef, line: u32) -> CompileResult<()> {
        self.visit_exprs(&def.decorators)?;
        self.visit_exprs(&def.args.defaults)?;

        self.enter_scope(def, line)?;
        let doc = docstring(&def.body);
        let first = match doc {
            Some(doc) if !self.config.optimize => Constant::Str(Arc::from(doc)),
            _ => Constant::None,
        };
        self.unit.add_const(first);
        let body = if doc.is_some() { &def.body[1..] } else { &def.body[..] };
        self.visit_stmts(body)?;
        let code = self.exit_scope()?;

        self.make_closure(code, def.args.defaults.len())?;
        for _ in &def.decorators {
            self.unit.emit_arg(Opcode::CallFunction, 1)?;
        }
        self.nameop(&def.name, NameCtx::Store)
    }

    pub(crate) fn compile_lambda(&mut self, node: &Expr, args: &Arguments, body: &Expr) -> CompileResult<()> {
        self.visit_exprs(&args.defaults)?;

        let line = if node.line > 0 { node.line } else { self.unit.line() };
        self.enter_scope(node, line)?;
        // `None` first so a lambda never reports a docstring.
        self.unit.add_const(Constant::None);
        self.visit_expr(body)?;
        if self.unit.flags.contains(CodeFlags::GENERATOR) {
            self.unit.emit(Opcode::PopTop)?;
        } else {
            self.unit.emit(Opcode::ReturnValue)?;
        }
        let code = self.exit_scope()?;
        self.make_closure(code, args.defaults.len())
    }

    /// Push a function object for `code` whose `ndefaults` defaults are
    /// already on the stack.
    pub(crate) fn make_closure(&mut self, code: Arc<CompiledCode>, ndefaults: usize) -> CompileResult<()> {
        let ndefaults = ndefaults as u32;
        if code.freevars.is_empty() {
            self.unit.emit_const(Constant::Code(code))?;
            return self.unit.emit_arg(Opcode::MakeFunction, ndefaults);
        }

        let scope = self.symtable.scope(self.unit.scope);
        let mut slots = Vec::with_capacity(code.freevars.len());
        for name in code.freevars.iter() {
            let is_cell = scope.lookup(name) == Some(SymbolScope::Cell);
            slots.push(self.deref_index(name, is_cell)?);
        }
        for slot in &slots {
            self.unit.emit_arg(Opcode::LoadClosure, *slot)?;
        }
        self.unit.emit_arg(Opcode::BuildTuple, slots.len() as u32)?;
        self.unit.emit_const(Constant::Code(code))?;
        self.unit.emit_arg(Opcode::MakeClosure, ndefaults)
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// The body runs as a function returning its locals; the runtime helper
    /// builds the class from name, bases and that namespace.
    pub(crate) fn compile_class(&mut self, class: &ClassDef, line: u32) -> CompileResult<()> {
        self.visit_exprs(&class.decorators)?;
        self.load_global(BUILD_CLASS)?;
        self.unit
            .emit_const(Constant::Str(Arc::from(class.name.as_str())))?;
        self.visit_exprs(&class.bases)?;
        self.unit
            .emit_arg(Opcode::BuildTuple, class.bases.len() as u32)?;

        self.enter_scope(class, line)?;
        self.unit.set_line(line);
        self.nameop("__name__", NameCtx::Load)?;
        self.nameop("__module__", NameCtx::Store)?;
        self.compile_body(&class.body)?;
        self.load_global(LOCALS)?;
        self.unit.emit_arg(Opcode::CallFunction, 0)?;
        self.unit.emit(Opcode::ReturnValue)?;
        let code = self.exit_scope()?;

        self.make_closure(code, 0)?;
        self.unit.emit_arg(Opcode::CallFunction, 0)?;
        self.unit.emit_arg(Opcode::CallFunction, 3)?;
        for _ in &class.decorators {
            self.unit.emit_arg(Opcode::CallFunction, 1)?;
        }
        self.nameop(&class.name, NameCtx::Store)
    }

    // =========================================================================
    // Comprehensions
    // =========================================================================

    pub(crate) fn compile_genexp(
        &mut self,
        node: &Expr,
        elt: &Expr,
        generators: &[Comprehension],
    ) -> CompileResult<()> {
        self.compile_comprehension(node, elt, generators, false)
    }

    pub(crate) fn compile_listcomp(
        &mut self,
        node: &Expr,
        elt: &Expr,
        generators: &[Comprehension],
    ) -> CompileResult<()> {
        self.compile_comprehension(node, elt, generators, true)
    }

    /// The comprehension body becomes a nested function taking the outermost
    /// iterator as its only argument, `.0`.
    fn compile_comprehension(
        &mut self,
        node: &Expr,
        elt: &Expr,
        generators: &[Comprehension],
        list: bool,
    ) -> CompileResult<()> {
        let Some(outermost) = generators.first() else {
            return Err(CompileError::syntax(
                "comprehension without a 'for' clause",
                node.line,
            ));
        };

        let line = if node.line > 0 { node.line } else { self.unit.line() };
        self.enter_scope(node, line)?;
        let kind = if list {
            let tmp = self.unit.new_tmpname();
            self.unit.emit_arg(Opcode::BuildList, 0)?;
            self.nameop(&tmp, NameCtx::Store)?;
            ComprehensionKind::List {
                tmp: self.unit.varnames.add(&tmp),
            }
        } else {
            ComprehensionKind::Generator
        };
        self.comprehension_level(generators, 0, elt, kind)?;
        if let ComprehensionKind::List { tmp } = kind {
            self.unit.emit_arg(Opcode::LoadFast, tmp)?;
            self.unit.emit(Opcode::ReturnValue)?;
        }
        let code = self.exit_scope()?;

        self.make_closure(code, 0)?;
        self.visit_expr(&outermost.iter)?;
        self.unit.emit(Opcode::GetIter)?;
        self.unit.emit_arg(Opcode::CallFunction, 1)
    }

    fn comprehension_level(
        &mut self,
        generators: &[Comprehension],
        depth: usize,
        elt: &Expr,
        kind: ComprehensionKind,
    ) -> CompileResult<()> {
        let generator = &generators[depth];
        let start = self.unit.graph.new_block();
        let if_cleanup = self.unit.graph.new_block();
        let anchor = self.unit.graph.new_block();

        if depth == 0 {
            self.nameop(".0", NameCtx::Load)?;
        } else {
            self.visit_expr(&generator.iter)?;
            self.unit.emit(Opcode::GetIter)?;
        }
        self.unit.graph.use_block(start);
        self.unit.emit_jump(Opcode::ForIter, anchor)?;
        self.unit.graph.next_block();
        self.visit_store(&generator.target)?;

        for cond in &generator.ifs {
            self.visit_expr(cond)?;
            self.unit.emit_jump(Opcode::PopJumpIfFalse, if_cleanup)?;
            self.unit.graph.next_block();
        }

        if depth + 1 < generators.len() {
            self.comprehension_level(generators, depth + 1, elt, kind)?;
        } else {
            match kind {
                ComprehensionKind::Generator => {
                    self.visit_expr(elt)?;
                    self.unit.emit(Opcode::YieldValue)?;
                    self.unit.emit(Opcode::PopTop)?;
                }
                ComprehensionKind::List { tmp } => {
                    self.unit.emit_arg(Opcode::LoadFast, tmp)?;
                    self.visit_expr(elt)?;
                    self.unit.emit(Opcode::ListAppend)?;
                }
            }
        }

        self.unit.graph.use_block(if_cleanup);
        self.unit.emit_jump(Opcode::JumpAbsolute, start)?;
        self.unit.graph.use_block(anchor);
        Ok(())
    }
}
