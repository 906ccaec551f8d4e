//! `try`, `with`, `raise`, `assert` and `exec`.
//!
//! A pending exception occupies three stack slots, `[traceback, value, type]`
//! with the type on top. A `finally` clause entered normally finds
//! `None, None, None` in the same slots, so `END_FINALLY` always pops three.

use crate::bytecode::code::Constant;
use crate::bytecode::opcode::{COMPARE_EXC_MATCH, Opcode};
use crate::compiler::{Compiler, NameCtx};
use crate::error::{CompileError, CompileResult};
use crate::unit::FrameBlockKind;
use kite_core::ast::{ExceptHandler, Expr, Stmt};

/// Runtime helper implementing `exec code in globals, locals`.
pub const EXEC: &str = "#@exec";

impl Compiler<'_> {
    /// Push the three placeholder slots of a normal `finally` entry.
    fn push_no_exception(&mut self) -> CompileResult<()> {
        self.unit.emit_const(Constant::None)?;
        self.unit.emit(Opcode::DupTop)?;
        self.unit.emit(Opcode::DupTop)
    }

    pub(crate) fn compile_try_finally(&mut self, body: &[Stmt], finalbody: &[Stmt]) -> CompileResult<()> {
        let protected = self.unit.graph.new_block();
        let end = self.unit.graph.new_block();

        self.unit.emit_jump(Opcode::SetupFinally, end)?;
        self.unit.graph.use_block(protected);
        self.unit
            .push_fblock(FrameBlockKind::FinallyTry, protected, None)?;
        self.visit_stmts(body)?;
        self.unit.emit(Opcode::PopBlock)?;
        self.unit.pop_fblock(FrameBlockKind::FinallyTry)?;
        self.push_no_exception()?;

        self.unit.graph.use_block(end);
        self.unit.push_fblock(FrameBlockKind::FinallyEnd, end, None)?;
        self.visit_stmts(finalbody)?;
        self.unit.emit(Opcode::EndFinally)?;
        self.unit.pop_fblock(FrameBlockKind::FinallyEnd)
    }

    /// Handlers are tried in order; each one that does not match jumps to
    /// the next, and the last falls into `END_FINALLY` to re-raise.
    pub(crate) fn compile_try_except(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
    ) -> CompileResult<()> {
        let protected = self.unit.graph.new_block();
        let mut except = self.unit.graph.new_block();
        let orelse_block = self.unit.graph.new_block();
        let end = self.unit.graph.new_block();

        self.unit.emit_jump(Opcode::SetupExcept, except)?;
        self.unit.graph.use_block(protected);
        self.unit.push_fblock(FrameBlockKind::Except, protected, None)?;
        self.visit_stmts(body)?;
        self.unit.emit(Opcode::PopBlock)?;
        self.unit.pop_fblock(FrameBlockKind::Except)?;
        self.unit.emit_jump(Opcode::JumpForward, orelse_block)?;
        self.unit.graph.use_block(except);

        for (i, handler) in handlers.iter().enumerate() {
            if handler.typ.is_none() && i + 1 < handlers.len() {
                return Err(CompileError::syntax(
                    "default 'except:' must be last",
                    handler.line,
                ));
            }
            self.unit.set_line(handler.line);
            except = self.unit.graph.new_block();
            if let Some(typ) = &handler.typ {
                self.unit.emit(Opcode::DupTop)?;
                self.visit_expr(typ)?;
                self.unit.emit_arg(Opcode::CompareOp, COMPARE_EXC_MATCH)?;
                self.unit.emit_jump(Opcode::PopJumpIfFalse, except)?;
            }
            self.unit.emit(Opcode::PopTop)?;
            match &handler.name {
                Some(name) => self.visit_store(name)?,
                None => self.unit.emit(Opcode::PopTop)?,
            }
            self.unit.emit(Opcode::PopTop)?;
            self.visit_stmts(&handler.body)?;
            self.unit.emit_jump(Opcode::JumpForward, end)?;
            self.unit.graph.use_block(except);
        }
        self.unit.emit(Opcode::EndFinally)?;

        self.unit.graph.use_block(orelse_block);
        self.visit_stmts(orelse)?;
        self.unit.graph.use_block(end);
        Ok(())
    }

    /// `with` stores `__exit__` below a `finally` block; `WITH_CLEANUP` calls
    /// it with whatever the three slots hold.
    pub(crate) fn compile_with(
        &mut self,
        context: &Expr,
        target: Option<&Expr>,
        body: &[Stmt],
    ) -> CompileResult<()> {
        let tmp = target.map(|_| self.unit.new_tmpname());
        let exit = self.unit.names.add("__exit__");
        let enter = self.unit.names.add("__enter__");

        self.visit_expr(context)?;
        self.unit.emit(Opcode::DupTop)?;
        self.unit.emit_arg(Opcode::LoadAttr, exit)?;
        self.unit.emit(Opcode::RotTwo)?;
        self.unit.emit_arg(Opcode::LoadAttr, enter)?;
        self.unit.emit_arg(Opcode::CallFunction, 0)?;
        match &tmp {
            Some(tmp) => self.nameop(tmp, NameCtx::Store)?,
            None => self.unit.emit(Opcode::PopTop)?,
        }

        let protected = self.unit.graph.new_block();
        let finally = self.unit.graph.new_block();
        self.unit.emit_jump(Opcode::SetupFinally, finally)?;
        self.unit.graph.use_block(protected);
        self.unit
            .push_fblock(FrameBlockKind::FinallyTry, protected, None)?;
        if let (Some(tmp), Some(target)) = (&tmp, target) {
            self.nameop(tmp, NameCtx::Load)?;
            self.nameop(tmp, NameCtx::Delete)?;
            self.visit_store(target)?;
        }
        self.visit_stmts(body)?;
        self.unit.emit(Opcode::PopBlock)?;
        self.unit.pop_fblock(FrameBlockKind::FinallyTry)?;
        self.push_no_exception()?;

        self.unit.graph.use_block(finally);
        self.unit
            .push_fblock(FrameBlockKind::FinallyEnd, finally, None)?;
        self.unit.emit(Opcode::WithCleanup)?;
        self.unit.emit(Opcode::EndFinally)?;
        self.unit.pop_fblock(FrameBlockKind::FinallyEnd)
    }

    pub(crate) fn compile_raise(
        &mut self,
        exc: Option<&Expr>,
        value: Option<&Expr>,
        traceback: Option<&Expr>,
    ) -> CompileResult<()> {
        let mut count = 0;
        for part in [exc, value, traceback] {
            match part {
                Some(e) => {
                    self.visit_expr(e)?;
                    count += 1;
                }
                None => break,
            }
        }
        let op = match count {
            0 => Opcode::RaiseVarargsZero,
            1 => Opcode::RaiseVarargsOne,
            2 => Opcode::RaiseVarargsTwo,
            _ => Opcode::RaiseVarargsThree,
        };
        self.unit.emit(op)
    }

    pub(crate) fn compile_assert(&mut self, test: &Expr, msg: Option<&Expr>) -> CompileResult<()> {
        if self.config.optimize {
            return Ok(());
        }
        let end = self.unit.graph.new_block();
        self.visit_expr(test)?;
        self.unit.emit_jump(Opcode::PopJumpIfTrue, end)?;
        self.load_global("AssertionError")?;
        match msg {
            Some(msg) => {
                self.visit_expr(msg)?;
                self.unit.emit(Opcode::RaiseVarargsTwo)?;
            }
            None => self.unit.emit(Opcode::RaiseVarargsOne)?,
        }
        self.unit.graph.use_block(end);
        Ok(())
    }

    /// `exec` is a call to a runtime helper; a missing `locals` reuses
    /// `globals`, and both missing means the caller's namespaces.
    pub(crate) fn compile_exec(
        &mut self,
        body: &Expr,
        globals: Option<&Expr>,
        locals: Option<&Expr>,
    ) -> CompileResult<()> {
        self.load_global(EXEC)?;
        self.visit_expr(body)?;
        match globals {
            Some(globals) => {
                self.visit_expr(globals)?;
                match locals {
                    Some(locals) => self.visit_expr(locals)?,
                    None => self.unit.emit(Opcode::DupTop)?,
                }
            }
            None => {
                self.unit.emit_const(Constant::None)?;
                self.unit.emit(Opcode::DupTop)?;
            }
        }
        self.unit.emit_arg(Opcode::CallFunction, 3)?;
        self.unit.emit(Opcode::PopTop)?;
        self.unit.uses_exec = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::code::{CodeFlags, CompiledCode};
    use crate::bytecode::instruction::decode;
    use crate::bytecode::opcode::{COMPARE_EXC_MATCH, Opcode};
    use crate::compile_module;
    use crate::config::CompilerConfig;
    use crate::error::CompileError;
    use kite_core::ast::{ExceptHandler, Expr, Module, Stmt, StmtKind};
    use std::sync::Arc;

    fn compile(body: Vec<Stmt>) -> Arc<CompiledCode> {
        compile_module(&Module::new(body), &CompilerConfig::default()).unwrap()
    }

    fn ops(code: &CompiledCode) -> Vec<Opcode> {
        decode(&code.bytecode).map(|d| d.unwrap().opcode).collect()
    }

    fn handler(typ: Option<Expr>, name: Option<&str>, line: u32) -> ExceptHandler {
        ExceptHandler {
            typ,
            name: name.map(Expr::name),
            body: vec![Stmt::pass()],
            line,
        }
    }

    // -------------------------------------------------------------------------
    // try / except
    // -------------------------------------------------------------------------

    #[test]
    fn test_try_except_shape() {
        let code = compile(vec![Stmt::new(StmtKind::TryExcept {
            body: vec![Stmt::expr(Expr::name("f").call(vec![]))],
            handlers: vec![handler(Some(Expr::name("E")), Some("e"), 2)],
            orelse: vec![],
        })]);
        let listing: Vec<_> = decode(&code.bytecode).map(|d| d.unwrap()).collect();
        let ops: Vec<_> = listing.iter().map(|d| d.opcode).collect();
        assert_eq!(
            ops[..15],
            [
                Opcode::SetupExcept,
                Opcode::LoadName,
                Opcode::CallFunction,
                Opcode::PopTop,
                Opcode::PopBlock,
                Opcode::JumpForward,
                Opcode::DupTop,
                Opcode::LoadName,
                Opcode::CompareOp,
                Opcode::PopJumpIfFalse,
                Opcode::PopTop,
                Opcode::StoreName,
                Opcode::PopTop,
                Opcode::JumpForward,
                Opcode::EndFinally
            ]
        );
        assert_eq!(listing[8].arg, COMPARE_EXC_MATCH);
        // Exception triple plus the duplicated type and the match operand.
        assert_eq!(code.max_stack_depth, 5);
        assert!(code.flags.contains(CodeFlags::BLOCKSTACK));
    }

    #[test]
    fn test_bare_except_must_be_last() {
        let err = compile_module(
            &Module::new(vec![Stmt::new(StmtKind::TryExcept {
                body: vec![Stmt::pass()],
                handlers: vec![handler(None, None, 3), handler(Some(Expr::name("E")), None, 5)],
                orelse: vec![],
            })]),
            &CompilerConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, CompileError::syntax("default 'except:' must be last", 3));
    }

    // -------------------------------------------------------------------------
    // try / finally and with
    // -------------------------------------------------------------------------

    #[test]
    fn test_try_finally_pushes_three_slots() {
        let code = compile(vec![Stmt::new(StmtKind::TryFinally {
            body: vec![Stmt::pass()],
            finalbody: vec![Stmt::expr(Expr::name("g").call(vec![]))],
        })]);
        assert_eq!(
            ops(&code)[..9],
            [
                Opcode::SetupFinally,
                Opcode::PopBlock,
                Opcode::LoadConst,
                Opcode::DupTop,
                Opcode::DupTop,
                Opcode::LoadName,
                Opcode::CallFunction,
                Opcode::PopTop,
                Opcode::EndFinally
            ]
        );
        assert_eq!(code.max_stack_depth, 4);
    }

    #[test]
    fn test_with_target_goes_through_tmpname() {
        let code = compile(vec![Stmt::new(StmtKind::With {
            context: Expr::name("lock"),
            target: Some(Expr::name("held")),
            body: vec![Stmt::pass()],
        })]);
        let ops = ops(&code);
        assert_eq!(
            ops[..13],
            [
                Opcode::LoadName,
                Opcode::DupTop,
                Opcode::LoadAttr,
                Opcode::RotTwo,
                Opcode::LoadAttr,
                Opcode::CallFunction,
                Opcode::StoreName,
                Opcode::SetupFinally,
                Opcode::LoadName,
                Opcode::DeleteName,
                Opcode::StoreName,
                Opcode::PopBlock,
                Opcode::LoadConst
            ]
        );
        assert!(ops.contains(&Opcode::WithCleanup));
        assert!(code.names.iter().any(|n| &**n == "_[1]"));
    }

    #[test]
    fn test_with_without_target_pops_enter_result() {
        let code = compile(vec![Stmt::new(StmtKind::With {
            context: Expr::name("lock"),
            target: None,
            body: vec![Stmt::pass()],
        })]);
        assert_eq!(ops(&code)[6], Opcode::PopTop);
        assert!(!code.names.iter().any(|n| n.starts_with("_[")));
    }

    // -------------------------------------------------------------------------
    // raise, assert, exec
    // -------------------------------------------------------------------------

    #[test]
    fn test_raise_arity() {
        let code = compile(vec![Stmt::new(StmtKind::Raise {
            exc: Some(Expr::name("E")),
            value: Some(Expr::str("msg")),
            traceback: None,
        })]);
        assert_eq!(
            ops(&code)[..3],
            [Opcode::LoadName, Opcode::LoadConst, Opcode::RaiseVarargsTwo]
        );
    }

    #[test]
    fn test_assert_stripped_when_optimized() {
        let m = Module::new(vec![Stmt::new(StmtKind::Assert {
            test: Expr::name("ok"),
            msg: None,
        })]);
        let plain = compile_module(&m, &CompilerConfig::default()).unwrap();
        assert_eq!(
            ops(&plain)[..4],
            [
                Opcode::LoadName,
                Opcode::PopJumpIfTrue,
                Opcode::LoadGlobal,
                Opcode::RaiseVarargsOne
            ]
        );
        let optimized = compile_module(&m, &CompilerConfig::optimized()).unwrap();
        assert_eq!(ops(&optimized), vec![Opcode::LoadConst, Opcode::ReturnValue]);
    }

    #[test]
    fn test_exec_calls_helper() {
        let body = vec![Stmt::new(StmtKind::Exec {
            body: Expr::str("x = 1"),
            globals: Some(Expr::name("g")),
            locals: None,
        })];
        let f = Stmt::def("f", &[], body);
        let code = compile(vec![f]);
        let f = code.nested().next().unwrap().clone();
        assert_eq!(
            ops(&f)[..6],
            [
                Opcode::LoadGlobal,
                Opcode::LoadConst,
                Opcode::LoadName,
                Opcode::DupTop,
                Opcode::CallFunction,
                Opcode::PopTop
            ]
        );
        assert!(f.flags.contains(CodeFlags::USES_EXEC));
        assert!(!f.flags.contains(CodeFlags::OPTIMIZED));
    }
}
