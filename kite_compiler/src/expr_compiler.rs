//! Expression compilation, assignment targets and calls.

use crate::bytecode::code::Constant;
use crate::bytecode::opcode::{Opcode, pack_call_arg};
use crate::compiler::{Compiler, NameCtx};
use crate::error::{CompileError, CompileResult};
use kite_core::ast::{
    BinOp, BoolOp, CmpOp, Expr, ExprKind, Keyword, Literal, Slice, UnaryOp,
};
use std::sync::Arc;

/// Largest positional or keyword count a call instruction can encode.
const MAX_CALL_ARGS: usize = 255;

/// Opcode for `left op right`.
pub(crate) fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::BinaryAdd,
        BinOp::Sub => Opcode::BinarySubtract,
        BinOp::Mul => Opcode::BinaryMultiply,
        BinOp::Div => Opcode::BinaryDivide,
        BinOp::FloorDiv => Opcode::BinaryFloorDivide,
        BinOp::Mod => Opcode::BinaryModulo,
        BinOp::Pow => Opcode::BinaryPower,
        BinOp::LShift => Opcode::BinaryLshift,
        BinOp::RShift => Opcode::BinaryRshift,
        BinOp::BitOr => Opcode::BinaryOr,
        BinOp::BitXor => Opcode::BinaryXor,
        BinOp::BitAnd => Opcode::BinaryAnd,
    }
}

/// Opcode for `target op= value`.
pub(crate) fn inplace_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::InplaceAdd,
        BinOp::Sub => Opcode::InplaceSubtract,
        BinOp::Mul => Opcode::InplaceMultiply,
        BinOp::Div => Opcode::InplaceDivide,
        BinOp::FloorDiv => Opcode::InplaceFloorDivide,
        BinOp::Mod => Opcode::InplaceModulo,
        BinOp::Pow => Opcode::InplacePower,
        BinOp::LShift => Opcode::InplaceLshift,
        BinOp::RShift => Opcode::InplaceRshift,
        BinOp::BitOr => Opcode::InplaceOr,
        BinOp::BitXor => Opcode::InplaceXor,
        BinOp::BitAnd => Opcode::InplaceAnd,
    }
}

fn unary_opcode(op: UnaryOp) -> Opcode {
    match op {
        UnaryOp::Not => Opcode::UnaryNot,
        UnaryOp::Invert => Opcode::UnaryInvert,
        UnaryOp::UAdd => Opcode::UnaryPositive,
        UnaryOp::USub => Opcode::UnaryNegative,
    }
}

pub(crate) fn literal_constant(lit: &Literal) -> Constant {
    match lit {
        Literal::None => Constant::None,
        Literal::Bool(b) => Constant::Bool(*b),
        Literal::Int(i) => Constant::Int(*i),
        Literal::Float(f) => Constant::Float(*f),
        Literal::Str(s) => Constant::Str(Arc::from(s.as_str())),
    }
}

/// Noun used in "can't assign to ..." diagnostics.
fn describe(kind: &ExprKind) -> &'static str {
    match kind {
        ExprKind::BoolOp { .. } | ExprKind::BinOp { .. } | ExprKind::UnaryOp { .. } => "operator",
        ExprKind::Lambda { .. } => "lambda",
        ExprKind::IfExp { .. } => "conditional expression",
        ExprKind::Dict { .. } | ExprKind::Constant(_) => "literal",
        ExprKind::ListComp { .. } => "list comprehension",
        ExprKind::GeneratorExp { .. } => "generator expression",
        ExprKind::Yield(_) => "yield expression",
        ExprKind::Compare { .. } => "comparison",
        ExprKind::Call { .. } => "function call",
        ExprKind::Attribute { .. } => "attribute",
        ExprKind::Subscript { .. } => "subscript",
        ExprKind::Name(_) => "name",
        ExprKind::List(_) => "list",
        ExprKind::Tuple(_) => "tuple",
    }
}

impl Compiler<'_> {
    // =========================================================================
    // Loads
    // =========================================================================

    pub(crate) fn visit_expr(&mut self, e: &Expr) -> CompileResult<()> {
        if e.line > 0 {
            self.unit.update_line(e.line);
        }
        match &e.kind {
            ExprKind::BoolOp { op, values } => self.compile_boolop(*op, values),
            ExprKind::BinOp { left, op, right } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
                self.unit.emit(binary_opcode(*op))
            }
            ExprKind::UnaryOp { op, operand } => {
                self.visit_expr(operand)?;
                self.unit.emit(unary_opcode(*op))
            }
            ExprKind::Lambda { args, body } => self.compile_lambda(e, args, body),
            ExprKind::IfExp { test, body, orelse } => {
                let end = self.unit.graph.new_block();
                let next = self.unit.graph.new_block();
                self.visit_expr(test)?;
                self.unit.emit_jump(Opcode::PopJumpIfFalse, next)?;
                self.visit_expr(body)?;
                self.unit.emit_jump(Opcode::JumpForward, end)?;
                self.unit.graph.use_block(next);
                self.visit_expr(orelse)?;
                self.unit.graph.use_block(end);
                Ok(())
            }
            ExprKind::Dict { keys, values } => {
                self.unit.emit_arg(Opcode::BuildMap, keys.len().min(0xFFFF) as u32)?;
                for (k, v) in keys.iter().zip(values) {
                    self.visit_expr(v)?;
                    self.visit_expr(k)?;
                    self.unit.emit(Opcode::StoreMap)?;
                }
                Ok(())
            }
            ExprKind::ListComp { elt, generators } => self.compile_listcomp(e, elt, generators),
            ExprKind::GeneratorExp { elt, generators } => self.compile_genexp(e, elt, generators),
            ExprKind::Yield(value) => {
                match value {
                    Some(v) => self.visit_expr(v)?,
                    None => self.unit.emit_const(Constant::None)?,
                }
                self.unit.emit(Opcode::YieldValue)
            }
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => self.compile_compare(left, ops, comparators),
            ExprKind::Call {
                func,
                args,
                keywords,
                starargs,
                kwargs,
            } => self.compile_call(func, args, keywords, starargs.as_deref(), kwargs.as_deref()),
            ExprKind::Constant(lit) => self.unit.emit_const(literal_constant(lit)),
            ExprKind::Attribute { value, attr } => {
                self.visit_expr(value)?;
                let idx = self.unit.names.add(attr);
                self.unit.emit_arg(Opcode::LoadAttr, idx)
            }
            ExprKind::Subscript { value, slice } => {
                self.visit_expr(value)?;
                self.visit_slice(slice)?;
                self.unit.emit(Opcode::BinarySubscr)
            }
            ExprKind::Name(id) => self.nameop(id, NameCtx::Load),
            ExprKind::List(elts) => {
                self.visit_exprs(elts)?;
                self.unit.emit_arg(Opcode::BuildList, elts.len() as u32)
            }
            ExprKind::Tuple(elts) => {
                self.visit_exprs(elts)?;
                self.unit.emit_arg(Opcode::BuildTuple, elts.len() as u32)
            }
        }
    }

    pub(crate) fn visit_exprs(&mut self, exprs: &[Expr]) -> CompileResult<()> {
        exprs.iter().try_for_each(|e| self.visit_expr(e))
    }

    fn visit_slice(&mut self, slice: &Slice) -> CompileResult<()> {
        match slice {
            Slice::Index(index) => self.visit_expr(index),
            Slice::Slice { lower, upper, step } => {
                for part in [lower, upper] {
                    match part {
                        Some(e) => self.visit_expr(e)?,
                        None => self.unit.emit_const(Constant::None)?,
                    }
                }
                match step {
                    Some(step) => {
                        self.visit_expr(step)?;
                        self.unit.emit(Opcode::BuildSliceThree)
                    }
                    None => self.unit.emit(Opcode::BuildSliceTwo),
                }
            }
        }
    }

    fn compile_boolop(&mut self, op: BoolOp, values: &[Expr]) -> CompileResult<()> {
        let Some((last, rest)) = values.split_last() else {
            return Err(CompileError::internal("boolean operation without operands"));
        };
        let jump = match op {
            BoolOp::And => Opcode::JumpIfFalseOrPop,
            BoolOp::Or => Opcode::JumpIfTrueOrPop,
        };
        let end = self.unit.graph.new_block();
        for value in rest {
            self.visit_expr(value)?;
            self.unit.emit_jump(jump, end)?;
        }
        self.visit_expr(last)?;
        self.unit.graph.use_block(end);
        Ok(())
    }

    /// `a < b < c` evaluates `b` once and short-circuits on the first false
    /// comparison.
    fn compile_compare(&mut self, left: &Expr, ops: &[CmpOp], comparators: &[Expr]) -> CompileResult<()> {
        if ops.is_empty() || ops.len() != comparators.len() {
            return Err(CompileError::internal("malformed comparison"));
        }
        self.visit_expr(left)?;
        let n = ops.len() - 1;
        let cleanup = (n > 0).then(|| self.unit.graph.new_block());

        for (op, comparator) in ops[..n].iter().zip(&comparators[..n]) {
            self.visit_expr(comparator)?;
            self.unit.emit(Opcode::DupTop)?;
            self.unit.emit(Opcode::RotThree)?;
            self.unit.emit_arg(Opcode::CompareOp, *op as u32)?;
            if let Some(cleanup) = cleanup {
                self.unit.emit_jump(Opcode::JumpIfFalseOrPop, cleanup)?;
            }
            self.unit.graph.next_block();
        }
        self.visit_expr(&comparators[n])?;
        self.unit.emit_arg(Opcode::CompareOp, ops[n] as u32)?;

        if let Some(cleanup) = cleanup {
            let end = self.unit.graph.new_block();
            self.unit.emit_jump(Opcode::JumpForward, end)?;
            self.unit.graph.use_block(cleanup);
            self.unit.emit(Opcode::RotTwo)?;
            self.unit.emit(Opcode::PopTop)?;
            self.unit.graph.use_block(end);
        }
        Ok(())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn compile_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[Keyword],
        starargs: Option<&Expr>,
        kwargs: Option<&Expr>,
    ) -> CompileResult<()> {
        if args.len() > MAX_CALL_ARGS || keywords.len() > MAX_CALL_ARGS {
            return Err(CompileError::syntax("more than 255 arguments", self.unit.line()));
        }

        if let ExprKind::Attribute { value, attr } = &func.kind {
            if keywords.is_empty() && starargs.is_none() && kwargs.is_none() {
                self.visit_expr(value)?;
                let idx = self.unit.names.add(attr);
                self.unit.emit_arg(Opcode::LoadMethod, idx)?;
                self.visit_exprs(args)?;
                return self.unit.emit_arg(Opcode::CallMethod, args.len() as u32);
            }
        }

        self.visit_expr(func)?;
        self.visit_exprs(args)?;
        for kw in keywords {
            self.unit.emit_const(Constant::Str(Arc::from(kw.arg.as_str())))?;
            self.visit_expr(&kw.value)?;
        }
        if let Some(star) = starargs {
            self.visit_expr(star)?;
        }
        if let Some(kw) = kwargs {
            self.visit_expr(kw)?;
        }
        let op = match (starargs.is_some(), kwargs.is_some()) {
            (false, false) => Opcode::CallFunction,
            (true, false) => Opcode::CallFunctionVar,
            (false, true) => Opcode::CallFunctionKw,
            (true, true) => Opcode::CallFunctionVarKw,
        };
        self.unit
            .emit_arg(op, pack_call_arg(args.len() as u32, keywords.len() as u32))
    }

    // =========================================================================
    // Stores and Deletes
    // =========================================================================

    pub(crate) fn visit_store(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(id) => self.nameop(id, NameCtx::Store),
            ExprKind::Attribute { value, attr } => {
                self.visit_expr(value)?;
                let idx = self.unit.names.add(attr);
                self.unit.emit_arg(Opcode::StoreAttr, idx)
            }
            ExprKind::Subscript { value, slice } => {
                self.visit_expr(value)?;
                self.visit_slice(slice)?;
                self.unit.emit(Opcode::StoreSubscr)
            }
            ExprKind::Tuple(elts) | ExprKind::List(elts) => {
                self.unit.emit_arg(Opcode::UnpackSequence, elts.len() as u32)?;
                elts.iter().try_for_each(|e| self.visit_store(e))
            }
            other => Err(CompileError::syntax(
                format!("can't assign to {}", describe(other)),
                self.target_line(target),
            )),
        }
    }

    pub(crate) fn visit_delete(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(id) => self.nameop(id, NameCtx::Delete),
            ExprKind::Attribute { value, attr } => {
                self.visit_expr(value)?;
                let idx = self.unit.names.add(attr);
                self.unit.emit_arg(Opcode::DeleteAttr, idx)
            }
            ExprKind::Subscript { value, slice } => {
                self.visit_expr(value)?;
                self.visit_slice(slice)?;
                self.unit.emit(Opcode::DeleteSubscr)
            }
            ExprKind::Tuple(elts) | ExprKind::List(elts) => {
                elts.iter().try_for_each(|e| self.visit_delete(e))
            }
            other => Err(CompileError::syntax(
                format!("can't delete {}", describe(other)),
                self.target_line(target),
            )),
        }
    }

    fn target_line(&self, target: &Expr) -> u32 {
        if target.line > 0 { target.line } else { self.unit.line() }
    }

    pub(crate) fn compile_augassign(&mut self, target: &Expr, op: BinOp, value: &Expr) -> CompileResult<()> {
        let inplace = inplace_opcode(op);
        match &target.kind {
            ExprKind::Name(id) => {
                self.nameop(id, NameCtx::Load)?;
                self.visit_expr(value)?;
                self.unit.emit(inplace)?;
                self.nameop(id, NameCtx::Store)
            }
            ExprKind::Attribute { value: obj, attr } => {
                let idx = self.unit.names.add(attr);
                self.visit_expr(obj)?;
                self.unit.emit(Opcode::DupTop)?;
                self.unit.emit_arg(Opcode::LoadAttr, idx)?;
                self.visit_expr(value)?;
                self.unit.emit(inplace)?;
                self.unit.emit(Opcode::RotTwo)?;
                self.unit.emit_arg(Opcode::StoreAttr, idx)
            }
            ExprKind::Subscript { value: obj, slice } => {
                self.visit_expr(obj)?;
                self.visit_slice(slice)?;
                self.unit.emit(Opcode::DupTopTwo)?;
                self.unit.emit(Opcode::BinarySubscr)?;
                self.visit_expr(value)?;
                self.unit.emit(inplace)?;
                self.unit.emit(Opcode::RotThree)?;
                self.unit.emit(Opcode::StoreSubscr)
            }
            other => Err(CompileError::syntax(
                format!("illegal expression for augmented assignment: {}", describe(other)),
                self.target_line(target),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::code::CompiledCode;
    use crate::bytecode::instruction::decode;
    use crate::bytecode::opcode::Opcode;
    use crate::compile_module;
    use crate::config::CompilerConfig;
    use crate::error::CompileError;
    use kite_core::ast::{BinOp, BoolOp, CmpOp, Expr, ExprKind, Keyword, Module, Stmt, StmtKind};
    use std::sync::Arc;

    fn compile(body: Vec<Stmt>) -> Arc<CompiledCode> {
        compile_module(&Module::new(body), &CompilerConfig::default()).unwrap()
    }

    fn ops(code: &CompiledCode) -> Vec<Opcode> {
        decode(&code.bytecode).map(|d| d.unwrap().opcode).collect()
    }

    fn expr_ops(e: Expr) -> Vec<Opcode> {
        let code = compile(vec![Stmt::expr(e)]);
        let mut ops = ops(&code);
        // Drop POP_TOP and the implicit `return None`.
        ops.truncate(ops.len() - 3);
        ops
    }

    // -------------------------------------------------------------------------
    // Short Circuits
    // -------------------------------------------------------------------------

    #[test]
    fn test_or_chain_jumps_to_shared_end() {
        let ops = expr_ops(Expr::boolop(
            BoolOp::Or,
            vec![Expr::name("a"), Expr::name("b"), Expr::name("c")],
        ));
        assert_eq!(
            ops,
            vec![
                Opcode::LoadName,
                Opcode::JumpIfTrueOrPop,
                Opcode::LoadName,
                Opcode::JumpIfTrueOrPop,
                Opcode::LoadName
            ]
        );
    }

    #[test]
    fn test_chained_compare_shape() {
        let e = Expr::new(ExprKind::Compare {
            left: Box::new(Expr::name("a")),
            ops: vec![CmpOp::Lt, CmpOp::Lt],
            comparators: vec![Expr::name("b"), Expr::name("c")],
        });
        let code = compile(vec![Stmt::expr(e)]);
        let ops = ops(&code);
        assert_eq!(
            &ops[..10],
            &[
                Opcode::LoadName,
                Opcode::LoadName,
                Opcode::DupTop,
                Opcode::RotThree,
                Opcode::CompareOp,
                Opcode::JumpIfFalseOrPop,
                Opcode::LoadName,
                Opcode::CompareOp,
                Opcode::JumpForward,
                Opcode::RotTwo
            ]
        );
        assert_eq!(code.max_stack_depth, 3);
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    #[test]
    fn test_method_call_uses_load_method() {
        let ops = expr_ops(Expr::name("obj").attr("m").call(vec![Expr::int(1)]));
        assert_eq!(
            ops,
            vec![Opcode::LoadName, Opcode::LoadMethod, Opcode::LoadConst, Opcode::CallMethod]
        );
    }

    #[test]
    fn test_keyword_call_packs_counts() {
        let call = Expr::new(ExprKind::Call {
            func: Box::new(Expr::name("f")),
            args: vec![Expr::int(1)],
            keywords: vec![Keyword {
                arg: "k".into(),
                value: Expr::int(2),
            }],
            starargs: Some(Box::new(Expr::name("rest"))),
            kwargs: None,
        });
        let code = compile(vec![Stmt::expr(call)]);
        let call = decode(&code.bytecode)
            .map(|d| d.unwrap())
            .find(|d| d.opcode == Opcode::CallFunctionVar)
            .unwrap();
        assert_eq!(call.arg, 1 | (1 << 8));
        assert_eq!(code.max_stack_depth, 5);
    }

    #[test]
    fn test_too_many_arguments() {
        let args = (0..256).map(Expr::int).collect();
        let err = compile_module(
            &Module::new(vec![Stmt::expr(Expr::name("f").call(args)).at(2)]),
            &CompilerConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, CompileError::syntax("more than 255 arguments", 2));
    }

    // -------------------------------------------------------------------------
    // Targets
    // -------------------------------------------------------------------------

    #[test]
    fn test_tuple_unpack() {
        let code = compile(vec![Stmt::assign(
            Expr::tuple(vec![Expr::name("a"), Expr::name("b")]),
            Expr::name("pair"),
        )]);
        assert_eq!(
            &ops(&code)[..4],
            &[Opcode::LoadName, Opcode::UnpackSequence, Opcode::StoreName, Opcode::StoreName]
        );
    }

    #[test]
    fn test_augassign_subscript() {
        let code = compile(vec![Stmt::new(StmtKind::AugAssign {
            target: Expr::name("d").index(Expr::name("k")),
            op: BinOp::Add,
            value: Expr::int(1),
        })]);
        assert_eq!(
            &ops(&code)[..8],
            &[
                Opcode::LoadName,
                Opcode::LoadName,
                Opcode::DupTopTwo,
                Opcode::BinarySubscr,
                Opcode::LoadConst,
                Opcode::InplaceAdd,
                Opcode::RotThree,
                Opcode::StoreSubscr
            ]
        );
        assert_eq!(code.max_stack_depth, 4);
    }

    #[test]
    fn test_augassign_attribute() {
        let code = compile(vec![Stmt::new(StmtKind::AugAssign {
            target: Expr::name("o").attr("n"),
            op: BinOp::Sub,
            value: Expr::int(1),
        })]);
        assert_eq!(
            &ops(&code)[..7],
            &[
                Opcode::LoadName,
                Opcode::DupTop,
                Opcode::LoadAttr,
                Opcode::LoadConst,
                Opcode::InplaceSubtract,
                Opcode::RotTwo,
                Opcode::StoreAttr
            ]
        );
    }

    #[test]
    fn test_invalid_targets() {
        let err = compile_module(
            &Module::new(vec![Stmt::assign(Expr::name("f").call(vec![]), Expr::int(1)).at(4)]),
            &CompilerConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, CompileError::syntax("can't assign to function call", 4));

        let err = compile_module(
            &Module::new(vec![Stmt::new(StmtKind::Delete(vec![Expr::int(1)])).at(5)]),
            &CompilerConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, CompileError::syntax("can't delete literal", 5));
    }

    #[test]
    fn test_dict_display() {
        let e = Expr::new(ExprKind::Dict {
            keys: vec![Expr::str("a")],
            values: vec![Expr::int(1)],
        });
        assert_eq!(
            expr_ops(e),
            vec![Opcode::BuildMap, Opcode::LoadConst, Opcode::LoadConst, Opcode::StoreMap]
        );
    }
}
