//! End-to-end tests for the compile pipeline: AST in, code objects out.

use kite_compiler::{
    CodeFlags, CompileError, CompiledCode, CompilerConfig, Constant, Opcode, compile_module,
    decode, decode_at, disassemble,
};
use kite_core::ast::{BoolOp, Expr, ExprKind, Module, Stmt, StmtKind};
use std::sync::Arc;

// =============================================================================
// Test Helpers
// =============================================================================

fn compile(body: Vec<Stmt>) -> Arc<CompiledCode> {
    compile_module(&Module::new(body), &CompilerConfig::default()).expect("compile failed")
}

fn compile_err(body: Vec<Stmt>) -> CompileError {
    compile_module(&Module::new(body), &CompilerConfig::default()).expect_err("expected an error")
}

fn listing(code: &CompiledCode) -> Vec<(u32, Opcode, u32)> {
    decode(&code.bytecode)
        .map(|d| {
            let d = d.expect("valid bytecode");
            (d.offset, d.opcode, d.arg)
        })
        .collect()
}

fn ops(code: &CompiledCode) -> Vec<Opcode> {
    listing(code).into_iter().map(|(_, op, _)| op).collect()
}

fn first_nested(code: &CompiledCode) -> Arc<CompiledCode> {
    code.nested().next().expect("nested code").clone()
}

fn syntax_message(err: CompileError) -> String {
    match err {
        CompileError::Syntax { message, .. } => message,
        other => panic!("expected a syntax error, got {other:?}"),
    }
}

// =============================================================================
// Code Shapes
// =============================================================================

#[test]
fn test_or_chain_shares_one_exit() {
    let code = compile(vec![Stmt::expr(Expr::boolop(
        BoolOp::Or,
        vec![Expr::name("a"), Expr::name("b"), Expr::name("c")],
    ))]);
    let listing = listing(&code);
    let jumps: Vec<_> = listing
        .iter()
        .filter(|(_, op, _)| *op == Opcode::JumpIfTrueOrPop)
        .collect();
    assert_eq!(jumps.len(), 2);
    assert_eq!(jumps[0].2, jumps[1].2);

    // Both land on the POP_TOP of the expression statement.
    let target = decode_at(&code.bytecode, jumps[0].2).unwrap();
    assert_eq!(target.opcode, Opcode::PopTop);
}

#[test]
fn test_empty_function_body() {
    let code = compile(vec![Stmt::def("f", &[], vec![Stmt::pass()])]);
    let f = first_nested(&code);
    assert_eq!(
        listing(&f),
        vec![(0, Opcode::LoadConst, 0), (3, Opcode::ReturnValue, 0)]
    );
    assert_eq!(f.constants[0], Constant::None);
}

#[test]
fn test_constant_true_branch_leaves_single_block() {
    let code = compile(vec![Stmt::def(
        "f",
        &[],
        vec![
            Stmt::if_(Expr::bool(true), vec![Stmt::ret(Some(Expr::int(1)))], vec![]),
            Stmt::expr(Expr::name("unreachable").call(vec![])),
        ],
    )]);
    let f = first_nested(&code);
    assert_eq!(ops(&f), vec![Opcode::LoadConst, Opcode::ReturnValue]);
    assert_eq!(f.max_stack_depth, 1);
}

#[test]
fn test_while_true_has_no_test() {
    let code = compile(vec![Stmt::def(
        "spin",
        &[],
        vec![Stmt::while_(
            Expr::int(1),
            vec![Stmt::expr(Expr::name("tick").call(vec![]))],
        )],
    )]);
    let f = first_nested(&code);
    let ops = ops(&f);
    assert!(!ops.contains(&Opcode::PopJumpIfFalse));
    assert!(ops.contains(&Opcode::JumpAbsolute));
}

#[test]
fn test_for_else_runs_after_exhaustion() {
    let code = compile(vec![Stmt::new(StmtKind::For {
        target: Expr::name("i"),
        iter: Expr::name("xs"),
        body: vec![Stmt::pass()],
        orelse: vec![Stmt::expr(Expr::name("done").call(vec![]))],
    })]);
    let listing = listing(&code);
    let for_iter = listing
        .iter()
        .find(|(_, op, _)| *op == Opcode::ForIter)
        .unwrap();
    let exit = decode_at(&code.bytecode, for_iter.0 + 3 + for_iter.2).unwrap();
    // The else clause starts right where the exhausted loop lands.
    assert_eq!(exit.opcode, Opcode::LoadName);
    assert_eq!(&*code.names[exit.arg as usize], "done");
}

// =============================================================================
// Line Table and Extended Arguments
// =============================================================================

#[test]
fn test_line_jump_of_300_splits_entries() {
    let code = compile(vec![
        Stmt::assign(Expr::name("x"), Expr::int(1)).at(1),
        Stmt::assign(Expr::name("y"), Expr::int(2)).at(301),
    ]);
    assert_eq!(code.first_line, 1);
    assert_eq!(&*code.lnotab, &[6, 255, 0, 45]);
    assert_eq!(code.line_for_offset(0), 1);
    assert_eq!(code.line_for_offset(5), 1);
    assert_eq!(code.line_for_offset(6), 301);
}

#[test]
fn test_module_first_line_is_first_statement() {
    let code = compile(vec![Stmt::assign(Expr::name("x"), Expr::int(1)).at(7)]);
    assert_eq!(code.first_line, 7);
    assert!(code.lnotab.is_empty());

    let unlined = compile(vec![Stmt::pass()]);
    assert_eq!(unlined.first_line, 1);
}

#[test]
fn test_far_jump_uses_extended_arg() {
    let body: Vec<Stmt> = (0..20_000)
        .map(|_| Stmt::assign(Expr::name("x"), Expr::int(1)))
        .collect();
    let code = compile(vec![Stmt::if_(Expr::name("c"), body, vec![])]);
    assert!(code.bytecode.len() > 0xFFFF);

    let jump = decode_at(&code.bytecode, 3).unwrap();
    assert_eq!(jump.opcode, Opcode::PopJumpIfFalse);
    assert_eq!(jump.size, 6);
    // Lands on the implicit `return None`.
    assert_eq!(jump.arg as usize, code.bytecode.len() - 4);
    assert_eq!(
        decode_at(&code.bytecode, jump.arg).unwrap().opcode,
        Opcode::LoadConst
    );
}

// =============================================================================
// Closures and Flags
// =============================================================================

#[test]
fn test_three_level_closure_passes_through_middle() {
    let innermost = Stmt::def("c", &[], vec![Stmt::ret(Some(Expr::name("v")))]);
    let middle = Stmt::def("b", &[], vec![innermost, Stmt::ret(Some(Expr::name("c")))]);
    let outer = Stmt::def(
        "a",
        &[],
        vec![
            Stmt::assign(Expr::name("v"), Expr::int(1)),
            middle,
            Stmt::ret(Some(Expr::name("b"))),
        ],
    );
    let code = compile(vec![outer]);
    let a = first_nested(&code);
    let b = first_nested(&a);
    let c = first_nested(&b);

    assert_eq!(a.cellvars.len(), 1);
    assert_eq!(&*b.freevars[0], "v");
    assert!(b.cellvars.is_empty());
    assert_eq!(&*c.freevars[0], "v");
    // The middle function forwards its own free slot.
    let load = listing(&b)
        .into_iter()
        .find(|(_, op, _)| *op == Opcode::LoadClosure)
        .unwrap();
    assert_eq!(load.2, 0);
}

#[test]
fn test_generator_flag_from_yield() {
    let code = compile(vec![Stmt::def(
        "g",
        &[],
        vec![Stmt::expr(Expr::new(ExprKind::Yield(Some(Box::new(Expr::int(1))))))],
    )]);
    let g = first_nested(&code);
    assert!(g.is_generator());
    assert!(g.flags.contains(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS));
}

#[test]
fn test_filename_propagates_to_nested_code() {
    let config = CompilerConfig::new("prog.kt");
    let m = Module::new(vec![Stmt::def("f", &[], vec![Stmt::pass()])]);
    let code = compile_module(&m, &config).unwrap();
    assert_eq!(&*code.filename, "prog.kt");
    assert_eq!(&*first_nested(&code).filename, "prog.kt");
}

#[test]
fn test_disassembly_lists_nested_code() {
    let code = compile(vec![Stmt::def("f", &["a"], vec![Stmt::ret(Some(Expr::name("a")))])]);
    let text = disassemble(&code).unwrap();
    assert!(text.contains("MAKE_FUNCTION"));
    assert!(text.contains("<code f>"));
    assert!(text.contains("LOAD_FAST"));
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_syntax_error_messages() {
    let in_loop = |stmt: Stmt| Stmt::while_(Expr::name("c"), vec![stmt]);
    let cases: Vec<(Vec<Stmt>, &str)> = vec![
        (vec![Stmt::ret(None)], "'return' outside function"),
        (
            vec![Stmt::expr(Expr::new(ExprKind::Yield(None)))],
            "'yield' outside function",
        ),
        (vec![Stmt::new(StmtKind::Break)], "'break' outside loop"),
        (
            vec![Stmt::new(StmtKind::Continue)],
            "'continue' not properly in loop",
        ),
        (
            vec![in_loop(Stmt::new(StmtKind::TryFinally {
                body: vec![],
                finalbody: vec![Stmt::new(StmtKind::Continue)],
            }))],
            "'continue' not supported inside 'finally' clause",
        ),
        (
            vec![Stmt::assign(Expr::name("__debug__"), Expr::int(0))],
            "can not assign to __debug__",
        ),
        (
            vec![Stmt::assign(Expr::int(1), Expr::int(0))],
            "can't assign to literal",
        ),
    ];
    for (body, expected) in cases {
        assert_eq!(syntax_message(compile_err(body)), expected);
    }
}

#[test]
fn test_delete_of_captured_variable() {
    let inner = Stmt::def("inner", &[], vec![Stmt::ret(Some(Expr::name("x")))]);
    let outer = Stmt::def(
        "outer",
        &["x"],
        vec![inner, Stmt::new(StmtKind::Delete(vec![Expr::name("x")])).at(3)],
    );
    assert_eq!(
        compile_err(vec![outer]),
        CompileError::syntax("can not delete variable 'x' referenced in nested scope", 3)
    );
}

#[test]
fn test_table_limit() {
    let body = (0..1025)
        .map(|i| Stmt::assign(Expr::name("x"), Expr::int(i)))
        .collect();
    let err = compile_module(&Module::new(body), &CompilerConfig::for_testing()).unwrap_err();
    assert_eq!(
        err,
        CompileError::ResourceLimit {
            what: "constants",
            limit: 1024
        }
    );
}

#[test]
fn test_code_size_limit() {
    let body = (0..11_000)
        .map(|_| Stmt::assign(Expr::name("x"), Expr::int(1)))
        .collect();
    let err = compile_module(&Module::new(body), &CompilerConfig::for_testing()).unwrap_err();
    assert!(matches!(
        err,
        CompileError::ResourceLimit {
            what: "bytecode bytes",
            ..
        }
    ));
}

#[test]
fn test_errors_convert_to_pipeline_error() {
    let err: kite_core::KiteError = compile_err(vec![Stmt::ret(None).at(2)]).into();
    assert!(err.to_string().contains("'return' outside function"));
}
