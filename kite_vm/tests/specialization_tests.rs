//! End-to-end tests for feedback, guarded fast paths, bailouts and
//! invalidation.

use kite_compiler::{CompilerConfig, compile_module};
use kite_core::ast::{BinOp, ClassDef, CmpOp, Expr, Module, Stmt, StmtKind};
use kite_vm::{BailoutReason, InvalidationRegistry, Value, Vm, VmConfig, VmResult};
use std::sync::Arc;

// =============================================================================
// Test Helpers
// =============================================================================

fn run(vm: &mut Vm, body: Vec<Stmt>) -> VmResult<Value> {
    let code = compile_module(&Module::new(body), &CompilerConfig::default()).expect("compile failed");
    vm.execute(code)
}

fn int(vm: &Vm, name: &str) -> Option<i64> {
    vm.global(name).and_then(|v| v.as_int())
}

fn assign(name: &str, value: Expr) -> Stmt {
    Stmt::assign(Expr::name(name), value)
}

fn aug(name: &str, value: Expr) -> Stmt {
    Stmt::new(StmtKind::AugAssign { target: Expr::name(name), op: BinOp::Add, value })
}

fn range(n: i64) -> Expr {
    Expr::name("range").call(vec![Expr::int(n)])
}

fn when_i_is(n: i64, body: Vec<Stmt>) -> Stmt {
    Stmt::if_(Expr::name("i").compare(CmpOp::Eq, Expr::int(n)), body, vec![])
}

fn class(name: &str, body: Vec<Stmt>) -> Stmt {
    Stmt::new(StmtKind::ClassDef(Box::new(ClassDef {
        name: name.to_string(),
        bases: vec![],
        body,
        decorators: vec![],
    })))
}

// =============================================================================
// Call Sites
// =============================================================================

#[test]
fn test_native_call_site_switches_callee() {
    // fn = len; for i in range(150): if i == 120: fn = str; out.append(fn([i]))
    let mut vm = Vm::new(VmConfig::for_testing());
    run(
        &mut vm,
        vec![
            assign("fn", Expr::name("len")),
            assign("out", Expr::list(vec![])),
            Stmt::for_(
                Expr::name("i"),
                range(150),
                vec![
                    when_i_is(120, vec![assign("fn", Expr::name("str"))]),
                    Stmt::expr(Expr::name("out").attr("append").call(vec![
                        Expr::name("fn").call(vec![Expr::list(vec![Expr::name("i")])]),
                    ])),
                ],
            ),
        ],
    )
    .unwrap();

    let Some(Value::List(out)) = vm.global("out") else {
        panic!("out is not a list");
    };
    let out = out.borrow();
    assert_eq!(out.len(), 150);
    assert_eq!(out[119].as_int(), Some(1));
    assert_eq!(out[120].to_str(), "[120]");
    assert_eq!(out[149].to_str(), "[149]");

    let stats = vm.stats();
    assert!(stats.fast_hits > 100, "{stats:?}");
    assert!(stats.bailouts.count(BailoutReason::GuardFailed) >= 1, "{stats:?}");
    assert!(stats.plans_built >= 2);
}

#[test]
fn test_function_call_site_runs_callee_frame() {
    // def sq(x): return x * x
    let mut vm = Vm::new(VmConfig::for_testing());
    run(
        &mut vm,
        vec![
            Stmt::def("sq", &["x"], vec![Stmt::ret(Some(Expr::name("x").binop(BinOp::Mul, Expr::name("x"))))]),
            assign("total", Expr::int(0)),
            Stmt::for_(
                Expr::name("i"),
                range(200),
                vec![aug("total", Expr::name("sq").call(vec![Expr::name("i")]))],
            ),
        ],
    )
    .unwrap();
    assert_eq!(int(&vm, "total"), Some((0..200).map(|i| i * i).sum()));
    assert!(vm.stats().fast_hits > 200);
}

// =============================================================================
// Operand Guards
// =============================================================================

#[test]
fn test_operand_type_change_bails_out() {
    // total = 0; for v in range(100) + [0.5]: total = total + v
    let mut vm = Vm::new(VmConfig::for_testing());
    run(
        &mut vm,
        vec![
            assign("total", Expr::int(0)),
            Stmt::for_(
                Expr::name("v"),
                range(100).add(Expr::list(vec![Expr::float(0.5)])),
                vec![assign("total", Expr::name("total").add(Expr::name("v")))],
            ),
        ],
    )
    .unwrap();
    assert_eq!(vm.global("total").map(|v| v.repr()), Some("4950.5".to_string()));
    assert!(vm.stats().bailouts.count(BailoutReason::GuardFailed) >= 1);
}

#[test]
fn test_baseline_config_records_nothing() {
    let mut vm = Vm::new(VmConfig::baseline_only());
    run(
        &mut vm,
        vec![
            assign("total", Expr::int(0)),
            Stmt::for_(Expr::name("i"), range(300), vec![aug("total", Expr::name("i"))]),
        ],
    )
    .unwrap();
    assert_eq!(int(&vm, "total"), Some(44_850));
    assert!(vm.feedback().is_empty());
    assert_eq!(vm.stats().fast_hits, 0);
}

// =============================================================================
// Invalidation
// =============================================================================

#[test]
fn test_class_mutation_invalidates_attribute_site() {
    // class Point: scale = 2
    // p = Point(); total = 0
    // for i in range(50): if i == 25: Point.scale = 10; total += p.scale
    let mut vm = Vm::new(VmConfig::for_testing());
    run(
        &mut vm,
        vec![
            class("Point", vec![assign("scale", Expr::int(2))]),
            assign("p", Expr::name("Point").call(vec![])),
            assign("total", Expr::int(0)),
            Stmt::for_(
                Expr::name("i"),
                range(50),
                vec![
                    when_i_is(25, vec![Stmt::assign(Expr::name("Point").attr("scale"), Expr::int(10))]),
                    aug("total", Expr::name("p").attr("scale")),
                ],
            ),
        ],
    )
    .unwrap();

    assert_eq!(int(&vm, "total"), Some(25 * 2 + 25 * 10));
    let stats = vm.stats();
    assert!(stats.plans_discarded >= 1, "{stats:?}");
    assert!(stats.plans_built >= 2, "{stats:?}");
    assert!(vm.registry().stats().invalidated >= 1);
}

#[test]
fn test_instance_attribute_shadows_class_attribute() {
    let mut vm = Vm::new(VmConfig::for_testing());
    run(
        &mut vm,
        vec![
            class("Box", vec![assign("size", Expr::int(1))]),
            assign("b", Expr::name("Box").call(vec![])),
            assign("total", Expr::int(0)),
            Stmt::for_(
                Expr::name("i"),
                range(40),
                vec![
                    when_i_is(30, vec![Stmt::assign(Expr::name("b").attr("size"), Expr::int(100))]),
                    aug("total", Expr::name("b").attr("size")),
                ],
            ),
        ],
    )
    .unwrap();
    assert_eq!(int(&vm, "total"), Some(30 + 10 * 100));
    // The first decline rebuilds the plan without the attribute site.
    let stats = vm.stats();
    assert_eq!(stats.bailouts.count(BailoutReason::FastPathDeclined), 1, "{stats:?}");
    assert!(stats.plans_built >= 2, "{stats:?}");
}

#[test]
fn test_shared_registry_sees_both_vms() {
    let registry = Arc::new(InvalidationRegistry::new());
    let mut first = Vm::with_registry(VmConfig::for_testing(), Arc::clone(&registry));
    let second = Vm::with_registry(VmConfig::for_testing(), Arc::clone(&registry));
    assert!(Arc::ptr_eq(first.registry(), second.registry()));

    run(
        &mut first,
        vec![
            class("K", vec![assign("v", Expr::int(1))]),
            assign("k", Expr::name("K").call(vec![])),
            assign("total", Expr::int(0)),
            Stmt::for_(Expr::name("i"), range(20), vec![aug("total", Expr::name("k").attr("v"))]),
        ],
    )
    .unwrap();
    assert!(registry.stats().watchers >= 1);
}

// =============================================================================
// Branches
// =============================================================================

#[test]
fn test_branch_prediction_and_unlikely_exit() {
    // for i in range(400): if i < 390: a += 1 else: b += 1
    let mut vm = Vm::new(VmConfig::for_testing());
    run(
        &mut vm,
        vec![
            assign("a", Expr::int(0)),
            assign("b", Expr::int(0)),
            Stmt::for_(
                Expr::name("i"),
                range(400),
                vec![Stmt::if_(
                    Expr::name("i").compare(CmpOp::Lt, Expr::int(390)),
                    vec![aug("a", Expr::int(1))],
                    vec![aug("b", Expr::int(1))],
                )],
            ),
        ],
    )
    .unwrap();

    assert_eq!(int(&vm, "a"), Some(390));
    assert_eq!(int(&vm, "b"), Some(10));
    let stats = vm.stats();
    assert!(stats.branches.optimized >= 1, "{stats:?}");
    assert!(stats.branches.total >= stats.branches.optimized);
    assert!(stats.bailouts.count(BailoutReason::UnlikelyBranch) >= 1, "{stats:?}");
}
