//! Baseline vs specialized execution.
//!
//! Every program runs under `VmConfig::baseline_only()` and the default
//! config so the groups show what guarded fast paths buy and what feedback
//! collection costs.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use kite_compiler::{CompiledCode, CompilerConfig, compile_module};
use kite_core::ast::{BinOp, ClassDef, CmpOp, Expr, Module, Stmt, StmtKind};
use kite_vm::{Vm, VmConfig};
use std::sync::Arc;

// =============================================================================
// Benchmark Helpers
// =============================================================================

fn compile(body: Vec<Stmt>) -> Arc<CompiledCode> {
    compile_module(&Module::new(body), &CompilerConfig::default()).unwrap()
}

fn configs() -> [(&'static str, VmConfig); 2] {
    [("baseline", VmConfig::baseline_only()), ("specialized", VmConfig::default())]
}

fn aug(name: &str, value: Expr) -> Stmt {
    Stmt::new(StmtKind::AugAssign { target: Expr::name(name), op: BinOp::Add, value })
}

/// total = 0; i = 0; while i < n: total += i * 2; i += 1
fn int_loop(n: i64) -> Arc<CompiledCode> {
    compile(vec![
        Stmt::assign(Expr::name("total"), Expr::int(0)),
        Stmt::assign(Expr::name("i"), Expr::int(0)),
        Stmt::while_(
            Expr::name("i").compare(CmpOp::Lt, Expr::int(n)),
            vec![
                aug("total", Expr::name("i").binop(BinOp::Mul, Expr::int(2))),
                aug("i", Expr::int(1)),
            ],
        ),
    ])
}

/// def sq(x): return x * x; for i in range(n): total += sq(i) + abs(i)
fn call_loop(n: i64) -> Arc<CompiledCode> {
    compile(vec![
        Stmt::def("sq", &["x"], vec![Stmt::ret(Some(Expr::name("x").binop(BinOp::Mul, Expr::name("x"))))]),
        Stmt::assign(Expr::name("total"), Expr::int(0)),
        Stmt::for_(
            Expr::name("i"),
            Expr::name("range").call(vec![Expr::int(n)]),
            vec![aug(
                "total",
                Expr::name("sq")
                    .call(vec![Expr::name("i")])
                    .add(Expr::name("abs").call(vec![Expr::name("i")])),
            )],
        ),
    ])
}

/// class P: k = 3; p = P(); for i in range(n): total += p.k
fn attr_loop(n: i64) -> Arc<CompiledCode> {
    compile(vec![
        Stmt::new(StmtKind::ClassDef(Box::new(ClassDef {
            name: "P".to_string(),
            bases: vec![],
            body: vec![Stmt::assign(Expr::name("k"), Expr::int(3))],
            decorators: vec![],
        }))),
        Stmt::assign(Expr::name("p"), Expr::name("P").call(vec![])),
        Stmt::assign(Expr::name("total"), Expr::int(0)),
        Stmt::for_(
            Expr::name("i"),
            Expr::name("range").call(vec![Expr::int(n)]),
            vec![aug("total", Expr::name("p").attr("k"))],
        ),
    ])
}

fn bench_program(c: &mut Criterion, group_name: &str, build: fn(i64) -> Arc<CompiledCode>) {
    let mut group = c.benchmark_group(group_name);
    for n in [1_000i64, 10_000] {
        let code = build(n);
        for (label, config) in configs() {
            group.bench_with_input(BenchmarkId::new(label, n), &code, |b, code| {
                b.iter(|| {
                    let mut vm = Vm::new(config.clone());
                    black_box(vm.execute(Arc::clone(code)).unwrap())
                });
            });
        }
    }
    group.finish();
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_int_arithmetic(c: &mut Criterion) {
    bench_program(c, "int_loop", int_loop);
}

fn bench_calls(c: &mut Criterion) {
    bench_program(c, "call_loop", call_loop);
}

fn bench_attributes(c: &mut Criterion) {
    bench_program(c, "attr_loop", attr_loop);
}

fn bench_warm_vm(c: &mut Criterion) {
    let mut group = c.benchmark_group("warm_repeated_execution");
    let code = int_loop(200);
    for (label, config) in configs() {
        group.bench_function(label, |b| {
            let mut vm = Vm::new(config.clone());
            for _ in 0..10 {
                let _ = vm.execute(Arc::clone(&code));
            }
            b.iter(|| black_box(vm.execute(Arc::clone(&code)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_int_arithmetic,
    bench_calls,
    bench_attributes,
    bench_warm_vm,
);

criterion_main!(benches);
