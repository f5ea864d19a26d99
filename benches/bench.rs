use std::path::PathBuf;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use sancheck::{
    analysis::callgraph::CallGraphPass,
    analysis::context::GlobalContext,
    analysis::pass,
    analysis::{identify_missing_checks, identify_sanity_checks},
    Config, Module,
};

// ------------------------------------------------------------------
// Helpers (same as in tests)

fn fixture(name: &str) -> Module {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    Module::from_path(&path).unwrap()
}

fn context(files: &[&str]) -> GlobalContext {
    let modules = files.iter().map(|f| fixture(f)).collect();
    GlobalContext::new(modules, Config::default()).unwrap()
}

const ALL: &[&str] = &[
    "callgraph.ll",
    "callgraph_escape.ll",
    "checks.ll",
    "dataflow.ll",
    "missing.ll",
    "alias.ll",
];

// ------------------------------------------------------------------

pub fn callgraph(c: &mut Criterion) {
    c.bench_function("callgraph(all)", |b| {
        b.iter_batched(
            || context(ALL),
            |mut ctx| {
                pass::run(&mut CallGraphPass::new(), &mut ctx);
                black_box(ctx.callgraph.edges())
            },
            BatchSize::SmallInput,
        )
    });
}

pub fn sanity_checks(c: &mut Criterion) {
    c.bench_function("identify_sanity_checks(checks)", |b| {
        b.iter_batched(
            || context(&["checks.ll"]),
            |mut ctx| {
                identify_sanity_checks(&mut ctx);
                black_box(ctx.counters.security_checks)
            },
            BatchSize::SmallInput,
        )
    });
}

pub fn missing_checks(c: &mut Criterion) {
    c.bench_function("identify_missing_checks(all)", |b| {
        b.iter_batched(
            || context(ALL),
            |mut ctx| black_box(identify_missing_checks(&mut ctx)),
            BatchSize::SmallInput,
        )
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = callgraph, sanity_checks, missing_checks
}
criterion_main!(benches);
