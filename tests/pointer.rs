// To debug a test, try `eprintln!("{:#?}", ctx.aliases)`

use std::path::PathBuf;

use sancheck::{
    analysis::callgraph::CallGraphPass,
    analysis::context::GlobalContext,
    analysis::pass,
    analysis::pointer::PointerPass,
    llvm::{Function, Location},
    Arc, Config, Module,
};

// ------------------------------------------------------------------
// Helpers

fn fixture(name: &str) -> Module {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    Module::from_path(&path).unwrap()
}

fn points_to(files: &[&str]) -> GlobalContext {
    let modules = files.iter().map(|f| fixture(f)).collect();
    let mut ctx = GlobalContext::new(modules, Config::default()).unwrap();
    pass::run(&mut CallGraphPass::new(), &mut ctx);
    pass::run(&mut PointerPass::new(), &mut ctx);
    ctx
}

fn function<'a>(ctx: &'a GlobalContext, name: &str) -> &'a Function {
    let id = ctx.index.resolve(&ctx.modules, 0, name).unwrap();
    ctx.function(id)
}

fn result(f: &Function, block: usize, index: usize) -> Arc<sancheck::llvm::Operand> {
    f.instruction_at(Location::new(block, index))
        .and_then(|i| i.result())
        .unwrap()
        .clone()
}

// ------------------------------------------------------------------
// Tests

#[test]
fn pointer_loaded_from_memory() {
    let ctx = points_to(&["alias.ll"]);
    let f = function(&ctx, "alias_check");
    let x = result(f, 0, 0);
    let pp = result(f, 0, 1);
    let xb = result(f, 0, 2);
    let p = result(f, 0, 5);

    assert!(ctx.aliases.may_alias(&x, &xb));
    assert!(ctx.aliases.may_alias(&p, &x));
    assert!(ctx.aliases.may_alias(&p, &xb));
    assert!(!ctx.aliases.may_alias(&pp, &x));

    let aliases = ctx.aliases.aliases(&x);
    for v in [&x, &xb, &p] {
        assert!(aliases.contains(v), "{} aliases {}", v, x);
    }
    assert!(!aliases.contains(&pp));
}

#[test]
fn values_are_not_pointers() {
    let ctx = points_to(&["alias.ll"]);
    let f = function(&ctx, "alias_check");
    let pv = result(f, 0, 6);
    assert_eq!(ctx.aliases.points_to(&pv).count(), 0);
    assert_eq!(ctx.aliases.aliases(&pv).len(), 1);
}

#[test]
fn copies_through_memcpy() {
    let ctx = points_to(&["dataflow.ll"]);
    let f = function(&ctx, "fetch_copy_use");
    let kbuf = result(f, 0, 0);
    let tmp = result(f, 0, 1);
    let kb = result(f, 0, 2);
    let tb = result(f, 0, 4);
    assert!(ctx.aliases.may_alias(&kb, &kbuf));
    assert!(ctx.aliases.may_alias(&tb, &tmp));
    // Copying contents does not make the buffers alias
    assert!(!ctx.aliases.may_alias(&kb, &tb));
}

#[test]
fn external_results_are_fresh_objects() {
    let ctx = points_to(&["dataflow.ll"]);
    let f = function(&ctx, "memdup_use");
    let p = result(f, 0, 0);
    let q = result(f, 0, 1);
    assert_eq!(ctx.aliases.points_to(&p).count(), 1);
    assert!(ctx.aliases.may_alias(&p, &q));
}

#[test]
fn through_mutual_recursion() {
    let ctx = points_to(&["recursion.ll"]);
    let ping = function(&ctx, "ping");
    let pong = function(&ctx, "pong");
    let first = function(&ctx, "first");
    let second = function(&ctx, "second");
    let a = result(first, 0, 0);
    let b = result(second, 0, 0);

    // Arguments reach the parameters of both functions, from both callers
    for param in [&ping.parameters[0], &pong.parameters[0]] {
        assert!(ctx.aliases.may_alias(param, &a), "{} and {}", param, a);
        assert!(ctx.aliases.may_alias(param, &b), "{} and {}", param, b);
    }

    // Returned pointers flow back to every call site
    for r in [result(first, 0, 1), result(second, 0, 1), result(ping, 2, 1)] {
        assert!(ctx.aliases.may_alias(&r, &a));
        assert_eq!(ctx.aliases.points_to(&r).count(), 2);
    }

    assert!(!ctx.aliases.may_alias(&a, &b));
    // Integers are not pointers
    let n = ping.parameters[1].clone();
    assert_eq!(ctx.aliases.points_to(&n).count(), 0);
}

#[test]
fn solved_once() {
    let mut ctx = points_to(&["alias.ll", "dataflow.ll"]);
    let before = ctx.aliases.len();
    assert!(before > 0);
    pass::run(&mut PointerPass::new(), &mut ctx);
    assert_eq!(ctx.aliases.len(), before);
}
