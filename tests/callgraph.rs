use std::{collections::BTreeSet, path::PathBuf};

use sancheck::{
    analysis::callgraph::CallGraphPass,
    analysis::context::{FuncId, GlobalContext, Site},
    analysis::pass,
    Config, Module,
};

// ------------------------------------------------------------------
// Helpers

fn fixture(name: &str) -> Module {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    Module::from_path(&path).unwrap()
}

fn callgraph(files: &[&str]) -> GlobalContext {
    let modules = files.iter().map(|f| fixture(f)).collect();
    let mut ctx = GlobalContext::new(modules, Config::default()).unwrap();
    pass::run(&mut CallGraphPass::new(), &mut ctx);
    ctx
}

fn func(ctx: &GlobalContext, name: &str) -> FuncId {
    ctx.index.resolve(&ctx.modules, 0, name).unwrap()
}

/// Names of every function called from `name`
fn callees(ctx: &GlobalContext, name: &str) -> BTreeSet<String> {
    let id = func(ctx, name);
    let mut out = BTreeSet::new();
    for (loc, inst) in ctx.function(id).instructions() {
        if inst.call().is_none() {
            continue;
        }
        for t in ctx.targets(Site::new(id, loc)) {
            out.insert(ctx.function(t).name.get().to_string());
        }
    }
    out
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ------------------------------------------------------------------
// Tests

#[test]
fn direct_calls() {
    let ctx = callgraph(&["callgraph.ll"]);
    assert_eq!(callees(&ctx, "direct"), set(&["op_read", "op_other"]));
    assert_eq!(ctx.counters.indirect_calls, 4);
}

#[test]
fn struct_field_is_confined() {
    let ctx = callgraph(&["callgraph.ll"]);
    assert_eq!(callees(&ctx, "call_field"), set(&["op_read"]));
    assert_eq!(callees(&ctx, "call_release"), set(&["op_release"]));
}

#[test]
fn global_pointer_is_confined() {
    let ctx = callgraph(&["callgraph.ll"]);
    assert_eq!(callees(&ctx, "call_global"), set(&["op_other"]));
}

#[test]
fn unknown_slot_matches_signature() {
    let ctx = callgraph(&["callgraph.ll"]);
    assert_eq!(
        callees(&ctx, "call_unknown"),
        set(&["op_read", "op_other", "op_unused"])
    );
}

#[test]
fn escaped_field_across_modules() {
    let ctx = callgraph(&["callgraph.ll", "callgraph_escape.ll"]);
    assert_eq!(
        callees(&ctx, "call_field"),
        set(&["op_read", "op_other", "op_unused"])
    );
    // The other field is untouched
    assert_eq!(callees(&ctx, "call_release"), set(&["op_release"]));
}

#[test]
fn callers_mirror_callees() {
    let ctx = callgraph(&["callgraph.ll"]);
    let ping = func(&ctx, "ping");
    let pong = func(&ctx, "pong");
    assert_eq!(callees(&ctx, "ping"), set(&["pong"]));
    assert_eq!(callees(&ctx, "pong"), set(&["ping"]));
    assert!(ctx.callers(ping).all(|s| s.func == pong));
    assert_eq!(ctx.callers(pong).count(), 1);

    let op_read = func(&ctx, "op_read");
    let callers: BTreeSet<String> = ctx
        .callers(op_read)
        .map(|s| ctx.function(s.func).name.get().to_string())
        .collect();
    assert_eq!(callers, set(&["call_field", "call_unknown", "direct"]));
}

#[test]
fn counters_are_stable() {
    let mut ctx = callgraph(&["callgraph.ll"]);
    let before = ctx.counters.clone();
    pass::run(&mut CallGraphPass::new(), &mut ctx);
    assert_eq!(ctx.counters, before);
    assert_eq!(before.indirect_call_edges, 1 + 1 + 3 + 1);
}
