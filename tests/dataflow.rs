// To debug a test, try `eprintln!("{:#?}", uses)`

use std::path::PathBuf;

use rustc_hash::FxHashSet;

use sancheck::{
    analysis::callgraph::CallGraphPass,
    analysis::context::{FuncId, GlobalContext, Site},
    analysis::dataflow::{
        collect_pred_reach_blocks, collect_succ_reach_blocks, find_source_cv,
        find_source_cv_alias, find_uses, ApiKey, SourceKind, Use,
    },
    analysis::missing::collect_sources,
    analysis::pass,
    analysis::pointer::PointerPass,
    llvm::{Location, Operand},
    Arc, ArgIndex, Config, Module,
};

// ------------------------------------------------------------------
// Helpers

fn fixture(name: &str) -> Module {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    Module::from_path(&path).unwrap()
}

fn context(file: &str) -> GlobalContext {
    context_with(file, Config::default())
}

fn context_with(file: &str, config: Config) -> GlobalContext {
    let mut ctx = GlobalContext::new(vec![fixture(file)], config).unwrap();
    pass::run(&mut CallGraphPass::new(), &mut ctx);
    pass::run(&mut PointerPass::new(), &mut ctx);
    ctx
}

fn func(ctx: &GlobalContext, name: &str) -> FuncId {
    ctx.index.resolve(&ctx.modules, 0, name).unwrap()
}

fn result(ctx: &GlobalContext, id: FuncId, block: usize, index: usize) -> Arc<Operand> {
    ctx.function(id)
        .instruction_at(Location::new(block, index))
        .and_then(|i| i.result())
        .unwrap()
        .clone()
}

fn key(function: &str, arg: ArgIndex) -> ApiKey {
    ApiKey::new(function, arg)
}

/// Uses of the first source found in `name`
fn uses_from(ctx: &GlobalContext, name: &str) -> Vec<Use> {
    let id = func(ctx, name);
    let source = collect_sources(ctx, 0)
        .into_iter()
        .find(|s| s.site.func == id)
        .unwrap();
    let mut uses = FxHashSet::default();
    let mut visited = FxHashSet::default();
    find_uses(ctx, source.site, &source.value, &mut uses, &mut visited);
    let mut uses: Vec<Use> = uses.into_iter().collect();
    uses.sort_by(|a, b| (a.site, &a.key).cmp(&(b.site, &b.key)));
    uses
}

// ------------------------------------------------------------------
// Sources

#[test]
fn sources_of_a_module() {
    let ctx = context("dataflow.ll");
    let sources = collect_sources(&ctx, 0);
    let fetches = sources
        .iter()
        .filter(|s| s.kind == SourceKind::Fetch)
        .count();
    assert_eq!(fetches, 4);
    let params: Vec<_> = sources
        .iter()
        .filter(|s| s.kind == SourceKind::Parameter)
        .map(|s| s.key.to_string())
        .collect();
    assert_eq!(params, ["__do_sys_demo:arg0", "__do_sys_demo:arg1"]);
    assert!(sources
        .iter()
        .any(|s| s.key == key("memdup_user", ArgIndex::Return)));
}

// ------------------------------------------------------------------
// Forward, then back

#[test]
fn through_memcpy() {
    let ctx = context("dataflow.ll");
    let id = func(&ctx, "fetch_copy_use");
    let uses = uses_from(&ctx, "fetch_copy_use");
    assert_eq!(uses.len(), 1);
    let v = result(&ctx, id, 0, 6);
    assert_eq!(uses[0].value, v);
    assert_eq!(uses[0].key, key("consume", ArgIndex::Arg(0)));

    let origins = find_source_cv(&ctx, id, &v);
    let kb = result(&ctx, id, 0, 2);
    assert!(origins.has_source_value(&kb));
    assert!(origins
        .sources
        .iter()
        .all(|s| s.key == key("copy_from_user", ArgIndex::Arg(0))));
}

#[test]
fn through_returned_buffer() {
    let ctx = context("dataflow.ll");
    let id = func(&ctx, "memdup_use");
    let uses = uses_from(&ctx, "memdup_use");
    let w = result(&ctx, id, 0, 3);
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].value, w);

    let origins = find_source_cv(&ctx, id, &w);
    let p = result(&ctx, id, 0, 0);
    assert!(origins.has_source_value(&p));
    let source = origins.sources.iter().next().unwrap();
    assert_eq!(source.kind, SourceKind::Fetch);
    assert_eq!(source.key, key("memdup_user", ArgIndex::Return));
}

#[test]
fn into_callee() {
    let ctx = context("dataflow.ll");
    let caller = func(&ctx, "fetch_then_call");
    let helper = func(&ctx, "helper");
    let uses = uses_from(&ctx, "fetch_then_call");
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].site.func, helper);
    assert_eq!(uses[0].border.func, caller);
    let param = ctx.function(helper).parameters[0].clone();
    assert_eq!(uses[0].value, param);

    let origins = find_source_cv(&ctx, helper, &param);
    assert!(origins.has_source_value(&result(&ctx, caller, 0, 1)));
}

#[test]
fn recursion_terminates() {
    let ctx = context("dataflow.ll");
    let start = func(&ctx, "start_rec");
    let rec_a = func(&ctx, "rec_a");
    let uses = uses_from(&ctx, "start_rec");
    let funcs: FxHashSet<FuncId> = uses.iter().map(|u| u.site.func).collect();
    assert!(funcs.contains(&start));
    assert!(funcs.contains(&rec_a));

    let sb = result(&ctx, start, 0, 1);
    for u in &uses {
        let origins = find_source_cv(&ctx, u.site.func, &u.value);
        assert!(origins.has_source_value(&sb), "{} at {:?}", u.value, u.site);
    }
}

#[test]
fn entry_point_parameters() {
    let ctx = context("dataflow.ll");
    let id = func(&ctx, "__do_sys_demo");
    let fd = ctx.function(id).parameters[0].clone();
    let origins = find_source_cv(&ctx, id, &fd);
    assert_eq!(origins.sources.len(), 1);
    let source = origins.sources.iter().next().unwrap();
    assert_eq!(source.kind, SourceKind::Parameter);
    assert_eq!(source.key, key("__do_sys_demo", ArgIndex::Arg(0)));
}

#[test]
fn hand_off_is_the_exit() {
    let ctx = context("handoff.ll");
    let caller = func(&ctx, "hand_off_then_check");
    let uses = uses_from(&ctx, "hand_off_then_check");
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].site.func, func(&ctx, "take"));
    assert_eq!(uses[0].exit, Some(Site::new(caller, Location::new(0, 4))));

    // A use in the same function never left it
    let ctx = context("dataflow.ll");
    let uses = uses_from(&ctx, "fetch_copy_use");
    assert_eq!(uses[0].exit, None);
}

#[test]
fn parameters_reached_only_from_large_callers() {
    let ctx = context("skipped.ll");
    let id = func(&ctx, "only_from_big");
    let q = ctx.function(id).parameters[0].clone();
    let origins = find_source_cv(&ctx, id, &q);
    assert!(origins
        .sources
        .iter()
        .any(|s| s.kind == SourceKind::Fetch && s.key == key("memdup_user", ArgIndex::Return)));

    let config = Config {
        max_blocks: 2,
        ..Config::default()
    };
    let ctx = context_with("skipped.ll", config);
    let origins = find_source_cv(&ctx, id, &q);
    assert_eq!(origins.sources.len(), 1);
    let source = origins.sources.iter().next().unwrap();
    assert_eq!(source.kind, SourceKind::Unresolved);
    assert_eq!(source.key, key("only_from_big", ArgIndex::Arg(0)));
}

#[test]
fn unresolved_and_external_origins() {
    let ctx = context("dataflow.ll");
    let orphan = func(&ctx, "orphan");
    let a = ctx.function(orphan).parameters[0].clone();
    let origins = find_source_cv(&ctx, orphan, &a);
    let source = origins.sources.iter().next().unwrap();
    assert_eq!(source.kind, SourceKind::Unresolved);
    assert_eq!(source.key, key("orphan", ArgIndex::Arg(0)));

    let ext = func(&ctx, "external_use");
    let e = result(&ctx, ext, 0, 0);
    let origins = find_source_cv(&ctx, ext, &e);
    let source = origins.sources.iter().next().unwrap();
    assert_eq!(source.kind, SourceKind::External);
    assert_eq!(source.key, key("external_value", ArgIndex::Return));
}

#[test]
fn aliases_widen_critical_variables() {
    let ctx = context("alias.ll");
    let id = func(&ctx, "alias_check");
    let x = result(&ctx, id, 0, 0);
    let pv = result(&ctx, id, 0, 6);
    let xv = result(&ctx, id, 2, 0);

    let plain = find_source_cv(&ctx, id, &xv);
    assert!(!plain.cvs.contains(&pv));
    let widened = find_source_cv_alias(&ctx, id, &xv, &x);
    assert!(widened.cvs.contains(&pv));
    assert!(widened.has_source_value(&result(&ctx, id, 0, 2)));
}

// ------------------------------------------------------------------
// Reachability

#[test]
fn reach_is_inclusive() {
    let ctx = context("dataflow.ll");
    let f = ctx.function(func(&ctx, "rec_a"));
    let succ = collect_succ_reach_blocks(f, 0);
    assert_eq!(succ.len(), 3);
    let pred = collect_pred_reach_blocks(f, 2);
    assert!(pred.contains(&0) && pred.contains(&2));
    assert!(!pred.contains(&1));
    assert_eq!(collect_succ_reach_blocks(f, 1).len(), 1);
}

#[test]
fn uses_keep_their_border() {
    let ctx = context("dataflow.ll");
    let id = func(&ctx, "external_use");
    let e = result(&ctx, id, 0, 0);
    let border = Site::new(id, Location::new(0, 0));
    let mut uses = FxHashSet::default();
    find_uses(&ctx, border, &e, &mut uses, &mut FxHashSet::default());
    assert_eq!(uses.len(), 1);
    assert!(uses.iter().all(|u| u.border == border));
}
