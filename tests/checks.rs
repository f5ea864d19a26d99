// To debug a test, try `eprintln!("{:#?}", ctx.checks[&id])`

use std::path::PathBuf;

use sancheck::{
    analysis::checks::{CheckKind, ScCondition, ScOperator},
    analysis::context::{FuncId, GlobalContext},
    analysis::identify_sanity_checks,
    lattice::ErrFlags,
    ArgIndex, Config, Module,
};

// ------------------------------------------------------------------
// Helpers

fn fixture(name: &str) -> Module {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    Module::from_path(&path).unwrap()
}

fn analyze(config: Config) -> GlobalContext {
    let mut ctx = GlobalContext::new(vec![fixture("checks.ll")], config).unwrap();
    identify_sanity_checks(&mut ctx);
    ctx
}

fn func(ctx: &GlobalContext, name: &str) -> FuncId {
    ctx.index.resolve(&ctx.modules, 0, name).unwrap()
}

/// Labels of the blocks holding a check
fn check_blocks(ctx: &GlobalContext, name: &str) -> Vec<String> {
    let id = func(ctx, name);
    let f = ctx.function(id);
    ctx.checks[&id]
        .checks
        .iter()
        .map(|c| f.blocks[c.block].name().label().to_string())
        .collect()
}

fn assert_checks(ctx: &GlobalContext, name: &str, expected: &[&str]) {
    assert_eq!(check_blocks(ctx, name), expected, "checks of {}", name);
}

// ------------------------------------------------------------------
// Shapes

#[test]
fn branch_to_error_return() {
    let ctx = analyze(Config::default());
    assert_checks(&ctx, "null_check", &["entry"]);
    let fc = &ctx.checks[&func(&ctx, "null_check")];
    assert_eq!(fc.checks[0].kind, CheckKind::Branch);
    assert_eq!(fc.checks[0].compares.len(), 1);
    // entry -> err carries the error, entry -> ok does not
    assert_eq!(fc.flags.get((0, 1)).effective(), ErrFlags::MUST_RETURN_ERR);
    assert!(fc.flags.get((0, 2)).is_empty());
}

#[test]
fn error_through_return_slot() {
    let ctx = analyze(Config::default());
    assert_checks(&ctx, "retval_slot", &["entry"]);
}

#[test]
fn error_through_phi() {
    let ctx = analyze(Config::default());
    assert_checks(&ctx, "phi_return", &["entry"]);
}

#[test]
fn error_handling_calls() {
    let ctx = analyze(Config::default());
    assert_checks(&ctx, "handled", &["entry"]);
    assert_checks(&ctx, "bug_on", &["entry"]);
}

#[test]
fn no_error_no_check() {
    let ctx = analyze(Config::default());
    assert_checks(&ctx, "no_check", &[]);
    assert_checks(&ctx, "bool_return", &[]);
    assert_eq!(
        ctx.checks[&func(&ctx, "no_check")].conditional_statements,
        1
    );
}

#[test]
fn both_sides_failing_is_not_a_check() {
    let ctx = analyze(Config::default());
    assert_checks(&ctx, "all_fail", &["entry"]);
    assert_eq!(
        ctx.checks[&func(&ctx, "all_fail")].conditional_statements,
        2
    );
}

#[test]
fn switch_cases_are_compared() {
    let ctx = analyze(Config::default());
    assert_checks(&ctx, "switch_check", &["entry"]);
    let check = &ctx.checks[&func(&ctx, "switch_check")].checks[0];
    assert_eq!(check.compares.len(), 2);
}

#[test]
fn select_of_error_code() {
    let ctx = analyze(Config::default());
    let fc = &ctx.checks[&func(&ctx, "select_check")];
    assert_eq!(fc.conditional_statements, 0);
    assert_eq!(fc.checks.len(), 1);
    assert_eq!(fc.checks[0].kind, CheckKind::Select);
    assert_eq!(fc.checks[0].compares.len(), 1);
}

#[test]
fn null_pointer_return() {
    let ctx = analyze(Config::default());
    assert_checks(&ctx, "null_return", &["entry"]);
}

#[test]
fn loops() {
    let ctx = analyze(Config::default());
    assert_checks(&ctx, "loop_check", &["body"]);
    assert_checks(&ctx, "self_loop", &["spin"]);
}

// ------------------------------------------------------------------
// Whole module

#[test]
fn counters() {
    let ctx = analyze(Config::default());
    assert_eq!(ctx.counters.security_checks, 11);
    assert_eq!(ctx.counters.conditional_statements, 14);
    assert_eq!(ctx.counters.skipped_functions, 0);
}

#[test]
fn large_functions_are_skipped() {
    let config = Config {
        max_blocks: 3,
        ..Config::default()
    };
    let ctx = analyze(config);
    assert_eq!(ctx.counters.skipped_functions, 4);
    assert!(!ctx.checks.contains_key(&func(&ctx, "loop_check")));
    assert_eq!(ctx.counters.security_checks, 7);
    assert_eq!(ctx.counters.conditional_statements, 8);
}

#[test]
fn rerun_does_not_double_count() {
    let mut ctx = analyze(Config::default());
    identify_sanity_checks(&mut ctx);
    assert_eq!(ctx.counters.security_checks, 11);
}

#[test]
fn modeled_checks() {
    use sancheck::analysis::checks::ModelSC;

    let ctx = analyze(Config::default());
    let id = func(&ctx, "null_check");
    let check = &ctx.checks[&id].checks[0];
    let x = ctx.function(id).parameters[0].clone();
    let m = ModelSC::new(check, &x, ArgIndex::Arg(0));
    assert_eq!(m.operator, ScOperator::Eq);
    assert_eq!(m.condition, ScCondition::Null);
    assert_eq!(m.arg, ArgIndex::Arg(0));

    let id = func(&ctx, "loop_check");
    let check = &ctx.checks[&id].checks[0];
    let v = check.compares[0].operand0.clone();
    let m = ModelSC::new(check, &v, ArgIndex::Return);
    assert_eq!(m.operator, ScOperator::Lt);
    assert_eq!(m.condition, ScCondition::Zero);
    assert!(m.to_string().contains("(ret)"));
}

#[test]
fn error_functions_from_config() {
    let json = r#"{ "error-handling-functions": ["use"] }"#;
    let config = Config::from_json(json).unwrap();
    let ctx = analyze(config);
    // `pr_err` is no longer known, but `use` is
    assert_checks(&ctx, "handled", &[]);
    assert_checks(&ctx, "null_check", &["entry"]);
}
