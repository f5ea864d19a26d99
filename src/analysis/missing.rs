// SPDX-License-Identifier: BSD-3-Clause
//! Detection of missing security checks
//!
//! Every source is tracked forward to its uses. For each source/use pair,
//! the blocks between them are searched for a security check on a critical
//! variable of the pair, first forward from the source and then backward
//! from the use. Counts are aggregated per API; an API that is checked at
//! some sites but left unchecked at a large enough share of them is
//! reported.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::{
    arc::Arc,
    config::ArgIndex,
    llvm::instruction::Opcode,
    llvm::{Function, Location, Operand},
};

use super::checks::{ModelSC, SecurityCheck};
use super::context::{Counters, FuncId, GlobalContext, Site};
use super::dataflow::{
    collect_pred_reach_blocks, collect_succ_reach_blocks, find_source_cv, find_source_cv_alias,
    find_uses, ApiKey, Source, SourceKind, Use,
};
use super::pass::ModulePass;

#[derive(Clone, Debug, Default)]
pub struct CheckCounts {
    pub checked: usize,
    pub unchecked: usize,
    pub total: usize,
    /// Checks found for this API
    pub checks: FxHashSet<ModelSC>,
    /// Occurrences without a check
    pub unchecked_sites: FxHashSet<Site>,
}

impl CheckCounts {
    fn add_check(&mut self, check: ModelSC) {
        self.checked += 1;
        self.total += 1;
        self.checks.insert(check);
    }

    fn add_uncheck(&mut self, site: Site) {
        self.unchecked += 1;
        self.total += 1;
        self.unchecked_sites.insert(site);
    }

    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.unchecked as f64 / self.total as f64
        }
    }

    /// Checked somewhere, and unchecked at more than `threshold` of the
    /// occurrences
    pub fn is_missing(&self, threshold: f64) -> bool {
        self.checked > 0 && self.unchecked > 0 && self.ratio() > threshold
    }
}

#[derive(Debug, Default)]
pub struct MissingStats {
    pub sources: FxHashMap<ApiKey, CheckCounts>,
    pub uses: FxHashMap<ApiKey, CheckCounts>,
    tracked: FxHashSet<(Source, Use)>,
}

impl MissingStats {
    /// Returns `false` if the pair was already counted.
    fn track(&mut self, source: &Source, u: &Use) -> bool {
        self.tracked.insert((source.clone(), u.clone()))
    }

    fn record(&mut self, source: &Source, u: &Use, check: Option<ModelSC>) {
        let src = self.sources.entry(source.key.clone()).or_default();
        match &check {
            Some(c) => src.add_check(ModelSC {
                arg: source.key.arg,
                ..c.clone()
            }),
            None => src.add_uncheck(source.site),
        }
        let dst = self.uses.entry(u.key.clone()).or_default();
        match check {
            Some(c) => dst.add_check(c),
            None => dst.add_uncheck(u.site),
        }
    }

    /// Number of source/use pairs counted
    pub fn pairs(&self) -> usize {
        self.tracked.len()
    }
}

/// Match `check` against the critical variables in `vset`. With `alias`,
/// a compared value that may alias a critical variable, or that was loaded
/// from memory a critical variable was loaded from, also matches.
fn match_check(
    ctx: &GlobalContext,
    f: &Function,
    check: &SecurityCheck,
    vset: &FxHashSet<Arc<Operand>>,
    alias: bool,
    arg: ArgIndex,
) -> Option<ModelSC> {
    for c in check.compared() {
        let stripped = f.strip_casts(c);
        let mut hit = vset.contains(c) || vset.contains(&stripped);
        if !hit && alias && stripped.is_local() {
            let loaded_from = |v: &Arc<Operand>| match f
                .definition(v)
                .and_then(|l| f.instruction_at(l))
                .and_then(|i| i.opcode())
            {
                Some(Opcode::Load(l)) => Some(l.pointer.clone()),
                _ => None,
            };
            let pointer = loaded_from(&stripped);
            hit = vset.iter().any(|v| {
                ctx.aliases.may_alias(&stripped, v)
                    || match (&pointer, loaded_from(v)) {
                        (Some(p), Some(q)) => ctx.aliases.may_alias(p, &q),
                        _ => false,
                    }
            });
        }
        if hit {
            return Some(ModelSC::new(check, c, arg));
        }
    }
    None
}

/// Search the blocks after `source` and before `u` for a check on the
/// critical variables. When `u` is in another function, the search stops at
/// the call or return through which the value left the source function. `depth` counts visited blocks
/// across both searches of a pair; the search gives up past the bound.
pub fn is_checked_forward(
    ctx: &GlobalContext,
    source: &Source,
    u: &Use,
    vset: &FxHashSet<Arc<Operand>>,
    depth: &mut usize,
    enable_alias: bool,
) -> Option<ModelSC> {
    let func = source.site.func;
    let f = ctx.function(func);
    let checks = ctx.checks.get(&func)?;
    let start = source.site.loc;
    let mut scope = collect_succ_reach_blocks(f, start.block);
    let end = if u.site.func == func {
        Some(u.site.loc)
    } else {
        u.exit.filter(|e| e.func == func).map(|e| e.loc)
    };
    if let Some(end) = end {
        let before = collect_pred_reach_blocks(f, end.block);
        scope.retain(|b| before.contains(b));
    }

    let mut visited = FxHashSet::default();
    let mut worklist = VecDeque::from([start.block]);
    while let Some(b) = worklist.pop_front() {
        if !scope.contains(&b) || !visited.insert(b) {
            continue;
        }
        *depth += 1;
        if *depth > ctx.config.max_depth {
            debug!("Giving up on {} at depth {}", source.key, depth);
            return None;
        }
        for check in checks.in_block(b) {
            if !within(check.location, Some(start), end) {
                continue;
            }
            if let Some(m) = match_check(ctx, f, check, vset, enable_alias, u.key.arg) {
                return Some(m);
            }
        }
        worklist.extend(f.successors(b));
    }
    None
}

/// Search the blocks before `u` (and after `source`, in the same function)
/// for a check on the critical variables.
pub fn is_checked_backward(
    ctx: &GlobalContext,
    u: &Use,
    source: &Source,
    vset: &FxHashSet<Arc<Operand>>,
    depth: &mut usize,
) -> Option<ModelSC> {
    let func = u.site.func;
    let f = ctx.function(func);
    let checks = ctx.checks.get(&func)?;
    let end = u.site.loc;
    let mut scope = collect_pred_reach_blocks(f, end.block);
    let start = (source.site.func == func).then_some(source.site.loc);
    if let Some(start) = start {
        let after = collect_succ_reach_blocks(f, start.block);
        scope.retain(|b| after.contains(b));
    }

    let mut visited = FxHashSet::default();
    let mut worklist = VecDeque::from([end.block]);
    while let Some(b) = worklist.pop_front() {
        if !scope.contains(&b) || !visited.insert(b) {
            continue;
        }
        *depth += 1;
        if *depth > ctx.config.max_depth {
            debug!("Giving up on {} at depth {}", u.key, depth);
            return None;
        }
        for check in checks.in_block(b) {
            if !within(check.location, start, Some(end)) {
                continue;
            }
            if let Some(m) = match_check(ctx, f, check, vset, false, u.key.arg) {
                return Some(m);
            }
        }
        worklist.extend(f.predecessors(b).iter().copied());
    }
    None
}

/// Positional bounds only apply within the bounding blocks themselves
fn within(loc: Location, start: Option<Location>, end: Option<Location>) -> bool {
    let after_start = start.map_or(true, |s| s.block != loc.block || loc >= s);
    let before_end = end.map_or(true, |e| e.block != loc.block || loc <= e);
    after_start && before_end
}

/// Critical variables of a pair: those sharing the origin of the used value,
/// and the source value itself
fn critical_variables(
    ctx: &GlobalContext,
    source: &Source,
    u: &Use,
    alias: bool,
) -> FxHashSet<Arc<Operand>> {
    let f = ctx.function(u.site.func);
    let origins = if alias {
        let pointer = match f
            .definition(&u.value)
            .and_then(|l| f.instruction_at(l))
            .and_then(|i| i.opcode())
        {
            Some(Opcode::Load(l)) => l.pointer.clone(),
            _ => u.value.clone(),
        };
        find_source_cv_alias(ctx, u.site.func, &u.value, &pointer)
    } else {
        find_source_cv(ctx, u.site.func, &u.value)
    };
    let mut vset = origins.values();
    vset.insert(source.value.clone());
    vset.insert(ctx.function(source.site.func).strip_casts(&source.value));
    vset
}

/// Decide whether one source/use pair is checked
pub fn evaluate_pair(ctx: &GlobalContext, source: &Source, u: &Use) -> Option<ModelSC> {
    let alias = ctx.config.alias_checks;
    let vset = critical_variables(ctx, source, u, alias);
    let mut depth = 0;
    is_checked_forward(ctx, source, u, &vset, &mut depth, alias)
        .or_else(|| is_checked_backward(ctx, u, source, &vset, &mut depth))
}

/// Sources in the functions of a module: destinations of data-fetch calls
/// and parameters of entry points
pub fn collect_sources(ctx: &GlobalContext, module: usize) -> Vec<Source> {
    let mut out = Vec::new();
    for (id, f) in ctx.module_functions(module) {
        if ctx.is_skipped(id) {
            continue;
        }
        if ctx.tables.entry_points.contains(f.name.get()) {
            for (i, p) in f.parameters.iter().enumerate() {
                out.push(Source {
                    value: p.clone(),
                    key: ApiKey::new(f.name.get(), ArgIndex::Arg(i)),
                    kind: SourceKind::Parameter,
                    site: Site::new(id, Location::new(0, 0)),
                });
            }
        }
        for (loc, inst) in f.instructions() {
            let call = match inst.call() {
                Some(c) => c,
                None => continue,
            };
            let name = match ctx.callee_name(call) {
                Some(n) => n,
                None => continue,
            };
            let spec = match ctx.tables.fetch.get(name) {
                Some(s) => s,
                None => continue,
            };
            let value = match spec.dst {
                ArgIndex::Return => inst.result(),
                dst => call.arg(dst),
            };
            if let Some(value) = value {
                out.push(Source {
                    value: value.clone(),
                    key: ApiKey::new(name, spec.dst),
                    kind: SourceKind::Fetch,
                    site: Site::new(id, loc),
                });
            }
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct MissingChecksPass {
    sources: FxHashMap<usize, Vec<Source>>,
    done: FxHashSet<FuncId>,
}

impl MissingChecksPass {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModulePass for MissingChecksPass {
    fn id(&self) -> &'static str {
        "MissingChecks"
    }

    fn initialize(&mut self, ctx: &mut GlobalContext, module: usize) -> bool {
        let sources = collect_sources(ctx, module);
        debug!("{} sources in {}", sources.len(), ctx.modules[module].name);
        self.sources.insert(module, sources);
        false
    }

    fn run_on_module(&mut self, ctx: &mut GlobalContext, module: usize) -> bool {
        let sources = match self.sources.get(&module) {
            Some(s) => s,
            None => return false,
        };
        let mut results = Vec::new();
        for source in sources {
            if self.done.contains(&source.site.func) {
                continue;
            }
            let mut uses = FxHashSet::default();
            let mut visited = FxHashSet::default();
            find_uses(ctx, source.site, &source.value, &mut uses, &mut visited);
            let mut uses: Vec<Use> = uses.into_iter().collect();
            uses.sort_by(|a, b| (a.site, &a.key).cmp(&(b.site, &b.key)));
            for u in uses {
                let check = evaluate_pair(ctx, source, &u);
                results.push((source.clone(), u, check));
            }
        }
        for source in sources {
            self.done.insert(source.site.func);
        }

        let mut changed = false;
        for (source, u, check) in results {
            if ctx.missing.track(&source, &u) {
                changed = true;
                ctx.missing.record(&source, &u, check);
            }
        }
        changed
    }

    fn finalize(&mut self, ctx: &mut GlobalContext, module: usize) {
        if module + 1 == ctx.modules.len() {
            info!(
                "{} source/use pairs, {} source APIs, {} use APIs",
                ctx.missing.pairs(),
                ctx.missing.sources.len(),
                ctx.missing.uses.len()
            );
        }
    }
}

/// One API in the report
#[derive(Clone, Debug, serde::Serialize)]
pub struct Finding {
    pub function: String,
    pub arg: ArgIndex,
    pub checked: usize,
    pub unchecked: usize,
    pub total: usize,
    pub ratio: f64,
    pub checks: Vec<String>,
    pub unchecked_sites: Vec<String>,
}

impl Finding {
    fn new(ctx: &GlobalContext, key: &ApiKey, counts: &CheckCounts) -> Self {
        let mut checks: Vec<String> = counts.checks.iter().map(ToString::to_string).collect();
        checks.sort();
        Finding {
            function: key.function.clone(),
            arg: key.arg,
            checked: counts.checked,
            unchecked: counts.unchecked,
            total: counts.total,
            ratio: counts.ratio(),
            checks,
            unchecked_sites: GlobalContext::sorted(&counts.unchecked_sites)
                .into_iter()
                .map(|s| ctx.describe(s))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct Report {
    pub counters: Counters,
    /// Sources likely missing a check
    pub sources: Vec<Finding>,
    /// Uses likely missing a check
    pub uses: Vec<Finding>,
}

/// Flag the APIs whose unchecked ratio exceeds the configured threshold
pub fn process_results(ctx: &GlobalContext) -> Report {
    let threshold = ctx.config.unchecked_ratio;
    let flagged = |stats: &FxHashMap<ApiKey, CheckCounts>| {
        let mut keys: Vec<&ApiKey> = stats
            .iter()
            .filter(|(_, c)| c.is_missing(threshold))
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        keys.into_iter()
            .map(|k| Finding::new(ctx, k, &stats[k]))
            .collect::<Vec<_>>()
    };
    Report {
        counters: ctx.counters.clone(),
        sources: flagged(&ctx.missing.sources),
        uses: flagged(&ctx.missing.uses),
    }
}

#[cfg(test)]
mod tests {
    use super::{within, CheckCounts};
    use crate::analysis::context::{FuncId, Site};
    use crate::llvm::Location;

    #[test]
    fn ratio_threshold() {
        let site = |i| Site::new(FuncId { module: 0, index: i }, Location::new(0, 0));
        let mut counts = CheckCounts::default();
        assert!(!counts.is_missing(0.1));
        counts.add_uncheck(site(0));
        // Never checked anywhere
        assert!(!counts.is_missing(0.1));
        counts.checked += 2;
        counts.total += 2;
        assert_eq!(counts.total, 3);
        assert!(counts.is_missing(0.1));
        assert!(counts.is_missing(0.3));
        assert!(!counts.is_missing(0.5));
    }

    #[test]
    fn positional_bounds() {
        let start = Some(Location::new(1, 3));
        let end = Some(Location::new(4, 2));
        assert!(within(Location::new(1, 5), start, end));
        assert!(!within(Location::new(1, 2), start, end));
        assert!(within(Location::new(2, 0), start, end));
        assert!(!within(Location::new(4, 7), start, end));
        assert!(within(Location::new(4, 1), None, end));
    }
}
