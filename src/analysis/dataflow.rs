// SPDX-License-Identifier: BSD-3-Clause
//! Forward and backward tracking of critical variables
//!
//! Forward: from a source to the places it is used ([`find_uses`]).
//! Backward: from a critical variable to its sources and to the other
//! critical variables sharing its origin ([`find_source_cv`]).
//!
//! Both directions cross function boundaries through the callgraph and keep
//! an explicit visited set per query.

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::{
    arc::Arc,
    config::ArgIndex,
    llvm::instruction::{Call, Opcode},
    llvm::{Function, Inst, Location, Operand, TerminatorOpcode},
};

use super::context::{FuncId, GlobalContext, Site};

/// An API argument: a data-fetch function's destination, an entry point's
/// parameter, or the argument a critical variable is passed as
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct ApiKey {
    pub function: String,
    pub arg: ArgIndex,
}

impl ApiKey {
    pub fn new(function: impl Into<String>, arg: ArgIndex) -> Self {
        ApiKey {
            function: function.into(),
            arg,
        }
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.function, self.arg)
    }
}

/// Callee name used for calls through function pointers
pub const INDIRECT: &str = "<indirect>";

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Written by a data-fetch function
    Fetch,
    /// Parameter of an entry point
    Parameter,
    /// Returned by a function without a definition
    External,
    /// Origin not found; the value is its own source
    Unresolved,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Source {
    pub value: Arc<Operand>,
    pub key: ApiKey,
    pub kind: SourceKind,
    /// The fetch call, or the entry of the function
    pub site: Site,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Use {
    pub value: Arc<Operand>,
    pub key: ApiKey,
    pub site: Site,
    /// Where the forward tracking started
    pub border: Site,
    /// The call or return through which tracking first left the function
    /// of `border`, if it did
    pub exit: Option<Site>,
}

/// Sources and same-origin critical variables of a critical variable
#[derive(Clone, Debug, Default)]
pub struct Origins {
    pub sources: FxHashSet<Source>,
    pub cvs: FxHashSet<Arc<Operand>>,
}

impl Origins {
    pub fn values(&self) -> FxHashSet<Arc<Operand>> {
        self.cvs
            .iter()
            .cloned()
            .chain(self.sources.iter().map(|s| s.value.clone()))
            .collect()
    }

    pub fn has_source_value(&self, value: &Arc<Operand>) -> bool {
        self.sources.iter().any(|s| &s.value == value)
    }
}

/// Where a backward search leaves a function
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Escape {
    /// Reaches the given parameter
    Parameter(FuncId, usize),
    /// Reaches the result of a call to a defined function
    Return(Site),
}

pub fn collect_succ_reach_blocks(f: &Function, block: usize) -> FxHashSet<usize> {
    let mut reach = FxHashSet::default();
    let mut worklist = vec![block];
    while let Some(b) = worklist.pop() {
        if reach.insert(b) {
            worklist.extend(f.successors(b));
        }
    }
    reach
}

pub fn collect_pred_reach_blocks(f: &Function, block: usize) -> FxHashSet<usize> {
    let mut reach = FxHashSet::default();
    let mut worklist = vec![block];
    while let Some(b) = worklist.pop() {
        if reach.insert(b) {
            worklist.extend(f.predecessors(b).iter().copied());
        }
    }
    reach
}

fn belongs_to(f: &Function, value: &Arc<Operand>) -> bool {
    !value.is_local() || f.definition(value).is_some() || f.parameter_index(value).is_some()
}

/// Pointers in `f` that may point where `addr` points, `addr` included
pub fn get_alias_pointers(
    ctx: &GlobalContext,
    f: &Function,
    addr: &Arc<Operand>,
) -> FxHashSet<Arc<Operand>> {
    let mut out: FxHashSet<_> = ctx
        .aliases
        .aliases(addr)
        .into_iter()
        .filter(|a| belongs_to(f, a))
        .collect();
    out.insert(addr.clone());
    out
}

fn same_memory(
    ctx: &GlobalContext,
    f: &Function,
    a: &Arc<Operand>,
    b: &Arc<Operand>,
    alias: bool,
) -> bool {
    f.strip_casts(a) == f.strip_casts(b) || (alias && ctx.aliases.may_alias(a, b))
}

/// Results of the loads in `f` reading the memory at `pointer`
fn loads_from(
    ctx: &GlobalContext,
    f: &Function,
    pointer: &Arc<Operand>,
    alias: bool,
) -> Vec<Arc<Operand>> {
    let mut out = Vec::new();
    for (_, inst) in f.instructions() {
        if let (Some(Opcode::Load(l)), Some(r)) = (inst.opcode(), inst.result()) {
            if same_memory(ctx, f, &l.pointer, pointer, alias) {
                out.push(r.clone());
            }
        }
    }
    out
}

/// Values written into the memory at `pointer` by stores and copy functions
fn writes_to(
    ctx: &GlobalContext,
    f: &Function,
    pointer: &Arc<Operand>,
    alias: bool,
) -> Vec<Arc<Operand>> {
    let mut out = Vec::new();
    for (_, inst) in f.instructions() {
        match inst.opcode() {
            Some(Opcode::Store(s)) if same_memory(ctx, f, &s.pointer, pointer, alias) => {
                out.push(s.value.clone());
            }
            _ => {
                let call = match inst.call() {
                    Some(c) => c,
                    None => continue,
                };
                let spec = match ctx.callee_name(call).and_then(|n| ctx.tables.copy.get(n)) {
                    Some(s) => s,
                    None => continue,
                };
                let dst = match call.arg(spec.dst) {
                    Some(d) => d,
                    None => continue,
                };
                if same_memory(ctx, f, dst, pointer, alias) {
                    if let Some(src) = call.arg(spec.src) {
                        out.push(src.clone());
                    }
                }
            }
        }
    }
    out
}

/// Track a source forward to its uses. A use is a critical variable passed
/// to a function without an analyzed definition. Values already in
/// `visited` are not expanded again.
pub fn find_uses(
    ctx: &GlobalContext,
    border: Site,
    value: &Arc<Operand>,
    uses: &mut FxHashSet<Use>,
    visited: &mut FxHashSet<Arc<Operand>>,
) {
    let mut worklist = vec![(border.func, value.clone(), None)];
    while let Some((fid, v, exit)) = worklist.pop() {
        if !visited.insert(v.clone()) {
            continue;
        }
        let f = ctx.function(fid);

        // Dereferences of a tracked pointer
        for l in loads_from(ctx, f, &v, true) {
            worklist.push((fid, l, exit));
        }

        for loc in f.users(&v) {
            let site = Site::new(fid, *loc);
            match f.instruction_at(*loc) {
                Some(Inst::Instruction(i)) => match &i.opcode {
                    Opcode::Store(s) => {
                        if s.value == v {
                            for l in loads_from(ctx, f, &s.pointer, true) {
                                worklist.push((fid, l, exit));
                            }
                        }
                    }
                    Opcode::Call(call) => {
                        worklist.extend(through_call(
                            ctx,
                            site,
                            call,
                            i.result.as_ref(),
                            &v,
                            (border, exit),
                            uses,
                        ));
                    }
                    // Comparisons are checks, not flows
                    Opcode::Icmp(_) => (),
                    _ => {
                        if let Some(r) = &i.result {
                            worklist.push((fid, r.clone(), exit));
                        }
                    }
                },
                Some(Inst::Terminator(t)) => match &t.opcode {
                    TerminatorOpcode::Ret(Some(r)) if *r == v => {
                        for caller in ctx.callers(fid).filter(|c| !ctx.is_skipped(c.func)) {
                            let result = ctx
                                .function(caller.func)
                                .instruction_at(caller.loc)
                                .and_then(|i| i.result());
                            if let Some(r) = result {
                                worklist.push((caller.func, r.clone(), exit.or(Some(site))));
                            }
                        }
                    }
                    TerminatorOpcode::Invoke(inv) => {
                        worklist.extend(through_call(
                            ctx,
                            site,
                            &inv.call,
                            t.result.as_ref(),
                            &v,
                            (border, exit),
                            uses,
                        ));
                    }
                    _ => (),
                },
                None => (),
            }
        }
    }
}

/// Where a tracked value passed to a call flows next
fn through_call(
    ctx: &GlobalContext,
    site: Site,
    call: &Call,
    result: Option<&Arc<Operand>>,
    v: &Arc<Operand>,
    (border, exit): (Site, Option<Site>),
    uses: &mut FxHashSet<Use>,
) -> Vec<(FuncId, Arc<Operand>, Option<Site>)> {
    let mut next = Vec::new();
    let positions: Vec<usize> = call
        .args
        .iter()
        .enumerate()
        .filter(|(_, a)| *a == v)
        .map(|(i, _)| i)
        .collect();
    if positions.is_empty() {
        return next;
    }
    let name = ctx.callee_name(call);

    if let Some(spec) = name.and_then(|n| ctx.tables.copy.get(n)) {
        if positions.iter().any(|i| ArgIndex::Arg(*i) == spec.src) {
            match spec.dst {
                ArgIndex::Return => next.extend(result.map(|r| (site.func, r.clone(), exit))),
                dst => next.extend(call.arg(dst).map(|d| (site.func, d.clone(), exit))),
            }
        }
        return next;
    }
    if name.map_or(false, |n| ctx.tables.fetch.contains(n) || n.starts_with("llvm.")) {
        return next;
    }

    let targets: Vec<FuncId> = ctx.targets(site).filter(|t| !ctx.is_skipped(*t)).collect();
    if targets.is_empty() {
        for i in positions {
            let u = Use {
                value: v.clone(),
                key: ApiKey::new(name.unwrap_or(INDIRECT), ArgIndex::Arg(i)),
                site,
                border,
                exit,
            };
            trace!("Use {} at {}", u.key, ctx.describe(site));
            uses.insert(u);
        }
    } else {
        for t in targets {
            let params = &ctx.function(t).parameters;
            for i in &positions {
                if let Some(p) = params.get(*i) {
                    next.push((t, p.clone(), exit.or(Some(site))));
                }
            }
        }
    }
    next
}

/// All values `value` depends on within `f`: operands of its definition,
/// recursively, and what was written to the memory it was loaded from
pub fn perform_backward_analysis(
    ctx: &GlobalContext,
    f: &Function,
    value: &Arc<Operand>,
    alias: bool,
) -> FxHashSet<Arc<Operand>> {
    let mut slice = FxHashSet::default();
    let mut worklist = vec![value.clone()];
    while let Some(v) = worklist.pop() {
        if !v.is_local() || !slice.insert(v.clone()) {
            continue;
        }
        let opcode = match f
            .definition(&v)
            .and_then(|l| f.instruction_at(l))
            .and_then(|i| i.opcode())
        {
            Some(o) => o,
            None => continue,
        };
        match opcode {
            Opcode::Load(l) => {
                worklist.push(l.pointer.clone());
                worklist.extend(writes_to(ctx, f, &l.pointer, alias));
            }
            Opcode::Call(call) => {
                let spec = ctx.callee_name(call).and_then(|n| ctx.tables.copy.get(n));
                if let Some(spec) = spec.filter(|s| s.dst == ArgIndex::Return) {
                    worklist.extend(call.arg(spec.src).cloned());
                }
            }
            Opcode::Alloca => (),
            other => worklist.extend(other.operands()),
        }
    }
    slice
}

/// Backward search for one value inside one function. Returns where the
/// search leaves the function.
pub fn find_in_func_source_cv(
    ctx: &GlobalContext,
    func: FuncId,
    value: &Arc<Operand>,
    origins: &mut Origins,
    tracked: &mut FxHashSet<Arc<Operand>>,
    alias: bool,
) -> Vec<Escape> {
    let f = ctx.function(func);
    let mut escapes = Vec::new();
    let before = origins.sources.len();
    let mut pointers = Vec::new();
    let mut fresh = Vec::new();
    let mut overlapped = false;

    for v in perform_backward_analysis(ctx, f, value, alias) {
        if !tracked.insert(v.clone()) {
            overlapped = true;
            continue;
        }
        origins.cvs.insert(v.clone());
        fresh.push(v.clone());
        if let Some(i) = f.parameter_index(&v) {
            escapes.push(Escape::Parameter(func, i));
            continue;
        }
        let loc = match f.definition(&v) {
            Some(l) => l,
            None => continue,
        };
        let inst = match f.instruction_at(loc) {
            Some(i) => i,
            None => continue,
        };
        if let Some(Opcode::Load(l)) = inst.opcode() {
            pointers.push(l.pointer.clone());
        } else if let Some(call) = inst.call() {
            let site = Site::new(func, loc);
            let name = ctx.callee_name(call);
            if let Some(spec) = name.and_then(|n| ctx.tables.fetch.get(n)) {
                if spec.dst == ArgIndex::Return {
                    origins.sources.insert(Source {
                        value: v.clone(),
                        key: ApiKey::new(name.unwrap_or(INDIRECT), ArgIndex::Return),
                        kind: SourceKind::Fetch,
                        site,
                    });
                }
            } else if name.map_or(false, |n| ctx.tables.copy.contains(n)) {
                // Already followed to the copied value
            } else if ctx.targets(site).any(|t| !ctx.is_skipped(t)) {
                escapes.push(Escape::Return(site));
            } else {
                origins.sources.insert(Source {
                    value: v.clone(),
                    key: ApiKey::new(name.unwrap_or(INDIRECT), ArgIndex::Return),
                    kind: SourceKind::External,
                    site,
                });
            }
        }
    }

    for p in &pointers {
        // Same-origin loads
        origins.cvs.extend(loads_from(ctx, f, p, alias));
        if alias {
            find_source_cv_alias_in(ctx, f, p, &mut origins.cvs);
        }
    }

    // Memory filled by a fetch: loaded from, or the source of a copy
    for p in pointers.iter().chain(fresh.iter()) {
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
            if let Some(dst) = call.arg(spec.dst) {
                if same_memory(ctx, f, dst, p, alias) {
                    origins.sources.insert(Source {
                        value: dst.clone(),
                        key: ApiKey::new(name, spec.dst),
                        kind: SourceKind::Fetch,
                        site: Site::new(func, loc),
                    });
                }
            }
        }
    }

    if escapes.is_empty() && !overlapped && origins.sources.len() == before {
        trace!("Unresolved origin for {}", value);
        origins.sources.insert(Source {
            value: value.clone(),
            key: ApiKey::new(f.name.get(), ArgIndex::Return),
            kind: SourceKind::Unresolved,
            site: Site::new(func, f.definition(value).unwrap_or(Location::new(0, 0))),
        });
    }
    escapes
}

fn find_source_cv_alias_in(
    ctx: &GlobalContext,
    f: &Function,
    pointer: &Arc<Operand>,
    cvs: &mut FxHashSet<Arc<Operand>>,
) {
    for a in get_alias_pointers(ctx, f, pointer) {
        cvs.insert(a.clone());
        cvs.extend(loads_from(ctx, f, &a, false));
    }
}

fn find_source_cv_with(
    ctx: &GlobalContext,
    func: FuncId,
    value: &Arc<Operand>,
    alias: bool,
    origins: &mut Origins,
    tracked: &mut FxHashSet<Arc<Operand>>,
) {
    let mut worklist = vec![(func, value.clone())];
    while let Some((fid, v)) = worklist.pop() {
        if tracked.contains(&v) {
            continue;
        }
        for escape in find_in_func_source_cv(ctx, fid, &v, origins, tracked, alias) {
            match escape {
                Escape::Parameter(callee, i) => {
                    let f = ctx.function(callee);
                    let param = f.parameters[i].clone();
                    let site = Site::new(callee, Location::new(0, 0));
                    if ctx.tables.entry_points.contains(f.name.get()) {
                        origins.sources.insert(Source {
                            value: param,
                            key: ApiKey::new(f.name.get(), ArgIndex::Arg(i)),
                            kind: SourceKind::Parameter,
                            site,
                        });
                        continue;
                    }
                    let mut any = false;
                    for caller in ctx.callers(callee).filter(|c| !ctx.is_skipped(c.func)) {
                        if let Some(arg) = ctx.call_at(caller).and_then(|c| c.args.get(i)) {
                            any = true;
                            worklist.push((caller.func, arg.clone()));
                        }
                    }
                    if !any {
                        origins.sources.insert(Source {
                            value: param,
                            key: ApiKey::new(f.name.get(), ArgIndex::Arg(i)),
                            kind: SourceKind::Unresolved,
                            site,
                        });
                    }
                }
                Escape::Return(site) => {
                    for t in ctx.targets(site).filter(|t| !ctx.is_skipped(*t)) {
                        let callee = ctx.function(t);
                        for b in callee.return_blocks() {
                            if let TerminatorOpcode::Ret(Some(r)) = &callee.blocks[b].terminator.opcode
                            {
                                worklist.push((t, r.clone()));
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Sources of `value` (defined in `func`) and the critical variables
/// sharing its origin, across functions
pub fn find_source_cv(ctx: &GlobalContext, func: FuncId, value: &Arc<Operand>) -> Origins {
    let mut origins = Origins::default();
    let mut tracked = FxHashSet::default();
    find_source_cv_with(ctx, func, value, false, &mut origins, &mut tracked);
    origins
}

/// Like [`find_source_cv`], and values that may alias `pointer`, the
/// pointer `value` was loaded from, also count as critical
pub fn find_source_cv_alias(
    ctx: &GlobalContext,
    func: FuncId,
    value: &Arc<Operand>,
    pointer: &Arc<Operand>,
) -> Origins {
    let mut origins = Origins::default();
    let mut tracked = FxHashSet::default();
    find_source_cv_alias_in(ctx, ctx.function(func), pointer, &mut origins.cvs);
    find_source_cv_with(ctx, func, value, true, &mut origins, &mut tracked);
    origins
}

#[cfg(test)]
mod tests {
    use super::ApiKey;
    use crate::config::ArgIndex;

    #[test]
    fn api_keys_display_and_order() {
        let a = ApiKey::new("copy_from_user", ArgIndex::Arg(0));
        let b = ApiKey::new("copy_from_user", ArgIndex::Return);
        let c = ApiKey::new("get_user", ArgIndex::Arg(0));
        assert_eq!(a.to_string(), "copy_from_user:arg0");
        assert_eq!(b.to_string(), "copy_from_user:ret");
        assert!(b < a);
        assert!(a < c);
    }
}
