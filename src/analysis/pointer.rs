// SPDX-License-Identifier: BSD-3-Clause
//! Pointer analysis
//!
//! Inclusion-based (Andersen-style), flow- and context-insensitive, and
//! field-insensitive: a `getelementptr` points wherever its base points.
//! Calls are connected through the callgraph, so the callgraph pass must run
//! first. The whole program is solved once, with Ascent.
//!
//! Sources of unsoundness:
//!
//! - External functions other than the configured copy functions are
//!   modeled as returning fresh heap objects and touching nothing else
//! - Functions above the block ceiling are ignored
//! - Integer arithmetic on pointers is only followed through `inttoptr`/
//!   `ptrtoint` and binary operators, not through memory

use std::fmt::Display;

#[cfg(not(feature = "par"))]
use ascent::ascent_run;
#[cfg(feature = "par")]
use ascent::ascent_run_par as ascent_run;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace_span};

use crate::{
    arc::{Arc, UArc},
    config::ArgIndex,
    llvm::constant::Constant,
    llvm::instruction::Opcode,
    llvm::{GlobalName, InstructionName, Operand, TerminatorOpcode},
};

use super::context::{GlobalContext, Site};
use super::pass::ModulePass;

/// Abstract memory object
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Alloc {
    /// An `alloca`
    Stack(UArc<InstructionName>),
    /// The result of an external function returning a pointer
    Heap(UArc<InstructionName>),
    Global(Arc<GlobalName>),
    Function(String),
}

impl Display for Alloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Alloc::Stack(i) => write!(f, "*stack:{}", i),
            Alloc::Heap(i) => write!(f, "*heap:{}", i),
            Alloc::Global(g) => write!(f, "*{}", g),
            Alloc::Function(name) => write!(f, "*@{}", name),
        }
    }
}

fn constant_allocs(c: &Constant) -> Vec<Arc<Alloc>> {
    c.pointers()
        .into_iter()
        .filter_map(|p| match p {
            Constant::Global(g) => Some(Arc::new(Alloc::Global(g))),
            Constant::Function(f) => Some(Arc::new(Alloc::Function(f.get().to_string()))),
            _ => None,
        })
        .collect()
}

/// Points-to sets and their inverse. Both only ever grow.
#[derive(Debug, Default)]
pub struct AliasMap {
    points_to: FxHashMap<Arc<Operand>, FxHashSet<Arc<Alloc>>>,
    pointed_by: FxHashMap<Arc<Alloc>, FxHashSet<Arc<Operand>>>,
}

impl AliasMap {
    /// Returns `true` if the fact is new.
    pub fn insert(&mut self, value: Arc<Operand>, alloc: Arc<Alloc>) -> bool {
        let new = self
            .points_to
            .entry(value.clone())
            .or_default()
            .insert(alloc.clone());
        if new {
            self.pointed_by.entry(alloc).or_default().insert(value);
        }
        new
    }

    pub fn points_to(&self, value: &Arc<Operand>) -> impl Iterator<Item = &Arc<Alloc>> + '_ {
        self.points_to.get(value).into_iter().flatten()
    }

    pub fn may_alias(&self, a: &Arc<Operand>, b: &Arc<Operand>) -> bool {
        if a == b {
            return true;
        }
        match (self.points_to.get(a), self.points_to.get(b)) {
            (Some(pa), Some(pb)) => pa.iter().any(|o| pb.contains(o)),
            _ => false,
        }
    }

    /// The value itself and every value whose points-to set intersects its
    /// own
    pub fn aliases(&self, value: &Arc<Operand>) -> FxHashSet<Arc<Operand>> {
        let mut out = FxHashSet::default();
        out.insert(value.clone());
        for o in self.points_to(value) {
            if let Some(values) = self.pointed_by.get(o) {
                out.extend(values.iter().cloned());
            }
        }
        out
    }

    /// Number of points-to facts
    pub fn len(&self) -> usize {
        self.points_to.values().map(FxHashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.points_to.is_empty()
    }
}

#[derive(Debug, Default)]
struct Facts {
    alloc: Vec<(Arc<Operand>, Arc<Alloc>)>,
    /// (destination, source)
    assign: Vec<(Arc<Operand>, Arc<Operand>)>,
    /// (result, pointer)
    load: Vec<(Arc<Operand>, Arc<Operand>)>,
    /// (pointer, value)
    store: Vec<(Arc<Operand>, Arc<Operand>)>,
    /// (destination pointer, source pointer)
    copy: Vec<(Arc<Operand>, Arc<Operand>)>,
    /// Global initializers: (global, pointee)
    init: Vec<(Arc<Alloc>, Arc<Alloc>)>,
}

impl Facts {
    fn value(&mut self, op: &Arc<Operand>) {
        if let Operand::Constant(c) = &**op {
            for a in constant_allocs(c) {
                self.alloc.push((op.clone(), a));
            }
        }
    }

    fn collect(ctx: &GlobalContext) -> Self {
        let mut facts = Facts::default();

        for m in &ctx.modules {
            for g in &m.globals {
                if let Some(init) = &g.initializer {
                    let global = Arc::new(Alloc::Global(g.name.clone()));
                    for a in constant_allocs(init) {
                        facts.init.push((global.clone(), a));
                    }
                }
            }
        }

        for (id, f) in ctx.functions() {
            if ctx.is_skipped(id) {
                continue;
            }
            for (loc, inst) in f.instructions() {
                for op in inst.operands() {
                    facts.value(&op);
                }
                let result = inst.result().cloned();
                if let (Some(r), Some(opcode)) = (&result, inst.opcode()) {
                    match opcode {
                        Opcode::Alloca => facts
                            .alloc
                            .push((r.clone(), Arc::new(Alloc::Stack(inst.name().clone())))),
                        Opcode::Binary(b) => {
                            facts.assign.push((r.clone(), b.operand0.clone()));
                            facts.assign.push((r.clone(), b.operand1.clone()));
                        }
                        Opcode::Cast(c) => facts.assign.push((r.clone(), c.operand.clone())),
                        Opcode::GetElementPtr(g) => {
                            facts.assign.push((r.clone(), g.pointer.clone()))
                        }
                        Opcode::Load(l) => facts.load.push((r.clone(), l.pointer.clone())),
                        Opcode::Phi(p) => {
                            for (v, _) in &p.values {
                                facts.assign.push((r.clone(), v.clone()));
                            }
                        }
                        Opcode::Select(s) => {
                            facts.assign.push((r.clone(), s.true_value.clone()));
                            facts.assign.push((r.clone(), s.false_value.clone()));
                        }
                        Opcode::ExtractValue(a) => facts.assign.push((r.clone(), a.clone())),
                        _ => (),
                    }
                }
                if let Some(Opcode::Store(s)) = inst.opcode() {
                    facts.store.push((s.pointer.clone(), s.value.clone()));
                }

                let call = match inst.call() {
                    Some(c) => c,
                    None => continue,
                };
                let site = Site::new(id, loc);
                let mut resolved = false;
                for target in ctx.targets(site) {
                    resolved = true;
                    if ctx.is_skipped(target) {
                        continue;
                    }
                    let callee = ctx.function(target);
                    for (param, arg) in callee.parameters.iter().zip(&call.args) {
                        facts.assign.push((param.clone(), arg.clone()));
                    }
                    if let Some(r) = &result {
                        for b in &callee.blocks {
                            if let TerminatorOpcode::Ret(Some(v)) = &b.terminator.opcode {
                                facts.assign.push((r.clone(), v.clone()));
                                facts.value(v);
                            }
                        }
                    }
                }
                if resolved {
                    continue;
                }
                let name = match ctx.callee_name(call) {
                    Some(n) => n,
                    None => continue,
                };
                if let Some(spec) = ctx.tables.copy.get(name) {
                    if let (Some(dst), Some(src)) = (call.arg(spec.dst), call.arg(spec.src)) {
                        facts.copy.push((dst.clone(), src.clone()));
                    }
                    // memcpy and friends return their destination
                    if let (Some(r), Some(dst)) = (&result, call.arg(spec.dst)) {
                        facts.assign.push((r.clone(), dst.clone()));
                    }
                } else if let Some(r) = &result {
                    if call.signature.returns_pointer() {
                        facts
                            .alloc
                            .push((r.clone(), Arc::new(Alloc::Heap(inst.name().clone()))));
                    }
                }
                // Data fetched into a destination buffer keeps pointing where
                // the buffer points; nothing to add for `ArgIndex::Arg`.
                if let Some(spec) = ctx.tables.fetch.get(name) {
                    if let (ArgIndex::Return, Some(r)) = (spec.dst, &result) {
                        facts
                            .alloc
                            .push((r.clone(), Arc::new(Alloc::Heap(inst.name().clone()))));
                    }
                }
            }
        }
        facts
    }
}

/// Solve the points-to constraints of the whole program
#[allow(clippy::clone_on_copy)]
#[allow(clippy::redundant_clone)]
#[allow(clippy::type_complexity)]
pub fn analysis(ctx: &GlobalContext) -> AliasMap {
    let facts = Facts::collect(ctx);
    debug!(
        "Points-to facts: {} alloc, {} assign, {} load, {} store, {} copy",
        facts.alloc.len(),
        facts.assign.len(),
        facts.load.len(),
        facts.store.len(),
        facts.copy.len()
    );

    let outs = ascent_run! {
        struct Outs;

        relation alloc(Arc<Operand>, Arc<Alloc>);
        alloc(v.clone(), a.clone()) <-- for (v, a) in facts.alloc.iter();

        relation assign(Arc<Operand>, Arc<Operand>);
        assign(d.clone(), s.clone()) <-- for (d, s) in facts.assign.iter();

        relation load(Arc<Operand>, Arc<Operand>);
        load(r.clone(), p.clone()) <-- for (r, p) in facts.load.iter();

        relation store(Arc<Operand>, Arc<Operand>);
        store(p.clone(), v.clone()) <-- for (p, v) in facts.store.iter();

        relation copy(Arc<Operand>, Arc<Operand>);
        copy(d.clone(), s.clone()) <-- for (d, s) in facts.copy.iter();

        relation points_to(Arc<Operand>, Arc<Alloc>);
        relation contents(Arc<Alloc>, Arc<Alloc>);

        contents(g.clone(), a.clone()) <-- for (g, a) in facts.init.iter();

        points_to(v, a) <-- alloc(v, a);

        points_to(d, a) <--
          let span = trace_span!("assign"),
          let _span = span.enter(),
          assign(d, s),
          points_to(s, a);

        contents(o, a) <--
          let span = trace_span!("store"),
          let _span = span.enter(),
          store(p, v),
          points_to(p, o),
          points_to(v, a);

        points_to(r, a) <--
          let span = trace_span!("load"),
          let _span = span.enter(),
          load(r, p),
          points_to(p, o),
          contents(o, a);

        contents(od, a) <--
          let span = trace_span!("copy"),
          let _span = span.enter(),
          copy(d, s),
          points_to(d, od),
          points_to(s, os),
          contents(os, a);
    };

    let mut aliases = AliasMap::default();
    for (v, a) in outs.points_to.into_iter() {
        aliases.insert(v, a);
    }
    aliases
}

/// Runs [`analysis`] once and merges its result into the global alias map.
#[derive(Debug, Default)]
pub struct PointerPass {
    solved: bool,
}

impl PointerPass {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModulePass for PointerPass {
    fn id(&self) -> &'static str {
        "PointerAnalysis"
    }

    fn run_on_module(&mut self, ctx: &mut GlobalContext, _module: usize) -> bool {
        if self.solved {
            return false;
        }
        self.solved = true;
        let result = analysis(ctx);
        let mut changed = false;
        for (v, allocs) in result.points_to {
            for a in allocs {
                changed |= ctx.aliases.insert(v.clone(), a);
            }
        }
        changed
    }

    fn finalize(&mut self, ctx: &mut GlobalContext, module: usize) {
        if module == 0 {
            debug!("{} points-to facts", ctx.aliases.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Alloc, AliasMap};
    use crate::arc::Arc;
    use crate::llvm::constant::Constant;
    use crate::llvm::{GlobalName, Operand};

    fn global(name: &str) -> Arc<Operand> {
        Arc::new(Operand::Constant(Arc::new(Constant::Global(Arc::new(
            GlobalName::from(name),
        )))))
    }

    fn object(name: &str) -> Arc<Alloc> {
        Arc::new(Alloc::Function(name.to_string()))
    }

    #[test]
    fn alias_sets_are_reflexive_and_grow() {
        let (a, b, c) = (global("a"), global("b"), global("c"));
        let mut m = AliasMap::default();
        assert!(m.aliases(&a).contains(&a));
        assert!(m.insert(a.clone(), object("x")));
        assert!(!m.insert(a.clone(), object("x")));
        assert!(m.insert(b.clone(), object("x")));
        assert!(m.insert(c.clone(), object("y")));
        let set = m.aliases(&a);
        assert!(set.contains(&a) && set.contains(&b));
        assert!(!set.contains(&c));
        assert!(m.may_alias(&b, &a));
        assert!(!m.may_alias(&a, &c));

        let before = m.aliases(&a).len();
        m.insert(c.clone(), object("x"));
        assert!(m.aliases(&a).len() > before);
    }
}
