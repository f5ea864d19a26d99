// SPDX-License-Identifier: BSD-3-Clause
//! Identification of security checks
//!
//! Blocks that return an error code or call an error-handling function seed
//! the CFG edges leading into them. Flags then travel backwards: once every
//! outgoing edge of a block is flagged, its incoming edges get the weakened
//! union of those flags. A conditional branch whose outgoing edges end up
//! with different flags is a security check.

use ascent::Lattice;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::{
    arc::Arc,
    config::ArgIndex,
    lattice::ErrFlags,
    llvm::constant::Constant,
    llvm::instruction::{BinaryOp, Opcode, Predicate},
    llvm::{Function, Inst, Instruction, Location, Operand, TerminatorOpcode},
};

use super::context::GlobalContext;
use super::pass::ModulePass;

/// CFG edge between two blocks of one function: `(from, to)`
pub type Edge = (usize, usize);

/// Largest errno value; error codes are `-MAX_ERRNO..=-1`
pub const MAX_ERRNO: i64 = 4095;

/// Successor and predecessor lists of a function's blocks
#[derive(Clone, Debug, Default)]
pub struct Cfg {
    pub succs: Vec<Vec<usize>>,
    pub preds: Vec<Vec<usize>>,
}

impl Cfg {
    pub fn new(f: &Function) -> Self {
        Cfg {
            succs: (0..f.blocks.len()).map(|b| f.successors(b)).collect(),
            preds: (0..f.blocks.len())
                .map(|b| f.predecessors(b).to_vec())
                .collect(),
        }
    }

    pub fn from_edges(blocks: usize, edges: &[Edge]) -> Self {
        let mut cfg = Cfg {
            succs: vec![Vec::new(); blocks],
            preds: vec![Vec::new(); blocks],
        };
        for (from, to) in edges {
            cfg.succs[*from].push(*to);
            cfg.preds[*to].push(*from);
        }
        cfg
    }
}

/// Flags of every CFG edge of a function. Absent edges carry no flag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EdgeFlags(FxHashMap<Edge, ErrFlags>);

impl EdgeFlags {
    pub fn get(&self, edge: Edge) -> ErrFlags {
        self.0.get(&edge).copied().unwrap_or_default()
    }

    /// Returns `true` when the flags of `edge` grew.
    pub fn merge(&mut self, edge: Edge, flags: ErrFlags) -> bool {
        self.0.entry(edge).or_default().merge(flags)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Edge, &ErrFlags)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Seed the given edges and propagate to the fixed point. `pick` chooses
    /// the next edge to process from the worklist.
    pub fn propagate_with<P>(cfg: &Cfg, seeds: &[(Edge, ErrFlags)], mut pick: P) -> Self
    where
        P: FnMut(&mut Vec<Edge>) -> Option<Edge>,
    {
        let mut flags = EdgeFlags::default();
        let mut worklist = Vec::new();
        for (edge, f) in seeds {
            if flags.merge(*edge, *f) {
                worklist.push(*edge);
            }
        }

        while let Some((from, _)) = pick(&mut worklist) {
            let outgoing = &cfg.succs[from];
            if outgoing.iter().any(|s| flags.get((from, *s)).is_empty()) {
                continue;
            }
            let incoming = outgoing
                .iter()
                .map(|s| flags.get((from, *s)))
                .fold(ErrFlags::NONE, Lattice::join)
                .weakened();
            for pred in &cfg.preds[from] {
                let edge = (*pred, from);
                if flags.get(edge).is_completed() {
                    continue;
                }
                if flags.merge(edge, incoming) {
                    worklist.push(edge);
                }
            }
        }
        flags
    }

    pub fn propagate(cfg: &Cfg, seeds: &[(Edge, ErrFlags)]) -> Self {
        Self::propagate_with(cfg, seeds, Vec::pop)
    }
}

/// Is this constant an error code returned by a function?
pub fn is_errno(c: &Constant, returns_pointer: bool) -> bool {
    let in_range = |v: i64| (-MAX_ERRNO..=-1).contains(&v);
    match c {
        Constant::Int { bits, .. } if *bits >= 16 => c.signed().map_or(false, in_range),
        Constant::IntToPtr(_) if returns_pointer => c.signed().map_or(false, in_range),
        _ if returns_pointer && c.is_null() => true,
        Constant::BitCast(inner) => is_errno(inner, returns_pointer),
        _ => false,
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    /// A conditional branch or switch
    Branch,
    /// A `select` choosing an error code
    Select,
}

/// A comparison feeding the condition of a check
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Compare {
    pub predicate: Predicate,
    pub operand0: Arc<Operand>,
    pub operand1: Arc<Operand>,
}

impl Compare {
    pub fn operands(&self) -> [&Arc<Operand>; 2] {
        [&self.operand0, &self.operand1]
    }
}

#[derive(Clone, Debug)]
pub struct SecurityCheck {
    pub kind: CheckKind,
    /// Block of the branch or select
    pub block: usize,
    pub location: Location,
    pub condition: Arc<Operand>,
    pub compares: Vec<Compare>,
}

impl SecurityCheck {
    /// Values the check compares, directly
    pub fn compared(&self) -> impl Iterator<Item = &Arc<Operand>> {
        self.compares.iter().flat_map(|c| c.operands())
    }
}

/// Result of check identification for one function
#[derive(Clone, Debug, Default)]
pub struct FunctionChecks {
    pub flags: EdgeFlags,
    pub checks: Vec<SecurityCheck>,
    pub conditional_statements: usize,
    by_block: FxHashMap<usize, Vec<usize>>,
}

impl FunctionChecks {
    /// Checks located in `block`
    pub fn in_block(&self, block: usize) -> impl Iterator<Item = &SecurityCheck> {
        self.by_block
            .get(&block)
            .into_iter()
            .flatten()
            .map(|i| &self.checks[*i])
    }
}

/// Comparisons that decide `cond`, looking through casts and boolean
/// connectives
fn compares_of(f: &Function, cond: &Arc<Operand>, out: &mut Vec<Compare>, depth: usize) {
    if depth == 0 {
        return;
    }
    let cond = f.strip_casts(cond);
    match f.definition(&cond).and_then(|l| f.instruction_at(l)) {
        Some(Inst::Instruction(Instruction {
            opcode: Opcode::Icmp(icmp),
            ..
        })) => out.push(Compare {
            predicate: icmp.predicate,
            operand0: icmp.operand0.clone(),
            operand1: icmp.operand1.clone(),
        }),
        Some(Inst::Instruction(Instruction {
            opcode: Opcode::Binary(b),
            ..
        })) if matches!(b.op, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor) => {
            compares_of(f, &b.operand0, out, depth - 1);
            compares_of(f, &b.operand1, out, depth - 1);
        }
        _ => (),
    }
}

/// Where error codes enter the returned value
#[derive(Debug, Default)]
struct ErrorReturns {
    /// Blocks whose every execution returns an error
    blocks: Vec<usize>,
    /// Edges along which an error code flows into a `phi`
    edges: Vec<Edge>,
    /// `select`s choosing an error code
    selects: Vec<(Location, Arc<Operand>)>,
    visited: FxHashSet<Arc<Operand>>,
}

impl ErrorReturns {
    fn find(f: &Function) -> Self {
        let mut out = ErrorReturns::default();
        let returns_pointer = f.returns_pointer();
        if !returns_pointer && !matches!(*f.return_type, llvm_ir::Type::IntegerType { .. }) {
            return out;
        }
        for b in f.return_blocks().collect::<Vec<_>>() {
            if let TerminatorOpcode::Ret(Some(v)) = &f.blocks[b].terminator.opcode {
                out.trace(f, v, b, returns_pointer);
            }
        }
        out
    }

    /// `value` reaches the return from `block`
    fn trace(&mut self, f: &Function, value: &Arc<Operand>, block: usize, ptr: bool) {
        let value = f.strip_casts(value);
        if let Some(c) = value.constant() {
            if is_errno(c, ptr) {
                self.blocks.push(block);
            }
            return;
        }
        if !self.visited.insert(value.clone()) {
            return;
        }
        let loc = match f.definition(&value) {
            Some(l) => l,
            None => return,
        };
        let opcode = match f.instruction_at(loc).and_then(|i| i.opcode()) {
            Some(o) => o,
            None => return,
        };
        match opcode {
            Opcode::Phi(phi) => {
                for (v, pred) in &phi.values {
                    let v = f.strip_casts(v);
                    match v.constant() {
                        Some(c) if is_errno(c, ptr) => self.edges.push((*pred, loc.block)),
                        Some(_) => (),
                        None => self.trace(f, &v, *pred, ptr),
                    }
                }
            }
            Opcode::Select(s) => {
                let arm_is_errno = [&s.true_value, &s.false_value].iter().any(|v| {
                    f.strip_casts(v)
                        .constant()
                        .map_or(false, |c| is_errno(c, ptr))
                });
                if arm_is_errno {
                    self.selects.push((loc, s.condition.clone()));
                }
            }
            // The return slot of unoptimised code
            Opcode::Load(load) => {
                let slot = f.strip_casts(&load.pointer);
                for user in f.users(&slot).to_vec() {
                    if let Some(Opcode::Store(store)) = f.instruction_at(user).and_then(|i| i.opcode())
                    {
                        if f.strip_casts(&store.pointer) == slot {
                            self.trace(f, &store.value, user.block, ptr);
                        }
                    }
                }
            }
            _ => (),
        }
    }
}

/// Blocks calling an error-handling function or ending in `unreachable`
fn error_handling_blocks(ctx: &GlobalContext, f: &Function) -> Vec<usize> {
    let mut out = Vec::new();
    for (b_idx, b) in f.blocks.iter().enumerate() {
        let calls_handler = b.instrs.iter().any(|i| match &i.opcode {
            Opcode::Call(c) => ctx.callee_name(c).map_or(false, |n| ctx.is_error_handling(n)),
            _ => false,
        });
        if calls_handler || matches!(b.terminator.opcode, TerminatorOpcode::Unreachable) {
            out.push(b_idx);
        }
    }
    out
}

/// Find the security checks of one function
pub fn identify(ctx: &GlobalContext, f: &Function) -> FunctionChecks {
    let cfg = Cfg::new(f);
    let returns = ErrorReturns::find(f);

    let mut seeds = Vec::new();
    for b in &returns.blocks {
        for p in &cfg.preds[*b] {
            seeds.push(((*p, *b), ErrFlags::MUST_RETURN_ERR));
        }
    }
    for e in &returns.edges {
        seeds.push((*e, ErrFlags::MUST_RETURN_ERR));
    }
    for b in error_handling_blocks(ctx, f) {
        for p in &cfg.preds[b] {
            seeds.push(((*p, b), ErrFlags::MUST_HANDLE_ERR));
        }
    }
    let flags = EdgeFlags::propagate(&cfg, &seeds);

    let mut checks = Vec::new();
    let mut conditional_statements = 0;
    for (b_idx, b) in f.blocks.iter().enumerate() {
        let condition = match &b.terminator.opcode {
            TerminatorOpcode::CondBr(br) => br.condition.clone(),
            TerminatorOpcode::Switch(s) => s.operand.clone(),
            _ => continue,
        };
        conditional_statements += 1;
        let mut succ_flags = cfg.succs[b_idx].iter().map(|s| flags.get((b_idx, *s)).effective());
        let first = succ_flags.next().unwrap_or_default();
        if succ_flags.all(|f| f == first) {
            continue;
        }
        let mut compares = Vec::new();
        if let TerminatorOpcode::Switch(s) = &b.terminator.opcode {
            for (case, _) in &s.dests {
                compares.push(Compare {
                    predicate: Predicate::Eq,
                    operand0: s.operand.clone(),
                    operand1: case.clone(),
                });
            }
        } else {
            compares_of(f, &condition, &mut compares, 8);
        }
        trace!("Check at {} on {}", b.name(), condition);
        checks.push(SecurityCheck {
            kind: CheckKind::Branch,
            block: b_idx,
            location: b.end(b_idx),
            condition,
            compares,
        });
    }

    for (loc, condition) in returns.selects {
        let mut compares = Vec::new();
        compares_of(f, &condition, &mut compares, 8);
        checks.push(SecurityCheck {
            kind: CheckKind::Select,
            block: loc.block,
            location: loc,
            condition,
            compares,
        });
    }

    let mut by_block: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
    for (i, c) in checks.iter().enumerate() {
        by_block.entry(c.block).or_default().push(i);
    }
    FunctionChecks {
        flags,
        checks,
        conditional_statements,
        by_block,
    }
}

#[derive(Debug, Default)]
pub struct SecurityChecksPass;

impl SecurityChecksPass {
    pub fn new() -> Self {
        SecurityChecksPass
    }
}

impl ModulePass for SecurityChecksPass {
    fn id(&self) -> &'static str {
        "SecurityChecks"
    }

    fn run_on_module(&mut self, ctx: &mut GlobalContext, module: usize) -> bool {
        let mut found = Vec::new();
        for (id, f) in ctx.module_functions(module) {
            if ctx.checks.contains_key(&id) || ctx.is_skipped(id) {
                continue;
            }
            found.push((id, identify(ctx, f)));
        }
        let changed = !found.is_empty();
        for (id, checks) in found {
            ctx.counters.security_checks += checks.checks.len();
            ctx.counters.conditional_statements += checks.conditional_statements;
            ctx.checks.insert(id, checks);
        }
        changed
    }

    fn finalize(&mut self, ctx: &mut GlobalContext, module: usize) {
        if module + 1 == ctx.modules.len() {
            debug!(
                "{} security checks in {} conditional statements",
                ctx.counters.security_checks, ctx.counters.conditional_statements
            );
        }
    }
}

/// Operator of a modeled check
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScOperator {
    Other,
    Eq,
    Ne,
    /// Including `>=`
    Gt,
    /// Including `<=`
    Lt,
}

impl From<Predicate> for ScOperator {
    fn from(p: Predicate) -> Self {
        match p {
            Predicate::Eq => ScOperator::Eq,
            Predicate::Ne => ScOperator::Ne,
            Predicate::Ugt | Predicate::Uge | Predicate::Sgt | Predicate::Sge => ScOperator::Gt,
            Predicate::Ult | Predicate::Ule | Predicate::Slt | Predicate::Sle => ScOperator::Lt,
        }
    }
}

/// What the tracked value is compared against
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScCondition {
    Other,
    Null,
    Zero,
    Pos,
    Neg,
    Const,
    Var,
}

impl ScCondition {
    fn of(other: &Operand) -> Self {
        match other {
            Operand::Constant(c) if c.is_null() => ScCondition::Null,
            Operand::Constant(c) => match c.signed() {
                Some(0) => ScCondition::Zero,
                Some(v) if v > 0 => ScCondition::Pos,
                Some(_) => ScCondition::Neg,
                None => ScCondition::Const,
            },
            Operand::Local(_) => ScCondition::Var,
            Operand::Metadata => ScCondition::Other,
        }
    }
}

/// A check as it applies to one tracked value. Two models are the same
/// check when they compare the same value.
#[derive(Clone, Debug)]
pub struct ModelSC {
    pub operator: ScOperator,
    pub condition: ScCondition,
    pub value: Arc<Operand>,
    /// Argument of the API the checked value belongs to
    pub arg: ArgIndex,
    pub kind: CheckKind,
}

impl ModelSC {
    /// Model `check` as a check of `value`. `value` should be one of the
    /// compared operands; otherwise the first comparison is used as is.
    pub fn new(check: &SecurityCheck, value: &Arc<Operand>, arg: ArgIndex) -> Self {
        let cmp = check
            .compares
            .iter()
            .find(|c| c.operands().contains(&value))
            .or_else(|| check.compares.first());
        let (operator, condition) = match cmp {
            Some(c) => {
                let other = if &c.operand0 == value {
                    &c.operand1
                } else {
                    &c.operand0
                };
                (ScOperator::from(c.predicate), ScCondition::of(other))
            }
            None => (ScOperator::Other, ScCondition::Other),
        };
        ModelSC {
            operator,
            condition,
            value: value.clone(),
            arg,
            kind: check.kind,
        }
    }
}

impl PartialEq for ModelSC {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for ModelSC {}

impl std::hash::Hash for ModelSC {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl std::fmt::Display for ModelSC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) {:?} {:?}",
            self.value, self.arg, self.operator, self.condition
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{is_errno, Cfg, EdgeFlags, ScCondition};
    use crate::arc::Arc;
    use crate::lattice::ErrFlags;
    use crate::llvm::constant::Constant;
    use crate::llvm::Operand;

    #[test]
    fn errno_range() {
        let int = |v: i64| Constant::Int {
            bits: 32,
            value: (v as u64) & 0xFFFF_FFFF,
        };
        assert!(is_errno(&int(-22), false));
        assert!(is_errno(&int(-4095), false));
        assert!(!is_errno(&int(-4096), false));
        assert!(!is_errno(&int(0), false));
        assert!(!is_errno(&Constant::Null, false));
        assert!(is_errno(&Constant::Null, true));
        let bool_true = Constant::Int { bits: 1, value: 1 };
        assert!(!is_errno(&bool_true, false));
    }

    #[test]
    fn conditions() {
        let c = |c: Constant| Operand::Constant(Arc::new(c));
        assert_eq!(ScCondition::of(&c(Constant::Null)), ScCondition::Null);
        assert_eq!(
            ScCondition::of(&c(Constant::Int { bits: 64, value: 0 })),
            ScCondition::Zero
        );
        assert_eq!(
            ScCondition::of(&c(Constant::Int { bits: 64, value: 4 })),
            ScCondition::Pos
        );
        assert_eq!(
            ScCondition::of(&c(Constant::Int {
                bits: 8,
                value: 0xFF
            })),
            ScCondition::Neg
        );
    }

    //   0
    //  / \
    // 1   2 <-+
    // |   |   |
    // |   3 --+
    // |   |
    // 4   5
    fn diamond_with_loop() -> Cfg {
        Cfg::from_edges(6, &[(0, 1), (0, 2), (1, 4), (2, 3), (3, 2), (3, 5)])
    }

    #[test]
    fn branch_into_error_is_a_check() {
        let cfg = diamond_with_loop();
        let flags = EdgeFlags::propagate(&cfg, &[((1, 4), ErrFlags::MUST_RETURN_ERR)]);
        assert_eq!(flags.get((1, 4)), ErrFlags::MUST_RETURN_ERR);
        // Block 1 only leads to the error
        assert_eq!(flags.get((0, 1)), ErrFlags::MAY_RETURN_ERR);
        assert!(flags.get((0, 2)).is_empty());
        assert!(flags.get((2, 3)).is_empty());
    }

    #[test]
    fn loops_terminate() {
        let cfg = diamond_with_loop();
        let flags = EdgeFlags::propagate(
            &cfg,
            &[
                ((3, 5), ErrFlags::MUST_HANDLE_ERR),
                ((3, 2), ErrFlags::MUST_RETURN_ERR),
            ],
        );
        // Both exits of 3 are flagged, so the flags flow around the loop
        assert!(flags.get((2, 3)).handles_err());
        assert!(flags.get((2, 3)).returns_err());
        assert!(flags.get((0, 2)).is_completed());
    }

    #[test]
    fn order_independent() {
        let cfg = Cfg::from_edges(
            7,
            &[
                (0, 1),
                (0, 2),
                (1, 3),
                (2, 3),
                (3, 4),
                (3, 5),
                (4, 1),
                (5, 6),
                (2, 6),
            ],
        );
        let seeds = [
            ((3, 5), ErrFlags::MUST_RETURN_ERR),
            ((3, 4), ErrFlags::MUST_HANDLE_ERR),
            ((2, 6), ErrFlags::MUST_RETURN_ERR),
            ((5, 6), ErrFlags::MUST_RETURN_ERR),
        ];
        let lifo = EdgeFlags::propagate(&cfg, &seeds);
        let fifo = EdgeFlags::propagate_with(&cfg, &seeds, |w| {
            if w.is_empty() {
                None
            } else {
                Some(w.remove(0))
            }
        });
        assert_eq!(lifo, fifo);

        // Pseudo-random picks
        for seed in 1..20u64 {
            let mut state = seed;
            let mut reversed = seeds;
            reversed.reverse();
            let random = EdgeFlags::propagate_with(&cfg, &reversed, |w| {
                if w.is_empty() {
                    return None;
                }
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let i = (state >> 33) as usize % w.len();
                Some(w.swap_remove(i))
            });
            assert_eq!(lifo, random);
        }
    }
}
