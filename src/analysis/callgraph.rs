// SPDX-License-Identifier: BSD-3-Clause
//! Callgraph analysis
//!
//! Direct calls have the obvious target. Indirect calls are resolved in two
//! layers:
//!
//! 1. Any address-taken function whose signature is exactly the one the call
//!    site expects.
//! 2. When the called pointer was loaded from a struct field or a global
//!    function pointer, only the functions ever stored into that slot. A slot
//!    escapes (and layer one applies unchanged) when a non-constant value is
//!    stored into it, or when its struct is cast to or from another type.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::{
    arc::Arc,
    llvm::constant::Constant,
    llvm::instruction::{FieldRef, Opcode},
    llvm::{Callee, Function, Inst, Instruction, Operand, Signature},
};

use super::context::{FuncId, GlobalContext, Site};
use super::pass::ModulePass;

#[derive(Debug, Default)]
pub struct CallGraph {
    pub callees: FxHashMap<Site, FxHashSet<FuncId>>,
    pub callers: FxHashMap<FuncId, FxHashSet<Site>>,
}

impl CallGraph {
    /// Returns `true` if the edge is new.
    pub fn add(&mut self, site: Site, target: FuncId) -> bool {
        let new = self.callees.entry(site).or_default().insert(target);
        if new {
            self.callers.entry(target).or_default().insert(site);
        }
        new
    }

    pub fn edges(&self) -> usize {
        self.callees.values().map(FxHashSet::len).sum()
    }
}

/// A memory slot that holds function pointers
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Slot {
    Field(FieldRef),
    Global(String),
}

/// Function pointers stored into each slot
#[derive(Debug, Default)]
pub struct Slots {
    targets: FxHashMap<Slot, FxHashSet<FuncId>>,
    escaped: FxHashSet<Slot>,
    escaped_structs: FxHashSet<String>,
}

impl Slots {
    pub fn add(&mut self, slot: Slot, target: FuncId) {
        self.targets.entry(slot).or_default().insert(target);
    }

    pub fn escape(&mut self, slot: Slot) {
        self.escaped.insert(slot);
    }

    pub fn escape_struct(&mut self, name: &str) {
        self.escaped_structs.insert(name.to_string());
    }

    /// Functions a load from `slot` may yield, if the slot is confined
    pub fn confined(&self, slot: &Slot) -> Option<&FxHashSet<FuncId>> {
        if self.escaped.contains(slot) {
            return None;
        }
        if let Slot::Field(f) = slot {
            if self.escaped_structs.contains(&f.struct_name) {
                return None;
            }
        }
        self.targets.get(slot)
    }
}

/// The slot a pointer designates, looking through casts
pub(crate) fn slot_of(f: &Function, pointer: &Arc<Operand>) -> Option<Slot> {
    let pointer = f.strip_casts(pointer);
    match &*pointer {
        Operand::Local(_) => match f.definition(&pointer).and_then(|l| f.instruction_at(l)) {
            Some(Inst::Instruction(Instruction {
                opcode: Opcode::GetElementPtr(gep),
                ..
            })) => gep.field.clone().map(Slot::Field),
            _ => None,
        },
        Operand::Constant(c) => constant_slot(c),
        Operand::Metadata => None,
    }
}

fn constant_slot(c: &Constant) -> Option<Slot> {
    match c {
        Constant::Global(g) => Some(Slot::Global(g.get().to_string())),
        Constant::BitCast(c) => constant_slot(c),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct CallGraphPass {
    address_taken: FxHashMap<Signature, FxHashSet<FuncId>>,
    slots: Slots,
}

impl CallGraphPass {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_address(&mut self, ctx: &GlobalContext, module: usize, c: &Constant) {
        for f in c.functions() {
            if let Some(id) = ctx.index.resolve(&ctx.modules, module, f.get()) {
                let sig = ctx.function(id).signature.clone();
                self.address_taken.entry(sig).or_default().insert(id);
            }
        }
    }

    /// Record function pointers in a global initializer, per struct field
    fn initializer_slots(&mut self, ctx: &GlobalContext, module: usize, c: &Constant) {
        match c {
            Constant::Struct(s) => {
                for (idx, field) in s.fields.iter().enumerate() {
                    if let Some(name) = &s.name {
                        let slot = Slot::Field(FieldRef {
                            struct_name: name.clone(),
                            index: idx as u64,
                        });
                        if let Some(id) = field
                            .function()
                            .and_then(|f| ctx.index.resolve(&ctx.modules, module, f.get()))
                        {
                            self.slots.add(slot, id);
                        }
                    }
                    self.initializer_slots(ctx, module, field);
                }
            }
            Constant::Array(elems) => {
                for e in elems {
                    self.initializer_slots(ctx, module, e);
                }
            }
            _ => (),
        }
    }

    fn collect(&mut self, ctx: &GlobalContext, module: usize) {
        let m = &ctx.modules[module];
        for g in &m.globals {
            if let Some(init) = &g.initializer {
                self.take_address(ctx, module, init);
                self.initializer_slots(ctx, module, init);
                if let Some(f) = init.function() {
                    if let Some(id) = ctx.index.resolve(&ctx.modules, module, f.get()) {
                        self.slots.add(Slot::Global(g.name.get().to_string()), id);
                    }
                }
            }
        }

        for f in &m.functions {
            for (_, inst) in f.instructions() {
                let callee = inst.call().and_then(|c| match &c.callee {
                    Callee::Operand(op) => Some(op.clone()),
                    Callee::Asm => None,
                });
                for op in inst.operands() {
                    if Some(&op) == callee.as_ref() {
                        continue;
                    }
                    if let Operand::Constant(c) = &*op {
                        self.take_address(ctx, module, c);
                    }
                }

                match inst.opcode() {
                    Some(Opcode::Store(store)) => {
                        if let Some(slot) = slot_of(f, &store.pointer) {
                            let value = f.strip_casts(&store.value);
                            match value.constant() {
                                Some(c) => {
                                    if let Some(id) = c.function().and_then(|func| {
                                        ctx.index.resolve(&ctx.modules, module, func.get())
                                    }) {
                                        self.slots.add(slot, id);
                                    } else if !c.is_null() && c.function().is_none() {
                                        self.slots.escape(slot);
                                    }
                                }
                                None => self.slots.escape(slot),
                            }
                        }
                    }
                    Some(Opcode::Cast(cast)) if cast.changes_struct() => {
                        for s in cast.from_struct.iter().chain(cast.to_struct.iter()) {
                            self.slots.escape_struct(s);
                        }
                    }
                    _ => (),
                }
            }
        }
    }

    /// Possible targets of an indirect call through `callee`
    fn indirect_targets(
        &self,
        f: &Function,
        callee: &Arc<Operand>,
        signature: &Signature,
    ) -> FxHashSet<FuncId> {
        let mut candidates = self
            .address_taken
            .get(signature)
            .cloned()
            .unwrap_or_default();

        let callee = f.strip_casts(callee);
        let loaded_from = match f.definition(&callee).and_then(|l| f.instruction_at(l)) {
            Some(Inst::Instruction(Instruction {
                opcode: Opcode::Load(load),
                ..
            })) => slot_of(f, &load.pointer),
            _ => None,
        };
        if let Some(confined) = loaded_from.as_ref().and_then(|s| self.slots.confined(s)) {
            candidates.retain(|c| confined.contains(c));
            trace!(
                "Confined call through {} to {} targets",
                callee,
                candidates.len()
            );
        }
        candidates
    }
}

impl ModulePass for CallGraphPass {
    fn id(&self) -> &'static str {
        "CallGraph"
    }

    fn initialize(&mut self, ctx: &mut GlobalContext, module: usize) -> bool {
        self.collect(ctx, module);
        false
    }

    fn run_on_module(&mut self, ctx: &mut GlobalContext, module: usize) -> bool {
        let mut edges = Vec::new();
        for (id, f) in ctx.module_functions(module) {
            let skip = ctx.is_skipped(id);
            for (loc, inst) in f.instructions() {
                let call = match inst.call() {
                    Some(c) => c,
                    None => continue,
                };
                let site = Site::new(id, loc);
                if let Some(name) = call.callee.direct() {
                    if let Some(target) = ctx.index.resolve(&ctx.modules, module, name.get()) {
                        edges.push((site, target));
                    }
                } else if let (Some(callee), false) = (call.callee.indirect(), skip) {
                    for target in self.indirect_targets(f, callee, &call.signature) {
                        edges.push((site, target));
                    }
                }
            }
        }

        let mut changed = false;
        for (site, target) in edges {
            changed |= ctx.callgraph.add(site, target);
        }
        changed
    }

    fn finalize(&mut self, ctx: &mut GlobalContext, module: usize) {
        let mut counters = ctx.counters.clone();
        if module == 0 {
            counters.skipped_functions = 0;
            counters.indirect_calls = 0;
            counters.indirect_call_edges = 0;
        }
        for (id, f) in ctx.module_functions(module) {
            if ctx.is_skipped(id) {
                counters.skipped_functions += 1;
                debug!("Skipping {} ({} blocks)", f.name, f.blocks.len());
                continue;
            }
            for (loc, inst) in f.instructions() {
                if inst.call().and_then(|c| c.callee.indirect()).is_some() {
                    counters.indirect_calls += 1;
                    counters.indirect_call_edges += ctx.targets(Site::new(id, loc)).count();
                }
            }
        }
        ctx.counters = counters;
    }
}

#[cfg(test)]
mod tests {
    use super::{CallGraph, Slot, Slots};
    use crate::analysis::context::{FuncId, Site};
    use crate::llvm::instruction::FieldRef;
    use crate::llvm::Location;

    fn func(index: usize) -> FuncId {
        FuncId { module: 0, index }
    }

    #[test]
    fn edges_are_mirrored() {
        let mut cg = CallGraph::default();
        let site = Site::new(func(0), Location::new(0, 1));
        assert!(cg.add(site, func(1)));
        assert!(!cg.add(site, func(1)));
        assert!(cg.add(site, func(2)));
        assert_eq!(cg.edges(), 2);
        assert!(cg.callers[&func(2)].contains(&site));
    }

    #[test]
    fn escaped_slots_are_not_confined() {
        let field = Slot::Field(FieldRef {
            struct_name: "struct.ops".to_string(),
            index: 1,
        });
        let global = Slot::Global("handler".to_string());
        let mut slots = Slots::default();
        slots.add(field.clone(), func(3));
        slots.add(global.clone(), func(4));
        assert!(slots.confined(&field).unwrap().contains(&func(3)));
        slots.escape(global.clone());
        assert!(slots.confined(&global).is_none());
        slots.escape_struct("struct.ops");
        assert!(slots.confined(&field).is_none());
    }
}
