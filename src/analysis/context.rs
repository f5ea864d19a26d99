// SPDX-License-Identifier: BSD-3-Clause
//! State shared by all passes over the whole program

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    config::{Config, ConfigError, Tables},
    llvm::{instruction::Call, Function, Location, Module},
};

use super::callgraph::CallGraph;
use super::checks::FunctionChecks;
use super::missing::MissingStats;
use super::pointer::AliasMap;

/// A function definition: module index and index in [`Module::functions`]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FuncId {
    pub module: usize,
    pub index: usize,
}

/// An instruction in a function definition
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Site {
    pub func: FuncId,
    pub loc: Location,
}

impl Site {
    pub fn new(func: FuncId, loc: Location) -> Self {
        Site { func, loc }
    }
}

/// Where each function name is defined
#[derive(Debug, Default)]
pub struct Index {
    definitions: FxHashMap<String, FuncId>,
}

impl Index {
    fn new(modules: &[Module]) -> Self {
        let mut definitions = FxHashMap::default();
        for (m_idx, m) in modules.iter().enumerate() {
            for (f_idx, f) in m.functions.iter().enumerate() {
                definitions
                    .entry(f.name.get().to_string())
                    .or_insert(FuncId {
                        module: m_idx,
                        index: f_idx,
                    });
            }
        }
        Index { definitions }
    }

    /// The definition a reference from `module` to `name` links to. Local
    /// definitions win over definitions in other modules.
    pub fn resolve(&self, modules: &[Module], module: usize, name: &str) -> Option<FuncId> {
        if let Some(index) = modules.get(module).and_then(|m| m.function_index(name)) {
            return Some(FuncId { module, index });
        }
        self.definitions.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Counters {
    pub security_checks: usize,
    pub conditional_statements: usize,
    pub indirect_calls: usize,
    pub indirect_call_edges: usize,
    pub skipped_functions: usize,
}

#[derive(Debug)]
pub struct GlobalContext {
    pub modules: Vec<Module>,
    pub config: Config,
    pub tables: Tables,
    pub index: Index,
    pub callgraph: CallGraph,
    pub aliases: AliasMap,
    pub checks: FxHashMap<FuncId, FunctionChecks>,
    pub missing: MissingStats,
    pub counters: Counters,
}

impl GlobalContext {
    pub fn new(modules: Vec<Module>, config: Config) -> Result<Self, ConfigError> {
        let tables = Tables::new(&config)?;
        let index = Index::new(&modules);
        Ok(GlobalContext {
            modules,
            config,
            tables,
            index,
            callgraph: CallGraph::default(),
            aliases: AliasMap::default(),
            checks: FxHashMap::default(),
            missing: MissingStats::default(),
            counters: Counters::default(),
        })
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.modules[id.module].functions[id.index]
    }

    /// All function definitions, in module order
    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> + '_ {
        self.modules.iter().enumerate().flat_map(|(m_idx, m)| {
            m.functions.iter().enumerate().map(move |(f_idx, f)| {
                (
                    FuncId {
                        module: m_idx,
                        index: f_idx,
                    },
                    f,
                )
            })
        })
    }

    pub fn module_functions(
        &self,
        module: usize,
    ) -> impl Iterator<Item = (FuncId, &Function)> + '_ {
        self.modules[module]
            .functions
            .iter()
            .enumerate()
            .map(move |(index, f)| (FuncId { module, index }, f))
    }

    /// Functions above the block ceiling are left out of interprocedural
    /// tracking and check identification.
    pub fn is_skipped(&self, id: FuncId) -> bool {
        self.function(id).blocks.len() > self.config.max_blocks
    }

    pub fn call_at(&self, site: Site) -> Option<&Call> {
        self.function(site.func)
            .instruction_at(site.loc)
            .and_then(|i| i.call())
    }

    /// Name of the statically known callee of a call
    pub fn callee_name<'a>(&self, call: &'a Call) -> Option<&'a str> {
        call.callee.direct().map(|f| f.get())
    }

    /// Definitions a call site may invoke
    pub fn targets(&self, site: Site) -> impl Iterator<Item = FuncId> + '_ {
        self.callgraph
            .callees
            .get(&site)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    /// Call sites that may invoke a function
    pub fn callers(&self, func: FuncId) -> impl Iterator<Item = Site> + '_ {
        self.callgraph
            .callers
            .get(&func)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    pub fn is_error_handling(&self, name: &str) -> bool {
        self.tables.error_handling.contains(name)
    }

    /// Human-readable location of a site, `function:block:index`
    pub fn describe(&self, site: Site) -> String {
        let f = self.function(site.func);
        match f.blocks.get(site.loc.block) {
            Some(b) => format!("{}:{}", b.name(), site.loc.index),
            None => format!("{}", f.name),
        }
    }

    /// Sites in `sites` sorted by module, function and location
    pub fn sorted(sites: &FxHashSet<Site>) -> Vec<Site> {
        let mut v: Vec<Site> = sites.iter().copied().collect();
        v.sort();
        v
    }
}
