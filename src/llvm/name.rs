// SPDX-License-Identifier: BSD-3-Clause
use std::fmt::Display;

use llvm_ir::{
    function::Parameter,
    module::{GlobalAlias, GlobalVariable},
    BasicBlock,
};

use crate::arc::UArc;

fn name_str(n: &llvm_ir::Name) -> String {
    match n {
        llvm_ir::Name::Name(n) => (**n).clone(),
        llvm_ir::Name::Number(n) => n.to_string(),
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct GlobalName(String);

impl GlobalName {
    pub(crate) fn new(g: &GlobalVariable) -> Self {
        GlobalName(g.name.clone())
    }

    pub(crate) fn alias(g: &GlobalAlias) -> Self {
        GlobalName(g.name.clone())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GlobalName {
    fn from(s: &str) -> Self {
        GlobalName(s.to_string())
    }
}

impl Display for GlobalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct FunctionName(String);

impl From<&str> for FunctionName {
    fn from(s: &str) -> Self {
        FunctionName(s.to_string())
    }
}

impl From<String> for FunctionName {
    fn from(s: String) -> Self {
        FunctionName(s)
    }
}

impl<T> PartialEq<T> for FunctionName
where
    T: AsRef<str>,
{
    fn eq(&self, other: &T) -> bool {
        self.0.as_str().eq(other.as_ref())
    }
}

impl FunctionName {
    pub(crate) fn definition(f: &llvm_ir::Function) -> Self {
        FunctionName(f.name.clone())
    }

    pub(crate) fn declaration(f: &llvm_ir::function::FunctionDeclaration) -> Self {
        FunctionName(f.name.clone())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for FunctionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockName {
    parent_function: UArc<FunctionName>,
    name: String,
}

impl BlockName {
    pub(crate) fn new(parent_function: UArc<FunctionName>, b: &BasicBlock) -> Self {
        Self {
            parent_function,
            name: name_str(&b.name),
        }
    }

    pub fn function(&self) -> &UArc<FunctionName> {
        &self.parent_function
    }

    /// The label as written in the IR
    pub fn label(&self) -> &str {
        &self.name
    }
}

impl Display for BlockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.parent_function.0, self.name)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstructionName {
    parent_function: UArc<FunctionName>,
    parent_block: UArc<BlockName>,
    idx: usize,
}

impl InstructionName {
    pub(crate) fn new(
        parent_function: UArc<FunctionName>,
        parent_block: UArc<BlockName>,
        idx: usize,
    ) -> Self {
        Self {
            parent_function,
            parent_block,
            idx,
        }
    }

    pub fn function(&self) -> &UArc<FunctionName> {
        &self.parent_function
    }

    pub fn block(&self) -> &UArc<BlockName> {
        &self.parent_block
    }

    pub fn index(&self) -> usize {
        self.idx
    }
}

impl Display for InstructionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.parent_block, self.idx)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ParameterName {
    parent_function: UArc<FunctionName>,
    name: String,
    idx: usize,
}

impl ParameterName {
    pub(crate) fn new(parent_function: UArc<FunctionName>, p: &Parameter, idx: usize) -> Self {
        Self {
            parent_function,
            name: name_str(&p.name),
            idx,
        }
    }

    pub fn function(&self) -> &UArc<FunctionName> {
        &self.parent_function
    }

    pub fn index(&self) -> usize {
        self.idx
    }
}

impl Display for ParameterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:%{}", self.parent_function.0, self.name)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum LocalName {
    Parameter(UArc<ParameterName>),
    Instruction(UArc<InstructionName>),
}

impl LocalName {
    /// The function this local belongs to
    pub fn function(&self) -> &UArc<FunctionName> {
        match self {
            LocalName::Parameter(p) => p.function(),
            LocalName::Instruction(i) => i.function(),
        }
    }
}

impl Display for LocalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalName::Parameter(p) => write!(f, "{}", p),
            LocalName::Instruction(i) => write!(f, "{}", i),
        }
    }
}
