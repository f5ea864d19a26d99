// SPDX-License-Identifier: BSD-3-Clause
use std::collections::HashMap;

use llvm_ir::Name;

use crate::arc::{Arc, UArc};

use super::constant::Constant;
use super::error::Error;
use super::name::{FunctionName, LocalName};

/// A program value. Locals compare by identity, constants structurally.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Operand {
    Constant(Arc<Constant>),
    Local(Arc<LocalName>),
    Metadata,
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Constant(c) => write!(f, "{}", c),
            Operand::Local(l) => write!(f, "{}", l),
            Operand::Metadata => write!(f, "<metadata>"),
        }
    }
}

impl Operand {
    pub(crate) fn new(
        globals: &HashMap<&str, Arc<Constant>>,
        locals: &HashMap<&Name, Arc<Operand>>,
        function: &str,
        op: &llvm_ir::Operand,
    ) -> Result<Arc<Self>, Error> {
        match op {
            llvm_ir::Operand::MetadataOperand => Ok(Arc::new(Operand::Metadata)),
            llvm_ir::Operand::ConstantOperand(constant_ref) => {
                Constant::create(globals, constant_ref)
                    .map(Operand::Constant)
                    .map(Arc::new)
            }
            llvm_ir::Operand::LocalOperand { name, .. } => {
                locals
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::UnknownLocal {
                        function: function.to_string(),
                        local: name.to_string(),
                    })
            }
        }
    }

    pub fn constant(&self) -> Option<&Constant> {
        match self {
            Operand::Constant(c) => Some(c),
            _ => None,
        }
    }

    pub fn constant_int(&self) -> Option<i64> {
        self.constant().and_then(|c| match c {
            Constant::Int { .. } => c.signed(),
            _ => None,
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Operand::Local(_))
    }

    /// Function defining this value, if it is a local
    pub fn function(&self) -> Option<&UArc<FunctionName>> {
        match self {
            Operand::Local(l) => Some(l.function()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Callee {
    Operand(Arc<Operand>),
    Asm,
}

impl Callee {
    pub(crate) fn from_either(
        globals: &HashMap<&str, Arc<Constant>>,
        locals: &HashMap<&Name, Arc<Operand>>,
        function: &str,
        callee: &either::Either<llvm_ir::instruction::InlineAssembly, llvm_ir::Operand>,
    ) -> Result<Self, Error> {
        Ok(match callee {
            either::Either::Left(_asm) => Callee::Asm,
            either::Either::Right(op) => {
                Callee::Operand(Operand::new(globals, locals, function, op)?)
            }
        })
    }

    /// Statically known target
    pub fn direct(&self) -> Option<&UArc<FunctionName>> {
        match self {
            Callee::Operand(op) => op.constant().and_then(|c| c.function()),
            Callee::Asm => None,
        }
    }

    /// Function pointer called through, for indirect calls
    pub fn indirect(&self) -> Option<&Arc<Operand>> {
        match self {
            Callee::Operand(op) if self.direct().is_none() && op.is_local() => Some(op),
            _ => None,
        }
    }
}
