// SPDX-License-Identifier: BSD-3-Clause
use llvm_ir::types::Typed;

use crate::arc::Arc;

use super::constant::Constant;
use super::error::Error;
use super::instruction::{Call, Converter};
use super::operand::Operand;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Invoke {
    pub call: Call,
    pub return_dest: usize,
    pub exception_dest: usize,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CondBr {
    pub condition: Arc<Operand>,
    pub true_dest: usize,
    pub false_dest: usize,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Switch {
    pub operand: Arc<Operand>,
    pub dests: Vec<(Arc<Operand>, usize)>,
    pub default_dest: usize,
}

/// Block terminators. Destinations are indices into the function's blocks.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum TerminatorOpcode {
    Ret(Option<Arc<Operand>>),
    Br(usize),
    CondBr(CondBr),
    Switch(Switch),
    Invoke(Invoke),
    Unreachable,
    /// Anything else, with its successors
    Other(Vec<usize>),
}

impl TerminatorOpcode {
    pub(crate) fn from_terminator(
        cv: &Converter<'_>,
        t: &llvm_ir::Terminator,
    ) -> Result<Self, Error> {
        Ok(match t {
            llvm_ir::Terminator::Ret(ret) => TerminatorOpcode::Ret(match &ret.return_operand {
                Some(o) => Some(cv.operand(o)?),
                None => None,
            }),
            llvm_ir::Terminator::Br(br) => TerminatorOpcode::Br(cv.block(&br.dest)?),
            llvm_ir::Terminator::CondBr(br) => TerminatorOpcode::CondBr(CondBr {
                condition: cv.operand(&br.condition)?,
                true_dest: cv.block(&br.true_dest)?,
                false_dest: cv.block(&br.false_dest)?,
            }),
            llvm_ir::Terminator::Switch(s) => {
                let mut dests = Vec::with_capacity(s.dests.len());
                for (c, d) in &s.dests {
                    let c = Operand::Constant(Constant::create(cv.globals, c)?);
                    dests.push((Arc::new(c), cv.block(d)?));
                }
                TerminatorOpcode::Switch(Switch {
                    operand: cv.operand(&s.operand)?,
                    dests,
                    default_dest: cv.block(&s.default_dest)?,
                })
            }
            llvm_ir::Terminator::Invoke(invoke) => TerminatorOpcode::Invoke(Invoke {
                call: Call::new(
                    cv,
                    &invoke.function,
                    &invoke.arguments,
                    &invoke.get_type(cv.types),
                )?,
                return_dest: cv.block(&invoke.return_label)?,
                exception_dest: cv.block(&invoke.exception_label)?,
            }),
            llvm_ir::Terminator::Unreachable(_) => TerminatorOpcode::Unreachable,
            llvm_ir::Terminator::IndirectBr(i) => {
                let mut succs = Vec::with_capacity(i.possible_dests.len());
                for d in &i.possible_dests {
                    succs.push(cv.block(d)?);
                }
                TerminatorOpcode::Other(succs)
            }
            llvm_ir::Terminator::CallBr(c) => {
                let mut succs = vec![cv.block(&c.return_label)?];
                for d in &c.other_labels {
                    succs.push(cv.block(d)?);
                }
                TerminatorOpcode::Other(succs)
            }
            _ => TerminatorOpcode::Other(Vec::new()),
        })
    }

    /// Successor block indices, in branch order
    pub fn successors(&self) -> Vec<usize> {
        match self {
            TerminatorOpcode::Ret(_) => vec![],
            TerminatorOpcode::Br(d) => vec![*d],
            TerminatorOpcode::CondBr(c) => vec![c.true_dest, c.false_dest],
            TerminatorOpcode::Switch(s) => {
                let mut v: Vec<usize> = s.dests.iter().map(|(_, d)| *d).collect();
                v.push(s.default_dest);
                v
            }
            TerminatorOpcode::Invoke(i) => vec![i.return_dest, i.exception_dest],
            TerminatorOpcode::Unreachable => vec![],
            TerminatorOpcode::Other(succs) => succs.clone(),
        }
    }

    /// Values this terminator reads
    pub fn operands(&self) -> Vec<Arc<Operand>> {
        match self {
            TerminatorOpcode::Ret(o) => o.iter().cloned().collect(),
            TerminatorOpcode::Br(_) => vec![],
            TerminatorOpcode::CondBr(c) => vec![c.condition.clone()],
            TerminatorOpcode::Switch(s) => vec![s.operand.clone()],
            TerminatorOpcode::Invoke(i) => i.call.operands(),
            TerminatorOpcode::Unreachable => vec![],
            TerminatorOpcode::Other(_) => vec![],
        }
    }

    pub fn call(&self) -> Option<&Call> {
        match self {
            TerminatorOpcode::Invoke(i) => Some(&i.call),
            _ => None,
        }
    }
}
