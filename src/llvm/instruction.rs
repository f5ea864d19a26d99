// SPDX-License-Identifier: BSD-3-Clause
use std::collections::HashMap;

use either::Either;
use llvm_ir::{
    function::ParameterAttribute,
    instruction::InlineAssembly,
    types::{Typed, Types},
    Name,
};

use crate::arc::Arc;
use crate::config::ArgIndex;

use super::constant::Constant;
use super::error::Error;
use super::operand::{Callee, Operand};
use super::{struct_name, Signature};

/// Shared state for converting the instructions of one function
pub(crate) struct Converter<'a> {
    pub(crate) types: &'a Types,
    pub(crate) globals: &'a HashMap<&'a str, Arc<Constant>>,
    pub(crate) locals: &'a HashMap<&'a Name, Arc<Operand>>,
    pub(crate) blocks: &'a HashMap<&'a Name, usize>,
    pub(crate) function: &'a str,
}

impl Converter<'_> {
    pub(crate) fn operand(&self, op: &llvm_ir::Operand) -> Result<Arc<Operand>, Error> {
        Operand::new(self.globals, self.locals, self.function, op)
    }

    pub(crate) fn block(&self, name: &Name) -> Result<usize, Error> {
        self.blocks
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownBlock {
                function: self.function.to_string(),
                block: name.to_string(),
            })
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Binary {
    pub op: BinaryOp,
    pub operand0: Arc<Operand>,
    pub operand1: Arc<Operand>,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CastOp {
    BitCast,
    AddrSpaceCast,
    IntToPtr,
    PtrToInt,
    Trunc,
    ZExt,
    SExt,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Cast {
    pub op: CastOp,
    pub operand: Arc<Operand>,
    /// Named struct pointed to by the operand, if any
    pub from_struct: Option<String>,
    /// Named struct pointed to by the result, if any
    pub to_struct: Option<String>,
}

impl Cast {
    fn new(
        cv: &Converter<'_>,
        op: CastOp,
        operand: &llvm_ir::Operand,
        to_type: &llvm_ir::TypeRef,
    ) -> Result<Self, Error> {
        Ok(Cast {
            op,
            operand: cv.operand(operand)?,
            from_struct: struct_name(&operand.get_type(cv.types)),
            to_struct: struct_name(to_type),
        })
    }

    /// A cast between pointers to different struct types, or between a
    /// struct pointer and something else.
    pub fn changes_struct(&self) -> bool {
        (self.from_struct.is_some() || self.to_struct.is_some()) && self.from_struct != self.to_struct
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Call {
    pub callee: Callee,
    pub args: Vec<Arc<Operand>>,
    /// Function type the call site expects
    pub signature: Signature,
}

impl Call {
    pub(crate) fn new(
        cv: &Converter<'_>,
        function: &Either<InlineAssembly, llvm_ir::Operand>,
        arguments: &[(llvm_ir::Operand, Vec<ParameterAttribute>)],
        result_type: &llvm_ir::TypeRef,
    ) -> Result<Self, Error> {
        let mut args = Vec::with_capacity(arguments.len());
        for (op, _) in arguments {
            args.push(cv.operand(op)?);
        }
        let callee_type = match function {
            Either::Left(asm) => asm.ty.clone(),
            Either::Right(op) => op.get_type(cv.types),
        };
        let signature = Signature::from_type(&callee_type).unwrap_or_else(|| {
            Signature::new(
                result_type,
                arguments.iter().map(|(op, _)| op.get_type(cv.types)),
                false,
            )
        });
        Ok(Call {
            callee: Callee::from_either(cv.globals, cv.locals, cv.function, function)?,
            args,
            signature,
        })
    }

    pub(crate) fn from_call(
        cv: &Converter<'_>,
        call: &llvm_ir::instruction::Call,
    ) -> Result<Self, Error> {
        Call::new(cv, &call.function, &call.arguments, &call.get_type(cv.types))
    }

    /// Callee operand followed by the arguments
    pub fn operands(&self) -> Vec<Arc<Operand>> {
        let mut os = match &self.callee {
            Callee::Asm => vec![],
            Callee::Operand(op) => vec![op.clone()],
        };
        os.extend(self.args.iter().cloned());
        os
    }

    /// Argument at a call position; `Return` has no argument
    pub fn arg(&self, idx: ArgIndex) -> Option<&Arc<Operand>> {
        match idx {
            ArgIndex::Arg(i) => self.args.get(i),
            ArgIndex::Return => None,
        }
    }
}

/// A field of a named struct
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FieldRef {
    pub struct_name: String,
    pub index: u64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct GetElementPtr {
    pub pointer: Arc<Operand>,
    pub indices: Vec<Arc<Operand>>,
    /// Set when this computes the address of a field of a named struct
    pub field: Option<FieldRef>,
}

impl GetElementPtr {
    pub(crate) fn from_gep(
        cv: &Converter<'_>,
        gep: &llvm_ir::instruction::GetElementPtr,
    ) -> Result<Self, Error> {
        let mut indices = Vec::with_capacity(gep.indices.len());
        for i in &gep.indices {
            indices.push(cv.operand(i)?);
        }
        // The first index steps over whole objects; the second one selects
        // the field.
        // https://www.llvm.org/docs/GetElementPtr.html
        let field = match (
            struct_name(&gep.address.get_type(cv.types)),
            indices.get(1).and_then(|i| i.constant_int()),
        ) {
            (Some(struct_name), Some(index)) if index >= 0 => Some(FieldRef {
                struct_name,
                index: index as u64,
            }),
            _ => None,
        };
        Ok(GetElementPtr {
            pointer: cv.operand(&gep.address)?,
            indices,
            field,
        })
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Predicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl From<llvm_ir::IntPredicate> for Predicate {
    fn from(p: llvm_ir::IntPredicate) -> Self {
        match p {
            llvm_ir::IntPredicate::EQ => Predicate::Eq,
            llvm_ir::IntPredicate::NE => Predicate::Ne,
            llvm_ir::IntPredicate::UGT => Predicate::Ugt,
            llvm_ir::IntPredicate::UGE => Predicate::Uge,
            llvm_ir::IntPredicate::ULT => Predicate::Ult,
            llvm_ir::IntPredicate::ULE => Predicate::Ule,
            llvm_ir::IntPredicate::SGT => Predicate::Sgt,
            llvm_ir::IntPredicate::SGE => Predicate::Sge,
            llvm_ir::IntPredicate::SLT => Predicate::Slt,
            llvm_ir::IntPredicate::SLE => Predicate::Sle,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Icmp {
    pub predicate: Predicate,
    pub operand0: Arc<Operand>,
    pub operand1: Arc<Operand>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Load {
    pub pointer: Arc<Operand>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Phi {
    /// Incoming values with the index of the block they come from
    pub values: Vec<(Arc<Operand>, usize)>,
}

impl Phi {
    pub(crate) fn from_phi(cv: &Converter<'_>, phi: &llvm_ir::instruction::Phi) -> Result<Self, Error> {
        let mut values = Vec::with_capacity(phi.incoming_values.len());
        for (value, block) in &phi.incoming_values {
            values.push((cv.operand(value)?, cv.block(block)?));
        }
        Ok(Phi { values })
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Select {
    pub condition: Arc<Operand>,
    pub true_value: Arc<Operand>,
    pub false_value: Arc<Operand>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Store {
    pub value: Arc<Operand>,
    pub pointer: Arc<Operand>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Opcode {
    Alloca,
    Binary(Binary),
    Call(Call),
    Cast(Cast),
    ExtractValue(Arc<Operand>),
    GetElementPtr(GetElementPtr),
    Icmp(Icmp),
    Load(Load),
    Phi(Phi),
    Select(Select),
    Store(Store),
    //
    Other,
}

impl Opcode {
    pub(crate) fn from_instruction(
        cv: &Converter<'_>,
        i: &llvm_ir::Instruction,
    ) -> Result<Self, Error> {
        macro_rules! binary {
            ($i:expr, $op:expr) => {
                Opcode::Binary(Binary {
                    op: $op,
                    operand0: cv.operand(&$i.operand0)?,
                    operand1: cv.operand(&$i.operand1)?,
                })
            };
        }
        macro_rules! cast {
            ($i:expr, $op:expr) => {
                Opcode::Cast(Cast::new(cv, $op, &$i.operand, &$i.to_type)?)
            };
        }
        Ok(match i {
            llvm_ir::Instruction::Add(i) => binary!(i, BinaryOp::Add),
            llvm_ir::Instruction::Sub(i) => binary!(i, BinaryOp::Sub),
            llvm_ir::Instruction::Mul(i) => binary!(i, BinaryOp::Mul),
            llvm_ir::Instruction::UDiv(i) => binary!(i, BinaryOp::UDiv),
            llvm_ir::Instruction::SDiv(i) => binary!(i, BinaryOp::SDiv),
            llvm_ir::Instruction::URem(i) => binary!(i, BinaryOp::URem),
            llvm_ir::Instruction::SRem(i) => binary!(i, BinaryOp::SRem),
            llvm_ir::Instruction::And(i) => binary!(i, BinaryOp::And),
            llvm_ir::Instruction::Or(i) => binary!(i, BinaryOp::Or),
            llvm_ir::Instruction::Xor(i) => binary!(i, BinaryOp::Xor),
            llvm_ir::Instruction::Shl(i) => binary!(i, BinaryOp::Shl),
            llvm_ir::Instruction::LShr(i) => binary!(i, BinaryOp::LShr),
            llvm_ir::Instruction::AShr(i) => binary!(i, BinaryOp::AShr),

            llvm_ir::Instruction::BitCast(i) => cast!(i, CastOp::BitCast),
            llvm_ir::Instruction::AddrSpaceCast(i) => cast!(i, CastOp::AddrSpaceCast),
            llvm_ir::Instruction::IntToPtr(i) => cast!(i, CastOp::IntToPtr),
            llvm_ir::Instruction::PtrToInt(i) => cast!(i, CastOp::PtrToInt),
            llvm_ir::Instruction::Trunc(i) => cast!(i, CastOp::Trunc),
            llvm_ir::Instruction::ZExt(i) => cast!(i, CastOp::ZExt),
            llvm_ir::Instruction::SExt(i) => cast!(i, CastOp::SExt),

            llvm_ir::Instruction::Alloca(_) => Opcode::Alloca,

            llvm_ir::Instruction::Call(call) => Opcode::Call(Call::from_call(cv, call)?),

            llvm_ir::Instruction::ExtractValue(i) => {
                Opcode::ExtractValue(cv.operand(&i.aggregate)?)
            }

            llvm_ir::Instruction::GetElementPtr(gep) => {
                Opcode::GetElementPtr(GetElementPtr::from_gep(cv, gep)?)
            }

            llvm_ir::Instruction::ICmp(icmp) => Opcode::Icmp(Icmp {
                predicate: Predicate::from(icmp.predicate),
                operand0: cv.operand(&icmp.operand0)?,
                operand1: cv.operand(&icmp.operand1)?,
            }),

            llvm_ir::Instruction::Load(load) => Opcode::Load(Load {
                pointer: cv.operand(&load.address)?,
            }),

            llvm_ir::Instruction::Phi(phi) => Opcode::Phi(Phi::from_phi(cv, phi)?),

            llvm_ir::Instruction::Select(select) => Opcode::Select(Select {
                condition: cv.operand(&select.condition)?,
                true_value: cv.operand(&select.true_value)?,
                false_value: cv.operand(&select.false_value)?,
            }),

            llvm_ir::Instruction::Store(store) => Opcode::Store(Store {
                pointer: cv.operand(&store.address)?,
                value: cv.operand(&store.value)?,
            }),

            _ => Opcode::Other,
        })
    }

    /// Values this instruction reads
    pub fn operands(&self) -> Vec<Arc<Operand>> {
        match self {
            Opcode::Alloca => vec![],
            Opcode::Binary(b) => vec![b.operand0.clone(), b.operand1.clone()],
            Opcode::Call(c) => c.operands(),
            Opcode::Cast(c) => vec![c.operand.clone()],
            Opcode::ExtractValue(a) => vec![a.clone()],
            Opcode::GetElementPtr(g) => {
                let mut ops = vec![g.pointer.clone()];
                ops.extend(g.indices.iter().cloned());
                ops
            }
            Opcode::Icmp(i) => vec![i.operand0.clone(), i.operand1.clone()],
            Opcode::Load(l) => vec![l.pointer.clone()],
            Opcode::Phi(p) => p.values.iter().map(|(v, _)| v.clone()).collect(),
            Opcode::Select(s) => vec![
                s.condition.clone(),
                s.true_value.clone(),
                s.false_value.clone(),
            ],
            Opcode::Store(s) => vec![s.value.clone(), s.pointer.clone()],
            //
            Opcode::Other => vec![],
        }
    }
}
