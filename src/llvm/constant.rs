// SPDX-License-Identifier: BSD-3-Clause
use std::{collections::HashMap, fmt::Display};

use crate::arc::{Arc, UArc};

use super::error::Error;
use super::name::{FunctionName, GlobalName};

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Struct {
    /// Named struct type of the aggregate, with linker suffixes stripped
    pub(crate) name: Option<String>,
    pub(crate) fields: Vec<Arc<Constant>>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Constant {
    Function(UArc<FunctionName>),
    Global(Arc<GlobalName>),
    Int { bits: u32, value: u64 },
    Null,
    Undef,
    AggregateZero,
    // Expressions that keep pointing at their operand
    BitCast(Arc<Constant>),
    GetElementPtr(Arc<Constant>),
    PtrToInt(Arc<Constant>),
    IntToPtr(Arc<Constant>),
    //
    Array(Vec<Arc<Constant>>),
    Struct(Struct),
    //
    Other,
}

impl Constant {
    pub fn create(
        globals: &HashMap<&str, Arc<Constant>>,
        constant: &llvm_ir::Constant,
    ) -> Result<Arc<Self>, Error> {
        let nested = |c: &llvm_ir::ConstantRef| Constant::create(globals, c);
        match &constant {
            llvm_ir::Constant::GlobalReference { name, .. } => {
                match globals.get::<str>(name.as_ref()) {
                    Some(nm) => Ok(nm.clone()),
                    None => Err(Error::UnknownGlobal(name.to_string())),
                }
            }
            llvm_ir::Constant::Int { value, bits } => Ok(Arc::new(Constant::Int {
                value: *value,
                bits: *bits,
            })),
            llvm_ir::Constant::Null(_) => Ok(Arc::new(Constant::Null)),
            llvm_ir::Constant::Undef(_) => Ok(Arc::new(Constant::Undef)),
            llvm_ir::Constant::Poison(_) => Ok(Arc::new(Constant::Undef)),
            llvm_ir::Constant::AggregateZero(_) => Ok(Arc::new(Constant::AggregateZero)),
            llvm_ir::Constant::BitCast(b) => Ok(Arc::new(Constant::BitCast(nested(&b.operand)?))),
            llvm_ir::Constant::AddrSpaceCast(b) => {
                Ok(Arc::new(Constant::BitCast(nested(&b.operand)?)))
            }
            llvm_ir::Constant::GetElementPtr(g) => {
                Ok(Arc::new(Constant::GetElementPtr(nested(&g.address)?)))
            }
            llvm_ir::Constant::PtrToInt(c) => Ok(Arc::new(Constant::PtrToInt(nested(&c.operand)?))),
            llvm_ir::Constant::IntToPtr(c) => Ok(Arc::new(Constant::IntToPtr(nested(&c.operand)?))),
            llvm_ir::Constant::Array { elements, .. } => {
                let mut es = Vec::with_capacity(elements.len());
                for e in elements {
                    es.push(nested(e)?);
                }
                Ok(Arc::new(Constant::Array(es)))
            }
            llvm_ir::Constant::Struct { name, values, .. } => {
                let mut fields = Vec::with_capacity(values.len());
                for v in values {
                    fields.push(nested(v)?);
                }
                Ok(Arc::new(Constant::Struct(Struct {
                    name: name.as_deref().map(super::strip_linker_suffix),
                    fields,
                })))
            }
            // Floats, vectors, block addresses and the remaining constant
            // expressions carry neither pointers nor error codes we track.
            _ => Ok(Arc::new(Constant::Other)),
        }
    }

    /// Integer value, sign-extended from its bit width
    pub fn signed(&self) -> Option<i64> {
        match self {
            Constant::Int { bits, value } => {
                if *bits == 0 || *bits >= 64 {
                    Some(*value as i64)
                } else {
                    let shift = 64 - bits;
                    Some(((*value << shift) as i64) >> shift)
                }
            }
            Constant::IntToPtr(c) => c.signed(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Constant::Null | Constant::AggregateZero => true,
            Constant::BitCast(c) => c.is_null(),
            Constant::IntToPtr(c) => c.signed() == Some(0),
            _ => false,
        }
    }

    /// The function this constant designates, looking through casts
    pub fn function(&self) -> Option<&UArc<FunctionName>> {
        match self {
            Constant::Function(f) => Some(f),
            Constant::BitCast(c) => c.function(),
            _ => None,
        }
    }

    /// Functions and globals whose address this constant contains
    pub fn pointers(&self) -> Vec<Constant> {
        match self {
            Constant::Function(_) => vec![self.clone()],
            Constant::Global(_) => vec![self.clone()],
            Constant::BitCast(c) => c.pointers(),
            Constant::GetElementPtr(c) => c.pointers(),
            Constant::PtrToInt(c) => c.pointers(),
            Constant::IntToPtr(c) => c.pointers(),
            Constant::Array(v) => v.iter().flat_map(|c| c.pointers()).collect(),
            Constant::Struct(Struct { fields, .. }) => {
                fields.iter().flat_map(|c| c.pointers()).collect()
            }
            // No `_` pattern to ensure this is updated if the type changes
            Constant::Int { .. } => vec![],
            Constant::Null => vec![],
            Constant::Undef => vec![],
            Constant::AggregateZero => vec![],
            Constant::Other => vec![],
        }
    }

    /// Functions whose address this constant contains
    pub fn functions(&self) -> Vec<UArc<FunctionName>> {
        self.pointers()
            .into_iter()
            .filter_map(|c| match c {
                Constant::Function(f) => Some(f),
                _ => None,
            })
            .collect()
    }
}

impl Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Function(func) => write!(f, "{}", func),
            Constant::Global(g) => write!(f, "{}", g),
            Constant::Int { bits, .. } => match self.signed() {
                Some(v) => write!(f, "i{} {}", bits, v),
                None => write!(f, "i{} ?", bits),
            },
            Constant::Null => write!(f, "null"),
            Constant::Undef => write!(f, "undef"),
            Constant::AggregateZero => write!(f, "zeroinitializer"),
            Constant::BitCast(c) => write!(f, "bitcast({})", c),
            Constant::GetElementPtr(c) => write!(f, "getelementptr({})", c),
            Constant::PtrToInt(c) => write!(f, "ptrtoint({})", c),
            Constant::IntToPtr(c) => write!(f, "inttoptr({})", c),
            Constant::Array(a) => write!(
                f,
                "[ {} ]",
                a.iter()
                    .map(|c| format!("{}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Constant::Struct(s) => write!(
                f,
                "{{ {} }}",
                s.fields
                    .iter()
                    .map(|c| format!("{}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Constant::Other => write!(f, "<some constant>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Constant;
    use crate::arc::Arc;

    #[test]
    fn sign_extension() {
        let c = Constant::Int {
            bits: 32,
            value: 0xFFFF_FFEA,
        };
        assert_eq!(c.signed(), Some(-22));
        let c = Constant::Int { bits: 64, value: 5 };
        assert_eq!(c.signed(), Some(5));
        let c = Constant::IntToPtr(Arc::new(Constant::Int {
            bits: 64,
            value: u64::MAX - 13,
        }));
        assert_eq!(c.signed(), Some(-14));
        assert!(!c.is_null());
        assert!(Constant::BitCast(Arc::new(Constant::Null)).is_null());
    }
}
