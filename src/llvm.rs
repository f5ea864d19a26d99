// SPDX-License-Identifier: BSD-3-Clause
//! Representation of an LLVM module that is amenable to analysis.
//!
//! Values are shared through [`Arc`]s so that the analyses can use them as
//! map keys. Locals are named by the instruction or parameter that defines
//! them and compare by identity (see [`UArc`]); constants compare
//! structurally, so a global is the same value in every module.
//!
//! Blocks are addressed by their index in [`Function::blocks`], and
//! instructions by a [`Location`].

use std::collections::HashMap;
use std::path::Path;

use llvm_ir::{types::Typed, Name};

use crate::arc::{Arc, UArc};

use self::constant::Constant;
use self::instruction::{Call, Converter, Opcode};

pub mod constant;
mod error;
pub use error::*;
mod name;
pub use name::*;
mod operand;
pub use operand::*;
pub mod instruction;
pub mod terminator;
pub use terminator::*;

/// Drop the numeric suffixes the IR linker appends to duplicated type names,
/// e.g. `struct.file_operations.1234` becomes `struct.file_operations`.
pub(crate) fn strip_linker_suffix(name: &str) -> String {
    let mut name = name;
    while let Some((stem, suffix)) = name.rsplit_once('.') {
        if stem.is_empty() || suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            break;
        }
        name = stem;
    }
    name.to_string()
}

/// Name of the named struct a pointer type points to
pub(crate) fn struct_name(ty: &llvm_ir::Type) -> Option<String> {
    match ty {
        llvm_ir::Type::PointerType { pointee_type, .. } => match &**pointee_type {
            llvm_ir::Type::NamedStructType { name } => Some(strip_linker_suffix(name)),
            _ => None,
        },
        _ => None,
    }
}

/// Printable form of a type with linker suffixes removed, so that types from
/// different modules compare equal.
fn type_key(ty: &llvm_ir::Type) -> String {
    match ty {
        llvm_ir::Type::VoidType => "void".to_string(),
        llvm_ir::Type::IntegerType { bits } => format!("i{}", bits),
        llvm_ir::Type::PointerType { pointee_type, .. } => format!("{}*", type_key(pointee_type)),
        llvm_ir::Type::FuncType {
            result_type,
            param_types,
            is_var_arg,
        } => {
            let mut params: Vec<String> = param_types.iter().map(|t| type_key(t)).collect();
            if *is_var_arg {
                params.push("...".to_string());
            }
            format!("{} ({})", type_key(result_type), params.join(", "))
        }
        llvm_ir::Type::ArrayType {
            element_type,
            num_elements,
        } => format!("[{} x {}]", num_elements, type_key(element_type)),
        llvm_ir::Type::StructType { element_types, .. } => format!(
            "{{ {} }}",
            element_types
                .iter()
                .map(|t| type_key(t))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        llvm_ir::Type::NamedStructType { name } => format!("%{}", strip_linker_suffix(name)),
        other => format!("{}", other),
    }
}

/// Function type, normalised for comparison across modules.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Signature {
    pub ret: String,
    pub params: Vec<String>,
    pub var_arg: bool,
}

impl Signature {
    pub(crate) fn new<I>(ret: &llvm_ir::TypeRef, params: I, var_arg: bool) -> Self
    where
        I: IntoIterator<Item = llvm_ir::TypeRef>,
    {
        Signature {
            ret: type_key(ret),
            params: params.into_iter().map(|t| type_key(&t)).collect(),
            var_arg,
        }
    }

    /// Signature of a function type or a pointer to one
    pub(crate) fn from_type(ty: &llvm_ir::Type) -> Option<Self> {
        match ty {
            llvm_ir::Type::FuncType {
                result_type,
                param_types,
                is_var_arg,
            } => Some(Signature::new(
                result_type,
                param_types.iter().cloned(),
                *is_var_arg,
            )),
            llvm_ir::Type::PointerType { pointee_type, .. } => Signature::from_type(pointee_type),
            _ => None,
        }
    }

    pub fn returns_pointer(&self) -> bool {
        self.ret.ends_with('*')
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut params = self.params.clone();
        if self.var_arg {
            params.push("...".to_string());
        }
        write!(f, "{} ({})", self.ret, params.join(", "))
    }
}

/// Position of an instruction in a function. `index == instrs.len()` is the
/// block terminator.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct Location {
    pub block: usize,
    pub index: usize,
}

impl Location {
    pub fn new(block: usize, index: usize) -> Self {
        Location { block, index }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Instruction {
    pub(crate) name: UArc<InstructionName>,
    /// The value this instruction defines, if any
    pub result: Option<Arc<Operand>>,
    pub opcode: Opcode,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Terminator {
    pub(crate) name: UArc<InstructionName>,
    pub result: Option<Arc<Operand>>,
    pub opcode: TerminatorOpcode,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Block {
    pub(crate) name: UArc<BlockName>,
    pub instrs: Vec<Instruction>,
    pub terminator: Arc<Terminator>,
}

impl Block {
    pub fn name(&self) -> &UArc<BlockName> {
        &self.name
    }

    /// Location of the terminator
    pub fn end(&self, block: usize) -> Location {
        Location::new(block, self.instrs.len())
    }
}

/// An instruction or a terminator
#[derive(Clone, Copy, Debug)]
pub enum Inst<'a> {
    Instruction(&'a Instruction),
    Terminator(&'a Terminator),
}

impl<'a> Inst<'a> {
    pub fn name(&self) -> &'a UArc<InstructionName> {
        match *self {
            Inst::Instruction(i) => &i.name,
            Inst::Terminator(t) => &t.name,
        }
    }

    pub fn result(&self) -> Option<&'a Arc<Operand>> {
        match *self {
            Inst::Instruction(i) => i.result.as_ref(),
            Inst::Terminator(t) => t.result.as_ref(),
        }
    }

    pub fn operands(&self) -> Vec<Arc<Operand>> {
        match *self {
            Inst::Instruction(i) => i.opcode.operands(),
            Inst::Terminator(t) => t.opcode.operands(),
        }
    }

    /// The call made here, including `invoke`s
    pub fn call(&self) -> Option<&'a Call> {
        match *self {
            Inst::Instruction(Instruction {
                opcode: Opcode::Call(c),
                ..
            }) => Some(c),
            Inst::Instruction(_) => None,
            Inst::Terminator(t) => t.opcode.call(),
        }
    }

    pub fn opcode(&self) -> Option<&'a Opcode> {
        match *self {
            Inst::Instruction(i) => Some(&i.opcode),
            Inst::Terminator(_) => None,
        }
    }

    pub fn terminator(&self) -> Option<&'a TerminatorOpcode> {
        match *self {
            Inst::Instruction(_) => None,
            Inst::Terminator(t) => Some(&t.opcode),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: UArc<FunctionName>,
    pub parameters: Vec<Arc<Operand>>,
    pub blocks: Vec<Block>,
    pub return_type: llvm_ir::TypeRef,
    pub signature: Signature,
    predecessors: Vec<Vec<usize>>,
    definitions: HashMap<Arc<Operand>, Location>,
    users: HashMap<Arc<Operand>, Vec<Location>>,
}

impl Function {
    pub(crate) fn new(
        types: &llvm_ir::types::Types,
        globals: &HashMap<&str, Arc<Constant>>,
        f: &llvm_ir::Function,
        name: &UArc<FunctionName>,
    ) -> Result<Self, Error> {
        let mut locals = HashMap::<&Name, Arc<Operand>>::new();

        let mut parameters = Vec::with_capacity(f.parameters.len());
        for (idx, p) in f.parameters.iter().enumerate() {
            // NOTE! It is important that this the only site where
            // `UArc::new(ParameterName)` is called, see docs for `UArc`.
            let p_name = UArc::new(ParameterName::new(name.clone(), p, idx));
            let op = Arc::new(Operand::Local(Arc::new(LocalName::Parameter(p_name))));
            parameters.push(op.clone());
            locals.insert(&p.name, op);
        }

        let mut block_names = Vec::with_capacity(f.basic_blocks.len());
        let mut block_indices = HashMap::<&Name, usize>::with_capacity(f.basic_blocks.len());
        // Names of instructions defining a value, by position
        let mut defined = HashMap::<(usize, usize), UArc<InstructionName>>::new();

        for (b_idx, b) in f.basic_blocks.iter().enumerate() {
            let block_name = UArc::new(BlockName::new(name.clone(), b));
            block_indices.insert(&b.name, b_idx);

            let results = b
                .instrs
                .iter()
                .map(|i| i.try_get_result())
                .chain(std::iter::once(b.term.try_get_result()));
            for (idx, result) in results.enumerate() {
                if let Some(n) = result {
                    // NOTE! One of two sites where `UArc::new(InstructionName)`
                    // is called; the other one only handles instructions
                    // without a result.
                    let inst_name =
                        UArc::new(InstructionName::new(name.clone(), block_name.clone(), idx));
                    defined.insert((b_idx, idx), inst_name.clone());
                    locals.insert(
                        n,
                        Arc::new(Operand::Local(Arc::new(LocalName::Instruction(inst_name)))),
                    );
                }
            }
            block_names.push(block_name);
        }

        let cv = Converter {
            types,
            globals,
            locals: &locals,
            blocks: &block_indices,
            function: &f.name,
        };

        let mut name_at = |b_idx: usize, idx: usize, block_name: &UArc<BlockName>| {
            defined.remove(&(b_idx, idx)).unwrap_or_else(|| {
                UArc::new(InstructionName::new(name.clone(), block_name.clone(), idx))
            })
        };

        // LLVM sometimes references variables before their definitions, so
        // this happens after all locals are known.
        let mut blocks = Vec::with_capacity(f.basic_blocks.len());
        for (b_idx, (b, block_name)) in f.basic_blocks.iter().zip(block_names).enumerate() {
            let mut instrs = Vec::with_capacity(b.instrs.len());
            for (idx, i) in b.instrs.iter().enumerate() {
                instrs.push(Instruction {
                    name: name_at(b_idx, idx, &block_name),
                    result: i.try_get_result().and_then(|n| locals.get(n).cloned()),
                    opcode: Opcode::from_instruction(&cv, i)?,
                });
            }
            let terminator = Arc::new(Terminator {
                name: name_at(b_idx, b.instrs.len(), &block_name),
                result: b.term.try_get_result().and_then(|n| locals.get(n).cloned()),
                opcode: TerminatorOpcode::from_terminator(&cv, &b.term)?,
            });
            blocks.push(Block {
                name: block_name,
                instrs,
                terminator,
            });
        }

        let mut predecessors = vec![Vec::new(); blocks.len()];
        let mut definitions = HashMap::new();
        let mut users: HashMap<Arc<Operand>, Vec<Location>> = HashMap::new();
        for (b_idx, b) in blocks.iter().enumerate() {
            for succ in b.terminator.opcode.successors() {
                if !predecessors[succ].contains(&b_idx) {
                    predecessors[succ].push(b_idx);
                }
            }
            let insts = b
                .instrs
                .iter()
                .map(Inst::Instruction)
                .chain(std::iter::once(Inst::Terminator(&b.terminator)));
            for (idx, inst) in insts.enumerate() {
                let loc = Location::new(b_idx, idx);
                if let Some(r) = inst.result() {
                    definitions.insert(r.clone(), loc);
                }
                for op in inst.operands() {
                    if op.is_local() {
                        let locs = users.entry(op).or_default();
                        if locs.last() != Some(&loc) {
                            locs.push(loc);
                        }
                    }
                }
            }
        }

        Ok(Function {
            name: name.clone(),
            parameters,
            blocks,
            return_type: f.return_type.clone(),
            signature: Signature::new(
                &f.return_type,
                f.parameters.iter().map(|p| p.ty.clone()),
                f.is_var_arg,
            ),
            predecessors,
            definitions,
            users,
        })
    }

    pub fn successors(&self, block: usize) -> Vec<usize> {
        self.blocks[block].terminator.opcode.successors()
    }

    pub fn predecessors(&self, block: usize) -> &[usize] {
        &self.predecessors[block]
    }

    pub fn instruction_at(&self, loc: Location) -> Option<Inst<'_>> {
        let b = self.blocks.get(loc.block)?;
        if loc.index == b.instrs.len() {
            Some(Inst::Terminator(&b.terminator))
        } else {
            b.instrs.get(loc.index).map(Inst::Instruction)
        }
    }

    /// Where a local is defined; `None` for parameters and constants
    pub fn definition(&self, value: &Arc<Operand>) -> Option<Location> {
        self.definitions.get(value).copied()
    }

    /// Instructions reading a local, in program order
    pub fn users(&self, value: &Arc<Operand>) -> &[Location] {
        self.users.get(value).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Look through casts to the value they were applied to
    pub fn strip_casts(&self, value: &Arc<Operand>) -> Arc<Operand> {
        let mut value = value.clone();
        // A cast chain is never longer than the number of definitions
        for _ in 0..self.definitions.len() + 1 {
            let next = match self.definition(&value).and_then(|l| self.instruction_at(l)) {
                Some(Inst::Instruction(Instruction {
                    opcode: Opcode::Cast(c),
                    ..
                })) => c.operand.clone(),
                _ => break,
            };
            value = next;
        }
        value
    }

    pub fn parameter_index(&self, value: &Arc<Operand>) -> Option<usize> {
        self.parameters.iter().position(|p| p == value)
    }

    /// All instructions, terminators included, in program order
    pub fn instructions(&self) -> impl Iterator<Item = (Location, Inst<'_>)> + '_ {
        self.blocks.iter().enumerate().flat_map(|(b_idx, b)| {
            b.instrs
                .iter()
                .map(Inst::Instruction)
                .chain(std::iter::once(Inst::Terminator(&b.terminator)))
                .enumerate()
                .map(move |(idx, inst)| (Location::new(b_idx, idx), inst))
        })
    }

    /// Blocks ending in `ret`
    pub fn return_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| matches!(b.terminator.opcode, TerminatorOpcode::Ret(_)))
            .map(|(i, _)| i)
    }

    pub fn returns_pointer(&self) -> bool {
        matches!(*self.return_type, llvm_ir::Type::PointerType { .. })
    }
}

#[derive(Clone, Debug)]
pub struct Decl {
    pub name: UArc<FunctionName>,
    pub parameters: Vec<llvm_ir::TypeRef>,
    pub return_type: llvm_ir::TypeRef,
    pub signature: Signature,
}

impl Decl {
    pub(crate) fn new(
        name: &UArc<FunctionName>,
        d: &llvm_ir::function::FunctionDeclaration,
    ) -> Self {
        Decl {
            name: name.clone(),
            parameters: d.parameters.iter().map(|p| p.ty.clone()).collect(),
            return_type: d.return_type.clone(),
            signature: Signature::new(
                &d.return_type,
                d.parameters.iter().map(|p| p.ty.clone()),
                d.is_var_arg,
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Global {
    pub name: Arc<GlobalName>,
    pub initializer: Option<Arc<Constant>>,
    pub is_const: bool,
    pub ty: llvm_ir::TypeRef,
}

impl Global {
    pub(crate) fn new(
        globals: &HashMap<&str, Arc<Constant>>,
        name: &Arc<GlobalName>,
        g: &llvm_ir::module::GlobalVariable,
    ) -> Result<Self, Error> {
        Ok(Global {
            name: name.clone(),
            initializer: match &g.initializer {
                None => None,
                Some(i) => Some(Constant::create(globals, i)?),
            },
            is_const: g.is_constant,
            ty: g.ty.clone(),
        })
    }
}

#[derive(Debug)]
pub struct Module {
    pub name: String,
    /// Definitions, in the order of the IR file
    pub functions: Vec<Function>,
    pub decls: Vec<Decl>,
    pub globals: Vec<Global>,
    by_name: HashMap<String, usize>,
}

impl Module {
    /// Collect names of functions, global variables into Arcs so they can
    /// be shared
    fn global_names(m: &llvm_ir::Module) -> HashMap<&str, Arc<Constant>> {
        let mut global_names: HashMap<&str, Arc<Constant>> = HashMap::with_capacity(
            m.functions.len() + m.func_declarations.len() + m.global_vars.len(),
        );
        for f in &m.functions {
            global_names.insert(
                f.name.as_ref(),
                // NOTE! It is *crucial* that this is the only callsite of
                // FunctionName::definition. This ensures that all other
                // instances of `UArc<FunctionName>` in this module are copies
                // of this pointer.
                Arc::new(Constant::Function(UArc::new(FunctionName::definition(f)))),
            );
        }
        for f in &m.func_declarations {
            global_names.insert(
                f.name.as_ref(),
                // See above NOTE!
                Arc::new(Constant::Function(UArc::new(FunctionName::declaration(f)))),
            );
        }
        for g in &m.global_vars {
            global_names.insert(
                g.name.as_ref(),
                Arc::new(Constant::Global(Arc::new(GlobalName::new(g)))),
            );
        }
        for g in &m.global_aliases {
            global_names.insert(
                g.name.as_ref(),
                Arc::new(Constant::Global(Arc::new(GlobalName::alias(g)))),
            );
        }
        global_names
    }

    fn function_name(
        global_names: &HashMap<&str, Arc<Constant>>,
        name: &str,
    ) -> Result<UArc<FunctionName>, Error> {
        match global_names.get(name).map(|c| &**c) {
            Some(Constant::Function(f)) => Ok(f.clone()),
            _ => Err(Error::UnknownGlobal(name.to_string())),
        }
    }

    pub fn new(name: impl Into<String>, m: &llvm_ir::Module) -> Result<Self, Error> {
        let global_names = Self::global_names(m);

        let mut functions = Vec::with_capacity(m.functions.len());
        let mut by_name = HashMap::with_capacity(m.functions.len());
        for f in &m.functions {
            let name = Self::function_name(&global_names, &f.name)?;
            by_name.insert(f.name.clone(), functions.len());
            functions.push(Function::new(&m.types, &global_names, f, &name)?);
        }

        let mut decls = Vec::with_capacity(m.func_declarations.len());
        for d in &m.func_declarations {
            let name = Self::function_name(&global_names, &d.name)?;
            decls.push(Decl::new(&name, d));
        }

        let mut globals = Vec::with_capacity(m.global_vars.len());
        for g in &m.global_vars {
            let name = match global_names.get::<str>(g.name.as_ref()).map(|c| &**c) {
                Some(Constant::Global(n)) => n.clone(),
                _ => return Err(Error::UnknownGlobal(g.name.clone())),
            };
            globals.push(Global::new(&global_names, &name, g)?);
        }

        Ok(Module {
            name: name.into(),
            functions,
            decls,
            globals,
            by_name,
        })
    }

    /// Parse textual IR (`.ll`) or bitcode, depending on the extension.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let parsed = if path.extension().map_or(false, |e| e == "ll") {
            llvm_ir::Module::from_ir_path(path)
        } else {
            llvm_ir::Module::from_bc_path(path)
        };
        let module = parsed.map_err(|message| Error::Parse {
            path: path.display().to_string(),
            message,
        })?;
        Module::new(path.display().to_string(), &module)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.by_name.get(name).map(|i| &self.functions[*i])
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::{strip_linker_suffix, type_key};

    #[test]
    fn linker_suffix() {
        assert_eq!(strip_linker_suffix("struct.file_operations.1234"), "struct.file_operations");
        assert_eq!(strip_linker_suffix("struct.ops.1.2"), "struct.ops");
        assert_eq!(strip_linker_suffix("struct.v4l2"), "struct.v4l2");
        assert_eq!(strip_linker_suffix("union.anon"), "union.anon");
    }

    #[test]
    fn type_keys_ignore_suffix() {
        let a = llvm_ir::Type::NamedStructType {
            name: "struct.ops.7".to_string(),
        };
        let b = llvm_ir::Type::NamedStructType {
            name: "struct.ops".to_string(),
        };
        assert_eq!(type_key(&a), type_key(&b));
        assert_eq!(type_key(&llvm_ir::Type::IntegerType { bits: 32 }), "i32");
    }
}
