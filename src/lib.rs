// SPDX-License-Identifier: BSD-3-Clause
//! Whole-program detection of missing security checks in LLVM IR.
//!
//! The pipeline runs as a sequence of [`analysis::pass::ModulePass`]es over
//! every loaded module, sharing an [`analysis::context::GlobalContext`]:
//!
//! 1. callgraph, with indirect calls resolved by signature and by the struct
//!    fields and globals function pointers are stored in
//! 2. pointer analysis
//! 3. security checks: branches with one side leading to error handling
//! 4. missing checks: per source/use pair, is there a check in between?

pub mod analysis;
pub mod arc;
pub mod config;
pub mod lattice;
pub mod llvm;

pub use arc::{Arc, UArc};
pub use config::{ArgIndex, Config};
pub use llvm::Module;
