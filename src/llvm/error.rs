// SPDX-License-Identifier: BSD-3-Clause
#[derive(Clone, Debug, Hash, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Malformed LLVM module: reference to unknown global {0}")]
    UnknownGlobal(String),
    #[error("Malformed LLVM module: reference to unknown local {local} in @{function}")]
    UnknownLocal { function: String, local: String },
    #[error("Malformed LLVM module: branch to unknown block {block} in @{function}")]
    UnknownBlock { function: String, block: String },
    #[error("Couldn't parse LLVM module {path}: {message}")]
    Parse { path: String, message: String },
}
