// SPDX-License-Identifier: BSD-3-Clause
//! Shared ownership for IR entities. Names of functions, blocks and
//! instructions are allocated once during conversion and compared by address
//! afterwards, see [`UArc`].

pub use triomphe::Arc;

mod uarc;
pub use uarc::*;
