// SPDX-License-Identifier: BSD-3-Clause
//! Custom `tracing` layers

mod timings;
pub use timings::TimingLayer;
