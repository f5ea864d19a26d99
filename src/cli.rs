// SPDX-License-Identifier: BSD-3-Clause
use std::path::PathBuf;

/// Find missing security checks in LLVM modules
#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// LLVM modules: text IR (.ll) or bitcode
    #[arg(required = true)]
    pub modules: Vec<PathBuf>,

    /// Identify sanity checks only
    #[arg(long)]
    pub sc: bool,

    /// Identify missing-check bugs (the default)
    #[arg(long)]
    pub mc: bool,

    /// JSON configuration of the function tables and limits
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Additional error-handling functions, one name per line
    #[arg(long)]
    pub err_funcs: Option<PathBuf>,

    /// 0: warnings, 1: progress, 2: debug, 3: everything
    #[arg(long, default_value_t = 0)]
    pub verbose_level: u8,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Quiet
    #[arg(long)]
    pub quiet: bool,

    /// Write a flamegraph of the spans to ./tracing.folded
    #[arg(long)]
    pub tracing: bool,

    /// Print the time spent in each pass
    #[arg(long)]
    pub timings: bool,
}
