// SPDX-License-Identifier: BSD-3-Clause
pub mod callgraph;
pub mod checks;
pub mod context;
pub mod dataflow;
pub mod missing;
pub mod pass;
pub mod pointer;

use tracing::info;

use callgraph::CallGraphPass;
use checks::SecurityChecksPass;
use context::GlobalContext;
use missing::{MissingChecksPass, Report};
use pass::run;
use pointer::PointerPass;

/// Build the callgraph and identify the security checks of every function
pub fn identify_sanity_checks(ctx: &mut GlobalContext) {
    run(&mut CallGraphPass::new(), ctx);
    run(&mut SecurityChecksPass::new(), ctx);
    info!(
        "{} security checks, {} conditional statements",
        ctx.counters.security_checks, ctx.counters.conditional_statements
    );
}

/// Run the whole pipeline and report the likely missing checks
pub fn identify_missing_checks(ctx: &mut GlobalContext) -> Report {
    run(&mut CallGraphPass::new(), ctx);
    run(&mut PointerPass::new(), ctx);
    run(&mut SecurityChecksPass::new(), ctx);
    run(&mut MissingChecksPass::new(), ctx);
    missing::process_results(ctx)
}
