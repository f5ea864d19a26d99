// SPDX-License-Identifier: BSD-3-Clause
//! Fixed-point driver for passes over all modules

use tracing::{info, info_span};

use super::context::GlobalContext;

/// A pass that runs over every module until nothing changes.
pub trait ModulePass {
    fn id(&self) -> &'static str;

    /// Repeated over all modules while any call returns `true`.
    fn initialize(&mut self, _ctx: &mut GlobalContext, _module: usize) -> bool {
        false
    }

    /// Returns `true` when the pass changed the global state.
    fn run_on_module(&mut self, ctx: &mut GlobalContext, module: usize) -> bool;

    /// Called once per module after the fixed point is reached.
    fn finalize(&mut self, _ctx: &mut GlobalContext, _module: usize) {}
}

pub fn run<P: ModulePass + ?Sized>(pass: &mut P, ctx: &mut GlobalContext) {
    let id = pass.id();
    let span = info_span!("pass", id);
    let _span = span.enter();

    let total = ctx.modules.len();
    info!("[{}] Initializing {} modules", id, total);
    let mut again = true;
    while again {
        again = false;
        for m in 0..total {
            again |= pass.initialize(ctx, m);
        }
    }

    let mut iter = 0;
    let mut changed = 1;
    while changed > 0 {
        iter += 1;
        changed = 0;
        for m in 0..total {
            info!(
                "[{} / {}] [{} / {}] [{}]",
                id,
                iter,
                m + 1,
                total,
                ctx.modules[m].name
            );
            if pass.run_on_module(ctx, m) {
                changed += 1;
                info!("[CHANGED]");
            }
        }
        info!("[{}] Updated in {} modules.", id, changed);
    }

    info!("[{}] Postprocessing ...", id);
    for m in 0..total {
        pass.finalize(ctx, m);
    }
    info!("[{}] Done!", id);
}

#[cfg(test)]
mod tests {
    use super::{run, ModulePass};
    use crate::analysis::context::GlobalContext;
    use crate::config::Config;

    /// Changes the state a fixed number of times
    struct Countdown {
        inits: usize,
        left: usize,
        runs: usize,
        finals: usize,
    }

    impl ModulePass for Countdown {
        fn id(&self) -> &'static str {
            "Countdown"
        }

        fn initialize(&mut self, _ctx: &mut GlobalContext, _module: usize) -> bool {
            self.inits += 1;
            self.inits < 2
        }

        fn run_on_module(&mut self, _ctx: &mut GlobalContext, _module: usize) -> bool {
            self.runs += 1;
            if self.left > 0 {
                self.left -= 1;
                true
            } else {
                false
            }
        }

        fn finalize(&mut self, _ctx: &mut GlobalContext, _module: usize) {
            self.finals += 1;
        }
    }

    #[test]
    fn runs_to_fixed_point() {
        let mut ctx = GlobalContext::new(Vec::new(), Config::default()).unwrap();
        let mut pass = Countdown {
            inits: 0,
            left: 3,
            runs: 0,
            finals: 0,
        };
        // No modules: every phase is a no-op
        run(&mut pass, &mut ctx);
        assert_eq!(pass.inits, 0);
        assert_eq!(pass.runs, 0);
        assert_eq!(pass.finals, 0);
    }
}
