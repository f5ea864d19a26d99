// SPDX-License-Identifier: BSD-3-Clause
use std::io::{self, Write};

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use tracing::{error, info, level_filters::LevelFilter, Subscriber};
use tracing_flame::FlameLayer;
use tracing_subscriber::{fmt, prelude::*};

use sancheck::analysis::{self, context::GlobalContext, missing::Finding};
use sancheck::{Config, Module};

mod cli;
mod layers;

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

fn subscriber(
    args: &cli::Args,
) -> Result<(impl Subscriber + Send + Sync + 'static, Option<impl Drop>)> {
    let filter_layer = match args.verbose_level {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    // The level only applies to the log output; flamegraphs and timings see
    // their spans whatever the verbosity
    let fmt_layer = fmt::Layer::default()
        .with_writer(io::stderr)
        .with_filter(filter_layer);
    let (flame_layer, guard) = if args.tracing {
        let (layer, guard) = FlameLayer::with_file("./tracing.folded")
            .context("Couldn't create ./tracing.folded")?;
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };
    let timing_layer = args
        .timings
        .then(|| layers::TimingLayer.with_filter(LevelFilter::INFO));
    let subscriber = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(flame_layer)
        .with(timing_layer);
    Ok((subscriber, guard))
}

fn setup_global_subscriber(args: &cli::Args) -> Result<Option<impl Drop>> {
    let (subscriber, guard) = subscriber(args)?;
    subscriber.init();
    Ok(guard)
}

fn print_findings(out: &mut impl Write, title: &str, findings: &[Finding]) -> io::Result<()> {
    writeln!(out, "{}", title)?;
    writeln!(out, "{}", "-".repeat(title.len()))?;
    for f in findings {
        writeln!(
            out,
            "{} {}: checked {}, unchecked {}, total {} ({:.2})",
            f.function, f.arg, f.checked, f.unchecked, f.total, f.ratio
        )?;
        for c in &f.checks {
            writeln!(out, "  check: {}", c)?;
        }
        for s in &f.unchecked_sites {
            writeln!(out, "  unchecked: {}", s)?;
        }
    }
    writeln!(out)
}

fn main() -> Result<()> {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    let args = cli::Args::parse();
    let _guard = setup_global_subscriber(&args)?;

    let mut config = match &args.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("Couldn't load configuration {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(path) = &args.err_funcs {
        let added = config
            .add_error_functions(path)
            .with_context(|| format!("Couldn't read error functions {}", path.display()))?;
        info!("{} error-handling functions from {}", added, path.display());
    }

    let mut modules = Vec::with_capacity(args.modules.len());
    for path in &args.modules {
        match Module::from_path(path) {
            Ok(m) => modules.push(m),
            Err(e) => error!("Skipping {}: {}", path.display(), e),
        }
    }
    if modules.is_empty() {
        return Err(anyhow!("No module could be loaded"));
    }
    info!("Loaded {} of {} modules", modules.len(), args.modules.len());

    let mut ctx = GlobalContext::new(modules, config).context("Invalid function tables")?;
    let mut stdout = io::stdout().lock();

    if args.sc {
        analysis::identify_sanity_checks(&mut ctx);
        if !args.quiet {
            writeln!(stdout, "security checks: {}", ctx.counters.security_checks)?;
            writeln!(
                stdout,
                "conditional statements: {}",
                ctx.counters.conditional_statements
            )?;
        }
    }

    if args.mc || !args.sc {
        let report = analysis::identify_missing_checks(&mut ctx);
        if args.json {
            serde_json::to_writer_pretty(&mut stdout, &report)
                .context("Couldn't serialize the report")?;
            writeln!(stdout)?;
        } else if !args.quiet {
            print_findings(&mut stdout, "sources", &report.sources)?;
            print_findings(&mut stdout, "uses", &report.uses)?;
            let c = &report.counters;
            writeln!(stdout, "counters")?;
            writeln!(stdout, "--------")?;
            writeln!(stdout, "security checks: {}", c.security_checks)?;
            writeln!(stdout, "conditional statements: {}", c.conditional_statements)?;
            writeln!(stdout, "indirect calls: {}", c.indirect_calls)?;
            writeln!(stdout, "indirect call edges: {}", c.indirect_call_edges)?;
            writeln!(stdout, "skipped functions: {}", c.skipped_functions)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tracing::Level;

    use super::{cli::Args, subscriber};

    #[test]
    fn pass_spans_reach_the_timings() {
        let args = Args::parse_from(["sancheck", "--timings", "a.ll"]);
        let (sub, _guard) = subscriber(&args).unwrap();
        assert!(tracing::subscriber::with_default(sub, || {
            tracing::span_enabled!(Level::INFO)
        }));
    }
}
