//! Eval command - evaluate inline source

use anyhow::Result;
use clap::Args;

use super::{report, report_stats, EngineArgs, Session};
use crate::OutputFormat;

#[derive(Args, Debug)]
pub struct EvalArgs {
    /// JavaScript source to evaluate
    pub source: String,

    /// Name shown in error locations and stack traces
    #[arg(long, default_value = "<eval>")]
    pub origin: String,

    #[command(flatten)]
    pub engine: EngineArgs,
}

pub fn run(args: EvalArgs, format: OutputFormat, use_color: bool, quiet: bool) -> Result<()> {
    let config = args.engine.resolve()?;
    let session = Session::open(&config)?;

    let outcome = session.evaluate(&args.source, &args.origin)?;
    report(&outcome, format, use_color, session.print_results() && !quiet)?;

    if args.engine.stats {
        report_stats(&session.heap_statistics()?, format)?;
    }
    session.close()?;

    if !outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
