//! Run command - execute script files in one shared context

use std::fs;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;

use super::{report, report_stats, EngineArgs, Session};
use crate::OutputFormat;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script files, run in order in the same context
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Keep running the remaining files after a script fails
    #[arg(long)]
    pub keep_going: bool,

    #[command(flatten)]
    pub engine: EngineArgs,
}

pub fn run(args: RunArgs, format: OutputFormat, use_color: bool, quiet: bool) -> Result<()> {
    let config = args.engine.resolve()?;
    let session = Session::open(&config)?;
    let print_result = session.print_results() && !quiet;

    let mut failures = 0;
    for path in &args.files {
        let source = fs::read_to_string(path)
            .with_context(|| format!("read script {}", path.display()))?;
        let origin = path.display().to_string();
        log::info!("running {}", origin);

        let outcome = session.evaluate(&source, &origin)?;
        report(&outcome, format, use_color, print_result)?;
        if !outcome.is_success() {
            failures += 1;
            if !args.keep_going {
                break;
            }
        }
    }

    if args.engine.stats {
        report_stats(&session.heap_statistics()?, format)?;
    }
    session.close()?;

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
