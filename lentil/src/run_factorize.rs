use crate::cli_common::RunArgs;
use clap::Args;
use lentil::common::*;
use lentil::factorize::{factorize, FactorizeArgs as FactorizeParams};

#[derive(Args, Debug)]
pub struct FactorizeArgs {
    #[command(flatten)]
    run: RunArgs,

    #[arg(
        long,
        default_value_t = 0,
        help = "Index of this worker (0-based)",
        long_help = "Index of this worker (0-based).\n\
		     Worker i runs the planned factorizations whose index\n\
		     modulo --total-workers equals i, so independent jobs\n\
		     can share one run directory."
    )]
    worker_index: usize,

    #[arg(long, default_value_t = 1, help = "Number of workers")]
    total_workers: usize,

    #[arg(
        long,
        default_value_t = false,
        help = "Skip replicates that are already saved"
    )]
    skip_completed: bool,
}

pub fn run_factorize(args: &FactorizeArgs) -> anyhow::Result<()> {
    let ctx = args.run.context()?;
    let params = FactorizeParams {
        worker_index: args.worker_index,
        total_workers: args.total_workers,
        skip_completed: args.skip_completed,
    };
    let done = factorize(&ctx, &params)?;
    info!("worker {} finished {} factorizations", args.worker_index, done);
    Ok(())
}
