use crate::cli_common::RunArgs;
use clap::Args;
use lentil::consensus::ConsensusArgs as ConsensusParams;
use lentil::k_selection::k_selection;

#[derive(Args, Debug)]
pub struct KSelectionArgs {
    #[command(flatten)]
    run: RunArgs,

    #[arg(
        long,
        default_value_t = 0.5,
        help = "Local density threshold for the filtered stability",
        long_help = "Local density threshold θ for the filtered stability.\n\
		     Stability is reported on all replicate spectra and on\n\
		     the densest θ fraction of each cluster."
    )]
    density_threshold: f32,

    #[arg(
        long,
        default_value_t = 0.3,
        help = "Neighbourhood size as a fraction of the number of replicates"
    )]
    local_neighborhood_size: f32,

    #[arg(long, default_value_t = 1, help = "Seed for the fallback k-means++ start")]
    seed: u64,
}

pub fn run_k_selection(args: &KSelectionArgs) -> anyhow::Result<()> {
    let ctx = args.run.context()?;
    let params = ConsensusParams {
        density_threshold: args.density_threshold,
        local_neighborhood_size: args.local_neighborhood_size,
        seed: args.seed,
        ..Default::default()
    };
    k_selection(&ctx, &params)?;
    Ok(())
}
