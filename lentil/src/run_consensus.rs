use crate::cli_common::RunArgs;
use clap::Args;
use lentil::consensus::{consensus, ConsensusArgs as ConsensusParams};

#[derive(Args, Debug)]
pub struct ConsensusArgs {
    #[command(flatten)]
    run: RunArgs,

    #[arg(
        short = 'k',
        long = "components",
        required = true,
        help = "Rank of the consensus factorization"
    )]
    rank: usize,

    #[arg(
        long,
        default_value_t = 0.5,
        help = "Fraction of each cluster kept, densest first",
        long_help = "Local density threshold θ in (0, 1].\n\
		     Within each cluster of replicate spectra, only the θ\n\
		     fraction with the densest neighbourhoods is kept.\n\
		     Lower values discard more outliers; too low a value\n\
		     empties clusters and fails."
    )]
    local_density_threshold: f32,

    #[arg(
        long,
        default_value_t = 0.3,
        help = "Neighbourhood size as a fraction of the number of replicates"
    )]
    local_neighborhood_size: f32,

    #[arg(long, default_value_t = 1, help = "Seed for the fallback k-means++ start")]
    seed: u64,

    #[arg(
        long,
        default_value_t = false,
        help = "Write cluster membership and local density of every replicate spectrum"
    )]
    show_clustering: bool,
}

pub fn run_consensus(args: &ConsensusArgs) -> anyhow::Result<()> {
    if !(args.local_density_threshold > 0.0 && args.local_density_threshold <= 1.0) {
        anyhow::bail!(
            "local density threshold must be in (0, 1], got {}",
            args.local_density_threshold
        );
    }
    let ctx = args.run.context()?;
    let params = ConsensusParams {
        density_threshold: args.local_density_threshold,
        local_neighborhood_size: args.local_neighborhood_size,
        seed: args.seed,
        ..Default::default()
    };
    consensus(&ctx, args.rank, &params, args.show_clustering)?;
    Ok(())
}
