use clap::Args;
use lentil::common::*;
use lentil::simulate::{simulate_factored_poisson, SimArgs};

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(
        long,
        short = 'o',
        required = true,
        help = "Output file prefix",
        long_help = "Output file prefix.\n\n\
		     Generates:\n\
		     - {out}.counts.mtx.gz: cells x genes counts\n\
		     - {out}.cells.gz, {out}.genes.gz: names\n\
		     - {out}.usage.tsv.gz: true usage (cells x K)\n\
		     - {out}.spectra.tsv.gz: true spectra (K x genes)"
    )]
    out: Box<str>,

    #[arg(long, default_value_t = 500, help = "Number of cells")]
    cells: usize,

    #[arg(long, default_value_t = 200, help = "Number of genes")]
    genes: usize,

    #[arg(long, short = 'k', default_value_t = 5, help = "Number of programs")]
    factors: usize,

    #[arg(long, default_value_t = 2000, help = "Expected counts per cell")]
    depth: usize,

    #[arg(long, default_value_t = 1.0, help = "Overdispersion of the spectra")]
    overdisp: f32,

    #[arg(
        long,
        default_value_t = 0.9,
        help = "Weight of each cell's own program"
    )]
    pve_topic: f32,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,
}

pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    let sim = simulate_factored_poisson(&SimArgs {
        cells: args.cells,
        genes: args.genes,
        factors: args.factors,
        depth: args.depth,
        overdisp: args.overdisp,
        pve_topic: args.pve_topic,
        seed: args.seed,
    })?;

    let out = &args.out;
    let mtx_file = format!("{}.counts.mtx.gz", out);
    sim.counts.to_mtx(
        &mtx_file,
        &format!("{}.cells.gz", out),
        &format!("{}.genes.gz", out),
    )?;

    let factors = factor_labels(args.factors);
    sim.usage
        .to_tsv_with_names(&format!("{}.usage.tsv.gz", out), &sim.counts.cells, &factors)?;
    sim.spectra
        .to_tsv_with_names(&format!("{}.spectra.tsv.gz", out), &factors, &sim.counts.genes)?;

    info!("wrote {} with its names and the true factors", mtx_file);
    Ok(())
}
