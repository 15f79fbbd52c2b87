use crate::cli_common::RunArgs;
use clap::Args;
use lentil::common::*;
use lentil::input::{ExpressionMatrix, NormalizeArgs};
use lentil::planner::{rank_range, BetaLoss, NmfConfig};
use lentil::prepare::{prepare, PrepareArgs as PrepareParams};
use matrix_util::common_io::read_names;

#[derive(Args, Debug)]
pub struct PrepareArgs {
    #[arg(
        help = "Count matrix",
        long_help = "Count matrix, cells x genes unless --genes-by-cells.\n\
		     Either MatrixMarket (.mtx, .mtx.gz) with --cells and --genes,\n\
		     or a tab-separated table (.tsv, .txt, optionally .gz)\n\
		     with gene names on the first line and a cell name\n\
		     leading every other line."
    )]
    counts: Box<str>,

    #[command(flatten)]
    run: RunArgs,

    #[arg(long, help = "Row names of the mtx file, one per line")]
    cells: Option<Box<str>>,

    #[arg(long, help = "Column names of the mtx file, one per line")]
    genes: Option<Box<str>>,

    #[arg(
        long,
        default_value_t = false,
        help = "Input is genes x cells (10x layout)"
    )]
    genes_by_cells: bool,

    #[arg(
        short = 'k',
        long = "components",
        value_delimiter = ',',
        num_args = 1..,
        help = "Candidate ranks, e.g., -k 5,6,7",
        long_help = "Candidate ranks K to factorize, e.g., -k 5,6,7 or -k 5 6 7.\n\
		     Every K must satisfy 1 < K < min(#cells, #genes)."
    )]
    components: Vec<usize>,

    #[arg(
        long,
        num_args = 2..=3,
        value_names = ["MIN", "MAX", "STEP"],
        help = "Candidate ranks MIN..=MAX by STEP (default 1)"
    )]
    k_range: Option<Vec<usize>>,

    #[arg(
        short = 'n',
        long = "n-iter",
        default_value_t = 100,
        help = "Number of NMF replicates per rank"
    )]
    n_replicates: usize,

    #[arg(long, default_value_t = 14, help = "Master random seed")]
    seed: u64,

    #[arg(
        long,
        default_value_t = 1000,
        help = "Maximum number of NMF iterations"
    )]
    max_iter: usize,

    #[arg(
        long,
        default_value_t = 1e-4,
        help = "Tolerance on the relative error improvement"
    )]
    tol: f32,

    #[arg(
        long,
        value_enum,
        default_value = "frobenius",
        help = "NMF objective"
    )]
    beta_loss: BetaLoss,

    #[arg(
        long,
        default_value_t = 2000,
        help = "Number of over-dispersed genes to factorize",
        long_help = "Number of over-dispersed genes to factorize.\n\
		     Genes are ranked by how far their Fano factor exceeds\n\
		     a mean-dependent baseline. Ignored with --genes-file."
    )]
    num_highvar_genes: usize,

    #[arg(long, help = "Factorize exactly these genes (one per line)")]
    genes_file: Option<Box<str>>,

    #[arg(
        long,
        default_value_t = false,
        help = "ln(1 + x) transform counts before variance scaling"
    )]
    log_transform: bool,
}

impl PrepareArgs {
    fn ranks(&self) -> anyhow::Result<Vec<usize>> {
        let mut ranks = self.components.clone();
        if let Some(range) = &self.k_range {
            let step = range.get(2).copied().unwrap_or(1);
            ranks.extend(rank_range(range[0], range[1], step));
        }
        if ranks.is_empty() {
            anyhow::bail!("give candidate ranks with -k or --k-range");
        }
        Ok(ranks)
    }
}

pub fn run_prepare(args: &PrepareArgs) -> anyhow::Result<()> {
    let ctx = args.run.context()?;

    let raw = ExpressionMatrix::from_file(
        &args.counts,
        args.cells.as_deref(),
        args.genes.as_deref(),
        args.genes_by_cells,
    )?;
    info!(
        "read {} cells x {} genes from {}",
        raw.num_cells(),
        raw.num_genes(),
        args.counts
    );

    let genes = args.genes_file.as_deref().map(read_names).transpose()?;
    let normalize = NormalizeArgs {
        num_highvar_genes: if genes.is_some() {
            None
        } else {
            Some(args.num_highvar_genes)
        },
        genes,
        log_transform: args.log_transform,
    };

    let params = PrepareParams {
        normalize,
        ranks: args.ranks()?,
        n_replicates: args.n_replicates,
        seed: args.seed,
        nmf: NmfConfig {
            max_iter: args.max_iter,
            tol: args.tol,
            beta_loss: args.beta_loss,
        },
    };

    prepare(&ctx, &raw, &params)?;
    info!("prepared run {} in {}", ctx.name(), ctx.run_dir().display());
    Ok(())
}
