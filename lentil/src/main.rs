mod cli_common;
mod run_combine;
mod run_consensus;
mod run_factorize;
mod run_k_selection;
mod run_prepare;
mod run_simulate;

use run_combine::*;
use run_consensus::*;
use run_factorize::*;
use run_k_selection::*;
use run_prepare::*;
use run_simulate::*;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lentil")]
#[command(about = "Consensus non-negative matrix factorization of single-cell expression data")]
struct Cli {
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize counts, select genes and plan the factorizations
    Prepare(PrepareArgs),
    /// Run this worker's share of the planned factorizations
    Factorize(FactorizeArgs),
    /// Merge the replicates of each rank
    Combine(CombineArgs),
    /// Tabulate stability and error across ranks to pick K
    #[command(alias = "k_selection_plot")]
    KSelectionPlot(KSelectionArgs),
    /// Build the consensus factorization of one rank
    Consensus(ConsensusArgs),
    /// Simulate counts from a factored Poisson model
    Simulate(SimulateArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Prepare(args) => {
            run_prepare(args)?;
        }
        Commands::Factorize(args) => {
            run_factorize(args)?;
        }
        Commands::Combine(args) => {
            run_combine(args)?;
        }
        Commands::KSelectionPlot(args) => {
            run_k_selection(args)?;
        }
        Commands::Consensus(args) => {
            run_consensus(args)?;
        }
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
    }

    Ok(())
}
