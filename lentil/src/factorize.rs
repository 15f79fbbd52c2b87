//! The `factorize` stage: run this worker's share of the plan
//!
//! Each replicate leaves three files behind: spectra, usage and a small
//! JSON record. The record is written last and names the plan the
//! replicate belongs to, so a replicate counts as complete exactly when
//! a record of the current plan exists.

use crate::common::*;
use crate::input::NormalizedMatrix;
use crate::nmf;
use crate::planner::{NmfConfig, RunPlan, WorkUnit};
use crate::prepare::{load_normalized, load_plan};
use indicatif::ParallelProgressIterator;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Result of one NMF replicate
#[derive(Clone, Debug)]
pub struct FactorSolution {
    pub rank: usize,
    pub replicate: usize,
    pub seed: u64,
    /// cells x K
    pub usage: Mat,
    /// K x genes
    pub spectra: Mat,
    pub error: f32,
    pub n_iter: usize,
    pub converged: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SolutionRecord {
    pub rank: usize,
    pub replicate: usize,
    pub seed: u64,
    pub plan_id: u64,
    pub error: f32,
    pub n_iter: usize,
    pub converged: bool,
}

impl FactorSolution {
    pub fn record(&self, plan_id: u64) -> SolutionRecord {
        SolutionRecord {
            rank: self.rank,
            replicate: self.replicate,
            seed: self.seed,
            plan_id,
            error: self.error,
            n_iter: self.n_iter,
            converged: self.converged,
        }
    }

    pub fn read_record(
        ctx: &RunContext,
        rank: usize,
        replicate: usize,
    ) -> anyhow::Result<SolutionRecord> {
        let stats_file = ctx.replicate_stats_file(rank, replicate);
        let text = std::fs::read_to_string(&*stats_file)
            .map_err(|e| anyhow::anyhow!("replicate {} of K={} is not done: {}", replicate, rank, e))?;
        let record: SolutionRecord = serde_json::from_str(&text)?;
        if record.rank != rank || record.replicate != replicate {
            anyhow::bail!("{} describes a different replicate", stats_file);
        }
        Ok(record)
    }

    /// Saved under the plan `plan_id` with the unit's seed
    pub fn is_complete(ctx: &RunContext, plan_id: u64, unit: &WorkUnit) -> bool {
        matches!(
            Self::read_record(ctx, unit.rank, unit.replicate),
            Ok(r) if r.plan_id == plan_id && r.seed == unit.seed
        )
    }

    pub fn save(
        &self,
        ctx: &RunContext,
        plan_id: u64,
        cells: &[Box<str>],
        genes: &[Box<str>],
    ) -> anyhow::Result<()> {
        let factors = factor_labels(self.rank);
        self.spectra.to_tsv_with_names(
            &ctx.replicate_spectra_file(self.rank, self.replicate),
            &factors,
            genes,
        )?;
        self.usage.to_tsv_with_names(
            &ctx.replicate_usage_file(self.rank, self.replicate),
            cells,
            &factors,
        )?;
        let json = serde_json::to_string_pretty(&self.record(plan_id))?;
        matrix_util::common_io::write_lines_atomic(
            &[json],
            &ctx.replicate_stats_file(self.rank, self.replicate),
        )
    }

    /// Read back a completed replicate of the plan `plan_id`; fails if
    /// its record is missing or belongs to another plan
    pub fn load(
        ctx: &RunContext,
        plan_id: u64,
        rank: usize,
        replicate: usize,
    ) -> anyhow::Result<Self> {
        let record = Self::read_record(ctx, rank, replicate)?;
        if record.plan_id != plan_id {
            return Err(CnmfError::StaleArtifact {
                file: ctx.replicate_stats_file(rank, replicate).into(),
            }
            .into());
        }

        let spectra = Mat::read_data_with_names(&ctx.replicate_spectra_file(rank, replicate), "\t")?.mat;
        let usage = Mat::read_data_with_names(&ctx.replicate_usage_file(rank, replicate), "\t")?.mat;
        if spectra.nrows() != rank || usage.ncols() != rank {
            anyhow::bail!("replicate {} of K={} has inconsistent factors", replicate, rank);
        }

        Ok(Self {
            rank,
            replicate,
            seed: record.seed,
            usage,
            spectra,
            error: record.error,
            n_iter: record.n_iter,
            converged: record.converged,
        })
    }
}

/// Factorize one unit; depends only on the unit and the data
pub fn run_work_unit(
    xx: &Mat,
    unit: &WorkUnit,
    config: &NmfConfig,
) -> anyhow::Result<FactorSolution> {
    let fit = nmf::fit(xx, unit.rank, unit.seed, config)?;
    if !fit.converged {
        warn!(
            "K={} replicate {} stopped at {} iterations without converging",
            unit.rank, unit.replicate, fit.n_iter
        );
    }
    Ok(FactorSolution {
        rank: unit.rank,
        replicate: unit.replicate,
        seed: unit.seed,
        usage: fit.usage,
        spectra: fit.spectra,
        error: fit.error,
        n_iter: fit.n_iter,
        converged: fit.converged,
    })
}

#[derive(Clone, Debug)]
pub struct FactorizeArgs {
    pub worker_index: usize,
    pub total_workers: usize,
    pub skip_completed: bool,
}

impl Default for FactorizeArgs {
    fn default() -> Self {
        Self {
            worker_index: 0,
            total_workers: 1,
            skip_completed: false,
        }
    }
}

/// Run and save this worker's units. Returns how many were run.
pub fn factorize_units(
    ctx: &RunContext,
    plan: &RunPlan,
    norm: &NormalizedMatrix,
    args: &FactorizeArgs,
) -> anyhow::Result<usize> {
    let plan_id = plan.plan_id()?;
    let mut units = plan.partition(args.worker_index, args.total_workers)?;
    let assigned = units.len();
    if args.skip_completed {
        units.retain(|u| !FactorSolution::is_complete(ctx, plan_id, u));
    }
    info!(
        "worker {} of {}: {} units assigned, {} to run",
        args.worker_index,
        args.total_workers,
        assigned,
        units.len()
    );

    let njobs = units.len() as u64;
    units
        .par_iter()
        .progress_count(njobs)
        .map(|unit| -> anyhow::Result<()> {
            let sol = run_work_unit(&norm.data, unit, &plan.nmf)?;
            sol.save(ctx, plan_id, &norm.cells, &norm.genes)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(units.len())
}

pub fn factorize(ctx: &RunContext, args: &FactorizeArgs) -> anyhow::Result<usize> {
    let plan = load_plan(ctx)?;
    let norm = load_normalized(ctx)?;
    if norm.data.shape() != (plan.num_cells, plan.num_genes) {
        return Err(CnmfError::FormatMismatch(format!(
            "normalized data is {} x {}, but the plan expects {} x {}",
            norm.data.nrows(),
            norm.data.ncols(),
            plan.num_cells,
            plan.num_genes
        ))
        .into());
    }
    factorize_units(ctx, &plan, &norm, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::NmfConfig;

    fn toy() -> NormalizedMatrix {
        let data = Mat::from_fn(12, 6, |i, j| (((i * 7 + j * 3) % 5) + 1) as f32 * 0.5);
        NormalizedMatrix {
            data,
            cells: (0..12).map(|i| format!("c{}", i).into_boxed_str()).collect(),
            genes: (0..6).map(|j| format!("g{}", j).into_boxed_str()).collect(),
        }
    }

    #[test]
    fn test_save_and_load_solution() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = RunContext::new(&dir.path().to_string_lossy(), "toy")?;
        let norm = toy();
        let plan = RunPlan::new(&[2, 3], 2, 9, NmfConfig::default(), 12, 6)?;

        let done = factorize_units(&ctx, &plan, &norm, &FactorizeArgs::default())?;
        assert_eq!(done, 4);

        let plan_id = plan.plan_id()?;
        for unit in &plan.units {
            assert!(FactorSolution::is_complete(&ctx, plan_id, unit));
            let sol = FactorSolution::load(&ctx, plan_id, unit.rank, unit.replicate)?;
            let again = run_work_unit(&norm.data, unit, &plan.nmf)?;
            assert_eq!(sol.seed, unit.seed);
            assert_eq!(sol.spectra, again.spectra);
            assert_eq!(sol.usage, again.usage);
            assert_eq!(sol.error, again.error);
        }

        let rerun = FactorizeArgs {
            skip_completed: true,
            ..Default::default()
        };
        assert_eq!(factorize_units(&ctx, &plan, &norm, &rerun)?, 0);
        Ok(())
    }

    #[test]
    fn test_workers_split_the_plan() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = RunContext::new(&dir.path().to_string_lossy(), "toy")?;
        let norm = toy();
        let plan = RunPlan::new(&[2, 3, 4], 1, 9, NmfConfig::default(), 12, 6)?;

        let first = FactorizeArgs {
            worker_index: 0,
            total_workers: 2,
            skip_completed: false,
        };
        assert_eq!(factorize_units(&ctx, &plan, &norm, &first)?, 2);
        let plan_id = plan.plan_id()?;
        assert!(FactorSolution::is_complete(&ctx, plan_id, &plan.units[0]));
        assert!(!FactorSolution::is_complete(&ctx, plan_id, &plan.units[1]));
        assert!(FactorSolution::load(&ctx, plan_id, 3, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_replicates_of_another_plan_are_not_complete() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = RunContext::new(&dir.path().to_string_lossy(), "toy")?;
        let norm = toy();
        let old = RunPlan::new(&[2, 3], 2, 9, NmfConfig::default(), 12, 6)?;
        factorize_units(&ctx, &old, &norm, &FactorizeArgs::default())?;

        let mut new = old.clone();
        new.data_id = 1;
        let new_id = new.plan_id()?;
        assert!(new.units.iter().all(|u| !FactorSolution::is_complete(&ctx, new_id, u)));
        assert_eq!(
            FactorSolution::load(&ctx, new_id, 2, 0)
                .err()
                .as_ref()
                .and_then(|e| e.downcast_ref::<CnmfError>()),
            Some(&CnmfError::StaleArtifact {
                file: ctx.replicate_stats_file(2, 0).into()
            })
        );

        let resume = FactorizeArgs {
            skip_completed: true,
            ..Default::default()
        };
        assert_eq!(factorize_units(&ctx, &new, &norm, &resume)?, 4);
        assert_eq!(factorize_units(&ctx, &new, &norm, &resume)?, 0);
        FactorSolution::load(&ctx, new_id, 2, 0)?;
        Ok(())
    }
}
