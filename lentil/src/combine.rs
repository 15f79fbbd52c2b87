//! The `combine` stage: stack every replicate of a rank into one
//! spectra matrix (R·K x genes), one usage matrix (cells x R·K) and
//! the list of replicate errors

use crate::common::*;
use crate::factorize::FactorSolution;
use crate::planner::RunPlan;
use crate::prepare::{load_normalized, load_plan};
use crate::run_context::file_exists;
use matrix_util::common_io::{read_word_table, write_lines_atomic};
use matrix_util::dmatrix_util::{concatenate_columns, concatenate_rows};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct CombinedRankOutput {
    pub rank: usize,
    pub n_replicates: usize,
    /// R·K x genes, replicate-major
    pub spectra: Mat,
    /// cells x R·K, same column order as the spectra rows
    pub usages: Mat,
    /// `iter<r>_topic<k>`, 1-based topic
    pub labels: Vec<Box<str>>,
    /// reconstruction error of each replicate, in replicate order
    pub errors: Vec<f32>,
    /// the plan the replicates were factorized under
    pub plan_id: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MergedRecord {
    pub rank: usize,
    pub n_replicates: usize,
    pub plan_id: u64,
}

pub fn replicate_labels(rank: usize, n_replicates: usize) -> Vec<Box<str>> {
    (0..n_replicates)
        .flat_map(|r| (1..=rank).map(move |k| format!("iter{}_topic{}", r, k).into_boxed_str()))
        .collect()
}

/// Stack the solutions of one rank in replicate order. Every
/// replicate `0..n_replicates` must be present exactly once.
pub fn combine_solutions(
    rank: usize,
    n_replicates: usize,
    plan_id: u64,
    mut solutions: Vec<FactorSolution>,
) -> anyhow::Result<CombinedRankOutput> {
    solutions.retain(|s| s.rank == rank && s.replicate < n_replicates);
    solutions.sort_by_key(|s| s.replicate);
    solutions.dedup_by_key(|s| s.replicate);

    if solutions.len() != n_replicates {
        return Err(CnmfError::IncompleteRank {
            rank,
            found: solutions.len(),
            expected: n_replicates,
        }
        .into());
    }

    let spectra: Vec<Mat> = solutions.iter().map(|s| s.spectra.clone()).collect();
    let usages: Vec<Mat> = solutions.iter().map(|s| s.usage.clone()).collect();

    Ok(CombinedRankOutput {
        rank,
        n_replicates,
        spectra: concatenate_rows(&spectra)?,
        usages: concatenate_columns(&usages)?,
        labels: replicate_labels(rank, n_replicates),
        errors: solutions.iter().map(|s| s.error).collect(),
        plan_id,
    })
}

/// Load and stack the saved replicates of one rank
pub fn combine_rank(ctx: &RunContext, plan: &RunPlan, rank: usize) -> anyhow::Result<CombinedRankOutput> {
    let plan_id = plan.plan_id()?;
    let solutions = plan
        .units_of_rank(rank)
        .filter(|u| FactorSolution::is_complete(ctx, plan_id, u))
        .map(|u| FactorSolution::load(ctx, plan_id, u.rank, u.replicate))
        .collect::<anyhow::Result<Vec<_>>>()?;

    for s in solutions.iter().filter(|s| !s.converged) {
        warn!("K={} replicate {} did not converge", s.rank, s.replicate);
    }
    combine_solutions(rank, plan.n_replicates, plan_id, solutions)
}

impl CombinedRankOutput {
    pub fn save(
        &self,
        ctx: &RunContext,
        cells: &[Box<str>],
        genes: &[Box<str>],
    ) -> anyhow::Result<()> {
        self.spectra
            .to_tsv_with_names(&ctx.merged_spectra_file(self.rank), &self.labels, genes)?;
        self.usages
            .to_tsv_with_names(&ctx.merged_usage_file(self.rank), cells, &self.labels)?;

        let lines: Vec<String> = std::iter::once("replicate\terror".to_string())
            .chain(
                self.errors
                    .iter()
                    .enumerate()
                    .map(|(r, e)| format!("{}\t{}", r, e)),
            )
            .collect();
        write_lines_atomic(&lines, &ctx.merged_errors_file(self.rank))?;

        let record = MergedRecord {
            rank: self.rank,
            n_replicates: self.n_replicates,
            plan_id: self.plan_id,
        };
        write_lines_atomic(
            &[serde_json::to_string_pretty(&record)?],
            &ctx.merged_stats_file(self.rank),
        )
    }

    /// Read back the merge of `rank`. Fails with `StaleArtifact` if it
    /// was made under a different plan.
    pub fn load(ctx: &RunContext, plan: &RunPlan, rank: usize) -> anyhow::Result<Self> {
        let stats_file = ctx.merged_stats_file(rank);
        let text = std::fs::read_to_string(&*stats_file)
            .map_err(|e| anyhow::anyhow!("K={} is not combined: {}", rank, e))?;
        let record: MergedRecord = serde_json::from_str(&text)?;
        let plan_id = plan.plan_id()?;
        if record.rank != rank
            || record.plan_id != plan_id
            || record.n_replicates != plan.n_replicates
        {
            return Err(CnmfError::StaleArtifact {
                file: stats_file.into(),
            }
            .into());
        }

        let MatWithNames {
            rows: labels,
            mat: spectra,
            ..
        } = Mat::read_data_with_names(&ctx.merged_spectra_file(rank), "\t")?;
        let usages = Mat::read_data_with_names(&ctx.merged_usage_file(rank), "\t")?.mat;

        let errors = read_word_table(&ctx.merged_errors_file(rank), "\t", Some(0), None)?
            .lines
            .iter()
            .map(|words| -> anyhow::Result<f32> {
                match words.get(1) {
                    Some(e) => Ok(e.parse::<f32>()?),
                    None => anyhow::bail!("malformed {}", ctx.merged_errors_file(rank)),
                }
            })
            .collect::<anyhow::Result<Vec<f32>>>()?;

        let n_replicates = record.n_replicates;
        if errors.len() != n_replicates
            || spectra.nrows() != rank * n_replicates
            || usages.ncols() != spectra.nrows()
        {
            return Err(CnmfError::FormatMismatch(format!(
                "merged factors of K={} don't match {} replicates",
                rank, n_replicates
            ))
            .into());
        }

        Ok(Self {
            rank,
            n_replicates,
            spectra,
            usages,
            labels,
            errors,
            plan_id,
        })
    }

    pub fn mean_error(&self) -> f32 {
        if self.errors.is_empty() {
            return f32::NAN;
        }
        self.errors.iter().sum::<f32>() / self.errors.len() as f32
    }
}

/// The saved merge of a rank, or a fresh one from its replicates if
/// there is none or it belongs to an earlier plan
pub fn load_or_combine(
    ctx: &RunContext,
    plan: &RunPlan,
    rank: usize,
) -> anyhow::Result<CombinedRankOutput> {
    if file_exists(&ctx.merged_stats_file(rank)) {
        match CombinedRankOutput::load(ctx, plan, rank) {
            Ok(combined) => return Ok(combined),
            Err(e)
                if matches!(
                    e.downcast_ref::<CnmfError>(),
                    Some(CnmfError::StaleArtifact { .. })
                ) =>
            {
                warn!("{}; rebuilding K={} from its replicates", e, rank);
            }
            Err(e) => return Err(e),
        }
    }
    combine_rank(ctx, plan, rank)
}

/// Combine every rank of the plan (or the given subset). A rank that
/// is not yet complete fails the whole call.
pub fn combine(ctx: &RunContext, ranks: Option<&[usize]>) -> anyhow::Result<Vec<usize>> {
    let plan = load_plan(ctx)?;
    let norm = load_normalized(ctx)?;
    let ranks: Vec<usize> = ranks.map(|r| r.to_vec()).unwrap_or_else(|| plan.ranks.clone());

    for &rank in &ranks {
        if !plan.ranks.contains(&rank) {
            anyhow::bail!("K={} is not part of the plan {:?}", rank, plan.ranks);
        }
        let combined = combine_rank(ctx, &plan, rank)?;
        combined.save(ctx, &norm.cells, &norm.genes)?;
        info!(
            "combined {} replicates of K={}, mean error {:.4}",
            combined.n_replicates,
            rank,
            combined.mean_error()
        );
    }
    Ok(ranks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solution(rank: usize, replicate: usize) -> FactorSolution {
        FactorSolution {
            rank,
            replicate,
            seed: replicate as u64,
            usage: Mat::from_element(4, rank, replicate as f32),
            spectra: Mat::from_element(rank, 6, replicate as f32),
            error: 10.0 + replicate as f32,
            n_iter: 10,
            converged: true,
        }
    }

    #[test]
    fn test_combine_in_replicate_order() -> anyhow::Result<()> {
        let sols = vec![solution(5, 2), solution(5, 0), solution(5, 1)];
        let out = combine_solutions(5, 3, 0, sols)?;
        assert_eq!(out.spectra.shape(), (15, 6));
        assert_eq!(out.usages.shape(), (4, 15));
        assert_eq!(out.errors, vec![10.0, 11.0, 12.0]);
        assert_eq!(out.spectra[(5, 0)], 1.0);
        assert_eq!(out.usages[(0, 14)], 2.0);
        assert_eq!(out.labels[5].as_ref(), "iter1_topic1");
        Ok(())
    }

    #[test]
    fn test_missing_replicate() {
        let err = combine_solutions(5, 3, 0, vec![solution(5, 0), solution(5, 2)]).err();
        assert_eq!(
            err.as_ref().and_then(|e| e.downcast_ref::<CnmfError>()),
            Some(&CnmfError::IncompleteRank {
                rank: 5,
                found: 2,
                expected: 3
            })
        );
    }

    fn saved_merge(ctx: &RunContext, plan: &RunPlan) -> anyhow::Result<CombinedRankOutput> {
        let out = combine_solutions(2, 2, plan.plan_id()?, vec![solution(2, 0), solution(2, 1)])?;
        let cells: Vec<Box<str>> = (0..4).map(|i| i.to_string().into_boxed_str()).collect();
        let genes: Vec<Box<str>> = (0..6).map(|i| format!("g{}", i).into_boxed_str()).collect();
        out.save(ctx, &cells, &genes)?;
        Ok(out)
    }

    #[test]
    fn test_save_and_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = RunContext::new(&dir.path().to_string_lossy(), "toy")?;
        let plan = RunPlan::new(&[2], 2, 1, Default::default(), 4, 6)?;
        let out = saved_merge(&ctx, &plan)?;

        let back = CombinedRankOutput::load(&ctx, &plan, 2)?;
        assert_eq!(back.spectra, out.spectra);
        assert_eq!(back.usages, out.usages);
        assert_eq!(back.errors, out.errors);
        assert_eq!(back.labels, out.labels);
        assert_eq!(load_or_combine(&ctx, &plan, 2)?.errors, out.errors);
        Ok(())
    }

    #[test]
    fn test_merge_of_another_plan_is_rebuilt() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = RunContext::new(&dir.path().to_string_lossy(), "toy")?;
        saved_merge(&ctx, &RunPlan::new(&[2], 2, 1, Default::default(), 4, 6)?)?;

        let more = RunPlan::new(&[2], 3, 1, Default::default(), 4, 6)?;
        let err = CombinedRankOutput::load(&ctx, &more, 2).err();
        assert_eq!(
            err.as_ref().and_then(|e| e.downcast_ref::<CnmfError>()),
            Some(&CnmfError::StaleArtifact {
                file: ctx.merged_stats_file(2).into()
            })
        );

        // nothing of the new plan has been factorized yet
        let err = load_or_combine(&ctx, &more, 2).err();
        assert_eq!(
            err.as_ref().and_then(|e| e.downcast_ref::<CnmfError>()),
            Some(&CnmfError::IncompleteRank {
                rank: 2,
                found: 0,
                expected: 3
            })
        );
        Ok(())
    }
}
