use lentil::combine::{combine, CombinedRankOutput};
use lentil::consensus::{consensus, ConsensusArgs};
use lentil::error::CnmfError;
use lentil::factorize::{factorize, FactorizeArgs};
use lentil::input::NormalizeArgs;
use lentil::k_selection::k_selection;
use lentil::planner::{NmfConfig, RunPlan};
use lentil::prepare::{prepare, PrepareArgs};
use lentil::run_context::{ConsensusArtifact, RunContext};
use lentil::simulate::{simulate_factored_poisson, SimArgs};
use lentil::run_context::file_exists;
use matrix_util::common_io::read_lines;
use matrix_util::traits::IoOps;
use nalgebra::DMatrix;

fn prepared_run(
    dir: &tempfile::TempDir,
    ranks: Vec<usize>,
    n_replicates: usize,
) -> anyhow::Result<(RunContext, RunPlan)> {
    let ctx = RunContext::new(&dir.path().to_string_lossy(), "sim")?;
    let sim = simulate_factored_poisson(&SimArgs {
        cells: 50,
        genes: 30,
        factors: 3,
        depth: 3000,
        seed: 7,
        ..Default::default()
    })?;

    let args = PrepareArgs {
        normalize: NormalizeArgs::default(),
        ranks,
        n_replicates,
        seed: 14,
        nmf: NmfConfig {
            max_iter: 500,
            ..Default::default()
        },
    };
    let plan = prepare(&ctx, &sim.counts, &args)?;
    Ok((ctx, plan))
}

fn worker(index: usize, total: usize, skip_completed: bool) -> FactorizeArgs {
    FactorizeArgs {
        worker_index: index,
        total_workers: total,
        skip_completed,
    }
}

fn error_kind(result: anyhow::Result<impl Sized>) -> Option<CnmfError> {
    result
        .err()
        .and_then(|e| e.downcast_ref::<CnmfError>().cloned())
}

fn read_shape(file: &str) -> anyhow::Result<(usize, usize)> {
    Ok(DMatrix::<f32>::read_data_with_names(file, "\t")?.mat.shape())
}

#[test]
fn test_end_to_end() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (ctx, plan) = prepared_run(&dir, vec![3, 4], 2)?;
    assert_eq!(plan.units.len(), 4);

    for w in 0..2 {
        factorize(&ctx, &worker(w, 2, false))?;
    }
    assert_eq!(combine(&ctx, None)?, vec![3, 4]);

    let combined = CombinedRankOutput::load(&ctx, &plan, 4)?;
    assert_eq!(combined.spectra.nrows(), 8);
    assert_eq!(combined.errors.len(), 2);

    let records = k_selection(&ctx, &ConsensusArgs::default())?;
    assert_eq!(records.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![3, 4]);
    assert!(records.iter().all(|r| r.stability.is_finite()));
    assert_eq!(read_lines(&ctx.k_selection_file())?.len(), 3);

    let args = ConsensusArgs {
        density_threshold: 1.0,
        ..Default::default()
    };
    for k in [3, 4] {
        let sol = consensus(&ctx, k, &args, true)?;
        assert_eq!(sol.usage.shape(), (50, k));
        assert!(sol.usage.iter().all(|&x| x >= 0.0));
        assert_eq!(sol.spectra_tpm.shape(), (k, 30));
        assert_eq!(sol.spectra_score.shape(), (k, 30));
        assert_eq!(sol.n_discarded(), 0);

        let file = |a| ctx.consensus_file(a, k, 1.0);
        assert_eq!(read_shape(&file(ConsensusArtifact::Usages))?, (50, k));
        assert_eq!(read_shape(&file(ConsensusArtifact::Spectra))?, (k, plan.num_genes));
        assert_eq!(read_shape(&file(ConsensusArtifact::GeneSpectraTpm))?, (k, 30));
        assert_eq!(read_shape(&file(ConsensusArtifact::GeneSpectraScore))?, (k, 30));
        assert_eq!(read_lines(&file(ConsensusArtifact::Clustering))?.len(), 2 * k + 1);
    }
    Ok(())
}

#[test]
fn test_resume_after_partial_factorization() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (ctx, plan) = prepared_run(&dir, vec![3], 2)?;

    // only the first of two workers has run
    factorize(&ctx, &worker(0, 2, false))?;
    assert_eq!(
        error_kind(combine(&ctx, None)),
        Some(CnmfError::IncompleteRank {
            rank: 3,
            found: 1,
            expected: 2
        })
    );

    // a single worker picking up the rest
    assert_eq!(factorize(&ctx, &worker(0, 1, true))?, 1);
    combine(&ctx, None)?;
    assert_eq!(CombinedRankOutput::load(&ctx, &plan, 3)?.errors.len(), 2);
    Ok(())
}

#[test]
fn test_runs_are_reproducible() -> anyhow::Result<()> {
    let (dir_a, dir_b) = (tempfile::tempdir()?, tempfile::tempdir()?);
    let (ctx_a, plan_a) = prepared_run(&dir_a, vec![3], 2)?;
    let (ctx_b, plan_b) = prepared_run(&dir_b, vec![3], 2)?;
    assert_eq!(plan_a.plan_id()?, plan_b.plan_id()?);

    factorize(&ctx_a, &worker(0, 1, false))?;
    for w in 0..2 {
        factorize(&ctx_b, &worker(w, 2, false))?;
    }
    combine(&ctx_a, None)?;
    combine(&ctx_b, None)?;

    let a = CombinedRankOutput::load(&ctx_a, &plan_a, 3)?;
    let b = CombinedRankOutput::load(&ctx_b, &plan_b, 3)?;
    assert_eq!(a.spectra, b.spectra);
    assert_eq!(a.errors, b.errors);
    Ok(())
}

#[test]
fn test_scores_straight_from_replicates() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (ctx, _) = prepared_run(&dir, vec![3, 4], 2)?;
    factorize(&ctx, &worker(0, 1, false))?;

    let records = k_selection(&ctx, &ConsensusArgs::default())?;
    assert_eq!(records.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![3, 4]);
    assert!(records.iter().all(|r| r.mean_error.is_finite()));

    let args = ConsensusArgs {
        density_threshold: 1.0,
        ..Default::default()
    };
    let sol = consensus(&ctx, 3, &args, false)?;
    assert_eq!(sol.usage.shape(), (50, 3));
    assert_eq!(sol.clustering.labels.len(), 6);
    assert!(!file_exists(&ctx.merged_stats_file(3)));
    Ok(())
}

#[test]
fn test_incomplete_rank_is_left_out_of_k_selection() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (ctx, _) = prepared_run(&dir, vec![3, 4], 2)?;

    // units are (3,0) (3,1) (4,0) (4,1); leave (4,0) undone
    factorize(&ctx, &worker(0, 3, false))?;
    factorize(&ctx, &worker(1, 3, false))?;

    let records = k_selection(&ctx, &ConsensusArgs::default())?;
    assert_eq!(records.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![3]);
    assert_eq!(read_lines(&ctx.k_selection_file())?.len(), 2);

    assert_eq!(
        error_kind(consensus(&ctx, 4, &ConsensusArgs::default(), false)),
        Some(CnmfError::IncompleteRank {
            rank: 4,
            found: 1,
            expected: 2
        })
    );
    Ok(())
}

#[test]
fn test_new_plan_never_reads_old_factors() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (ctx, _) = prepared_run(&dir, vec![3], 2)?;
    factorize(&ctx, &worker(0, 1, false))?;
    combine(&ctx, None)?;

    // same run, more replicates
    let (ctx, plan) = prepared_run(&dir, vec![3], 4)?;
    assert_eq!(plan.n_replicates, 4);
    assert!(!file_exists(&ctx.merged_stats_file(3)));
    assert_eq!(
        error_kind(combine(&ctx, None)),
        Some(CnmfError::IncompleteRank {
            rank: 3,
            found: 0,
            expected: 4
        })
    );

    assert_eq!(factorize(&ctx, &worker(0, 1, true))?, 4);
    let args = ConsensusArgs {
        density_threshold: 1.0,
        ..Default::default()
    };
    let sol = consensus(&ctx, 3, &args, false)?;
    assert_eq!(sol.clustering.labels.len(), 12);

    combine(&ctx, None)?;
    assert_eq!(CombinedRankOutput::load(&ctx, &plan, 3)?.errors.len(), 4);
    Ok(())
}
