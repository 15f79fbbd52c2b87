//! The `prepare` stage: normalize the input once, then persist the
//! normalized counts, TPM, per-gene TPM statistics, the selected
//! genes and the run plan for the later stages

use crate::common::*;
use crate::input::*;
use crate::planner::{NmfConfig, RunPlan};
use matrix_util::common_io::write_lines_atomic;
use matrix_util::sparse_util::select_columns_dense;

pub struct PrepareArgs {
    pub normalize: NormalizeArgs,
    pub ranks: Vec<usize>,
    pub n_replicates: usize,
    pub seed: u64,
    pub nmf: NmfConfig,
}

pub fn prepare(
    ctx: &RunContext,
    raw: &ExpressionMatrix,
    args: &PrepareArgs,
) -> anyhow::Result<RunPlan> {
    info!(
        "preparing {} cells x {} genes",
        raw.num_cells(),
        raw.num_genes()
    );

    let PreparedInput {
        norm,
        tpm,
        tpm_mean,
        tpm_std,
    } = prepare_input(raw, &args.normalize)?;

    let mut plan = RunPlan::new(
        &args.ranks,
        args.n_replicates,
        args.seed,
        args.nmf.clone(),
        norm.data.nrows(),
        norm.data.ncols(),
    )?;
    plan.data_id = norm.fingerprint();

    // factors of an earlier plan of this run can't be reused
    let previous_id = load_plan(ctx).and_then(|p| p.plan_id()).ok();
    if previous_id != Some(plan.plan_id()?) {
        let removed = ctx.remove_factor_artifacts()?;
        if removed > 0 {
            info!("removed {} factor files of the previous plan", removed);
        }
    }

    ctx.create_dirs()?;

    ExpressionMatrix::from_triplets(
        &norm.data.to_nonzero_triplets(),
        norm.cells.clone(),
        norm.genes.clone(),
    )?
    .to_mtx(
        &ctx.norm_counts_file(),
        &ctx.norm_counts_rows_file(),
        &ctx.norm_counts_cols_file(),
    )?;

    tpm.to_mtx(&ctx.tpm_file(), &ctx.tpm_rows_file(), &ctx.tpm_cols_file())?;

    let stats = Mat::from_fn(tpm_mean.len(), 2, |j, c| {
        if c == 0 {
            tpm_mean[j]
        } else {
            tpm_std[j]
        }
    });
    stats.to_tsv_with_names(
        &ctx.tpm_stats_file(),
        &tpm.genes,
        &["mean".into(), "std".into()],
    )?;

    write_lines_atomic(&norm.genes, &ctx.highvar_genes_file())?;
    plan.to_json(&ctx.plan_file())?;

    info!(
        "planned {} factorizations: K = {:?} x {} replicates",
        plan.units.len(),
        plan.ranks,
        plan.n_replicates
    );
    Ok(plan)
}

pub fn load_plan(ctx: &RunContext) -> anyhow::Result<RunPlan> {
    RunPlan::from_json(&ctx.plan_file())
}

pub fn load_normalized(ctx: &RunContext) -> anyhow::Result<NormalizedMatrix> {
    let xx = ExpressionMatrix::from_mtx(
        &ctx.norm_counts_file(),
        &ctx.norm_counts_rows_file(),
        &ctx.norm_counts_cols_file(),
        false,
    )?;
    let columns: Vec<usize> = (0..xx.num_genes()).collect();
    Ok(NormalizedMatrix {
        data: select_columns_dense(&xx.counts, &columns),
        cells: xx.cells,
        genes: xx.genes,
    })
}

pub fn load_tpm(ctx: &RunContext) -> anyhow::Result<ExpressionMatrix> {
    ExpressionMatrix::from_mtx(
        &ctx.tpm_file(),
        &ctx.tpm_rows_file(),
        &ctx.tpm_cols_file(),
        false,
    )
}

/// Per-gene TPM `(mean, std)`, in the column order of the TPM matrix
pub fn load_tpm_stats(ctx: &RunContext) -> anyhow::Result<(Vec<f32>, Vec<f32>)> {
    let MatWithNames { mat, .. } = Mat::read_data_with_names(&ctx.tpm_stats_file(), "\t")?;
    if mat.ncols() != 2 {
        anyhow::bail!("{}: expected mean and std columns", ctx.tpm_stats_file());
    }
    Ok((
        mat.column(0).iter().copied().collect(),
        mat.column(1).iter().copied().collect(),
    ))
}
