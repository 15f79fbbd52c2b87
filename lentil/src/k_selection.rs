//! Stability and error of every rank, for picking K by eye
//!
//! Nothing here chooses K. The table and the log chart are meant to be
//! read by a person weighing stability against error.

use crate::combine::{load_or_combine, CombinedRankOutput};
use crate::common::*;
use crate::consensus::{cluster_spectra, ConsensusArgs};
use crate::nmf::{reconstruction_error, refit_usage};
use crate::planner::{BetaLoss, NmfConfig};
use crate::prepare::{load_normalized, load_plan};
use matrix_util::common_io::write_lines_atomic;
use matrix_util::dmatrix_dist::{pairwise_row_distances, silhouette_widths};
use matrix_util::utils::bar_chart_ascii;

#[derive(Clone, Debug, PartialEq)]
pub struct StabilityRecord {
    pub rank: usize,
    /// mean cosine similarity of every replicate spectrum to its
    /// cluster centroid, no outlier filtering
    pub stability: f32,
    /// the same over the rows that pass the density filter; NaN when
    /// the filter empties a cluster
    pub stability_filtered: f32,
    pub silhouette: f32,
    /// mean reconstruction error of the replicates
    pub mean_error: f32,
    /// `||X - U S||` of the unfiltered consensus
    pub consensus_error: f32,
}

fn is_empty_cluster(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CnmfError>(),
        Some(CnmfError::EmptyCluster { .. })
    )
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        f32::NAN
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

pub fn score_rank(
    combined: &CombinedRankOutput,
    norm: &Mat,
    args: &ConsensusArgs,
    nmf_config: &NmfConfig,
) -> anyhow::Result<StabilityRecord> {
    let rank = combined.rank;
    let mut record = StabilityRecord {
        rank,
        stability: f32::NAN,
        stability_filtered: f32::NAN,
        silhouette: f32::NAN,
        mean_error: combined.mean_error(),
        consensus_error: f32::NAN,
    };

    let unfiltered = ConsensusArgs {
        density_threshold: 1.0,
        ..args.clone()
    };
    let raw = match cluster_spectra(combined, &unfiltered) {
        Ok(raw) => raw,
        Err(e) if is_empty_cluster(&e) => {
            warn!("K={}: {}", rank, e);
            return Ok(record);
        }
        Err(e) => return Err(e),
    };

    record.stability = raw.stability(false);
    let dist = pairwise_row_distances(&raw.normalized);
    record.silhouette = mean(&silhouette_widths(&dist, &raw.labels));

    record.stability_filtered = match cluster_spectra(combined, args) {
        Ok(filtered) => filtered.stability(true),
        Err(e) if is_empty_cluster(&e) => {
            warn!("K={} at θ={}: {}", rank, args.density_threshold, e);
            f32::NAN
        }
        Err(e) => return Err(e),
    };

    let spectra = raw.median_spectra()?;
    let usage = refit_usage(norm, &spectra, nmf_config)?;
    record.consensus_error = reconstruction_error(norm, &usage, &spectra, BetaLoss::Frobenius);

    Ok(record)
}

pub fn write_k_selection_table(records: &[StabilityRecord], file: &str) -> anyhow::Result<()> {
    let lines: Vec<String> = std::iter::once(
        "k\tstability\tstability_filtered\tsilhouette\tmean_error\tconsensus_error".to_string(),
    )
    .chain(records.iter().map(|r| {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            r.rank, r.stability, r.stability_filtered, r.silhouette, r.mean_error, r.consensus_error
        )
    }))
    .collect();
    write_lines_atomic(&lines, file)
}

/// Stability and error side by side, one bar per rank
pub fn render_k_selection(records: &[StabilityRecord], max_width: usize) -> String {
    let bars = |f: fn(&StabilityRecord) -> f32| -> Vec<(Box<str>, f32)> {
        records
            .iter()
            .map(|r| (format!("K={}", r.rank).into_boxed_str(), f(r)))
            .collect()
    };
    [
        bar_chart_ascii("Stability (higher is better)", &bars(|r| r.stability), max_width),
        bar_chart_ascii(
            "Consensus error (lower is better)",
            &bars(|r| r.consensus_error),
            max_width,
        ),
        bar_chart_ascii("Mean replicate error", &bars(|r| r.mean_error), max_width),
    ]
    .join("\n\n")
}

/// Score every complete rank of the plan and write the table. Ranks
/// that aren't fully factorized yet are skipped with a warning.
pub fn k_selection(ctx: &RunContext, args: &ConsensusArgs) -> anyhow::Result<Vec<StabilityRecord>> {
    let plan = load_plan(ctx)?;
    let norm = load_normalized(ctx)?;

    let mut records = vec![];
    let mut first_incomplete = None;
    for &rank in &plan.ranks {
        let combined = match load_or_combine(ctx, &plan, rank) {
            Ok(c) => c,
            Err(e)
                if matches!(
                    e.downcast_ref::<CnmfError>(),
                    Some(CnmfError::IncompleteRank { .. })
                ) =>
            {
                warn!("skipping K={}: {}", rank, e);
                if first_incomplete.is_none() {
                    first_incomplete = Some(e);
                }
                continue;
            }
            Err(e) => return Err(e),
        };
        let record = score_rank(&combined, &norm.data, args, &plan.nmf)?;
        info!(
            "K={}: stability {:.4}, filtered {:.4}, error {:.4}",
            rank, record.stability, record.stability_filtered, record.consensus_error
        );
        records.push(record);
    }

    if records.is_empty() {
        return Err(first_incomplete.unwrap_or_else(|| anyhow::anyhow!("no rank to score")));
    }

    write_k_selection_table(&records, &ctx.k_selection_file())?;
    info!("\n{}", render_k_selection(&records, 40));
    info!("wrote {}", ctx.k_selection_file());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combine::replicate_labels;

    fn combined_from(spectra: Mat, rank: usize, n_replicates: usize) -> CombinedRankOutput {
        CombinedRankOutput {
            rank,
            n_replicates,
            usages: Mat::zeros(1, spectra.nrows()),
            spectra,
            labels: replicate_labels(rank, n_replicates),
            errors: (0..n_replicates).map(|r| r as f32).collect(),
            plan_id: 0,
        }
    }

    #[test]
    fn test_agreeing_replicates_are_stable() -> anyhow::Result<()> {
        let truth = Mat::from_row_slice(2, 4, &[1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
        let usage = Mat::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 0.5, 0.5]);
        let xx = &usage * &truth;

        let mut spectra = Mat::zeros(6, 4);
        for r in 0..3 {
            spectra.rows_mut(2 * r, 2).copy_from(&truth);
        }
        let record = score_rank(
            &combined_from(spectra, 2, 3),
            &xx,
            &ConsensusArgs::default(),
            &NmfConfig::default(),
        )?;
        assert!((record.stability - 1.0).abs() < 1e-5);
        assert!((record.stability_filtered - 1.0).abs() < 1e-5);
        assert!(record.silhouette > 0.99);
        assert_eq!(record.mean_error, 1.0);
        assert!(record.consensus_error < 0.05 * xx.norm());
        Ok(())
    }

    #[test]
    fn test_aggressive_filter_gives_nan() -> anyhow::Result<()> {
        let truth = Mat::from_row_slice(2, 3, &[1.0, 0.1, 0.0, 0.0, 0.1, 1.0]);
        let xx = Mat::from_row_slice(2, 3, &[1.0, 0.2, 0.1, 0.1, 0.2, 1.0]);
        let mut spectra = Mat::zeros(4, 3);
        for r in 0..2 {
            spectra.rows_mut(2 * r, 2).copy_from(&truth);
        }
        let args = ConsensusArgs {
            density_threshold: 0.1,
            ..Default::default()
        };
        let record = score_rank(&combined_from(spectra, 2, 2), &xx, &args, &NmfConfig::default())?;
        assert!(record.stability_filtered.is_nan());
        assert!(record.stability.is_finite());
        Ok(())
    }

    #[test]
    fn test_table_and_chart() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("k.tsv");
        let file = file.to_string_lossy();
        let records = vec![
            StabilityRecord {
                rank: 3,
                stability: 0.9,
                stability_filtered: 0.95,
                silhouette: 0.5,
                mean_error: 10.0,
                consensus_error: 11.0,
            },
            StabilityRecord {
                rank: 4,
                stability: 0.8,
                stability_filtered: f32::NAN,
                silhouette: 0.4,
                mean_error: 9.0,
                consensus_error: 10.0,
            },
        ];
        write_k_selection_table(&records, &file)?;
        let lines = matrix_util::common_io::read_lines(&file)?;
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("k\tstability\tstability_filtered"));
        assert!(lines[2].contains("NaN"));

        let chart = render_k_selection(&records, 20);
        assert!(chart.contains("K=3"));
        assert!(chart.contains("Stability"));
        Ok(())
    }
}
