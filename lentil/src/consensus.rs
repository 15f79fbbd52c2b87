//! Consensus of the replicate spectra of one rank
//!
//! The `R·K` replicate spectra are l2-normalized and clustered into `K`
//! groups. Within each group, the rows with the sparsest neighbourhood
//! are dropped as outliers and the element-wise median of the rest
//! becomes a consensus program. Usage and the two gene-level scalings
//! are then refit against the consensus spectra.

use crate::combine::{load_or_combine, CombinedRankOutput};
use crate::common::*;
use crate::input::{ExpressionMatrix, NormalizedMatrix};
use crate::nmf;
use crate::planner::NmfConfig;
use crate::prepare::{load_normalized, load_plan, load_tpm, load_tpm_stats};
use crate::run_context::ConsensusArtifact;
use matrix_util::clustering::{Kmeans, KmeansArgs};
use matrix_util::common_io::write_lines_atomic;
use matrix_util::dmatrix_dist::{mean_knn_distance, pairwise_row_distances};
use matrix_util::dmatrix_util::median_f32;
use matrix_util::sparse_util::{column_mean_var, dense_t_mul_sparse};
use matrix_util::utils::partition_by_membership;

#[derive(Clone, Debug)]
pub struct ConsensusArgs {
    /// fraction θ of each cluster kept, densest first
    pub density_threshold: f32,
    /// neighbourhood size for the local density, as a fraction of the
    /// number of replicates
    pub local_neighborhood_size: f32,
    pub seed: u64,
    pub kmeans_max_iter: usize,
}

impl Default for ConsensusArgs {
    fn default() -> Self {
        Self {
            density_threshold: 0.5,
            local_neighborhood_size: 0.3,
            seed: 1,
            kmeans_max_iter: 300,
        }
    }
}

/// `max(1, floor(fraction · R))`
pub fn neighborhood_size(n_replicates: usize, fraction: f32) -> usize {
    ((fraction as f64 * n_replicates as f64 + 1e-6).floor() as usize).max(1)
}

/// `floor(θ · n)`, all of them for `θ >= 1`
fn num_kept(n: usize, density_threshold: f32) -> usize {
    if density_threshold >= 1.0 {
        n
    } else {
        ((density_threshold.max(0.0) as f64 * n as f64 + 1e-6).floor() as usize).min(n)
    }
}

/// Clusters of the pooled replicate spectra
#[derive(Clone, Debug)]
pub struct SpectraClustering {
    pub rank: usize,
    /// l2-normalized spectra rows (R·K x genes)
    pub normalized: Mat,
    /// cluster of each row, numbered by first appearance
    pub labels: Vec<usize>,
    /// mean distance to the nearest rows; small is dense
    pub local_density: Vec<f32>,
    pub retained: Vec<bool>,
}

impl SpectraClustering {
    pub fn n_retained(&self) -> usize {
        self.retained.iter().filter(|&&r| r).count()
    }

    pub fn n_discarded(&self) -> usize {
        self.retained.len() - self.n_retained()
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        self.members(false).iter().map(Vec::len).collect()
    }

    /// Row indexes of each cluster `0..K`, ascending
    fn members(&self, retained_only: bool) -> Vec<Vec<usize>> {
        let mut groups = partition_by_membership(&self.labels);
        (0..self.rank)
            .map(|k| {
                let mut rows = groups.remove(&k).unwrap_or_default();
                if retained_only {
                    rows.retain(|&i| self.retained[i]);
                }
                rows
            })
            .collect()
    }

    /// Mean of the (retained) rows of each cluster (K x genes)
    pub fn centroids(&self, retained_only: bool) -> Mat {
        let mut cc = Mat::zeros(self.rank, self.normalized.ncols());
        for (k, members) in self.members(retained_only).into_iter().enumerate() {
            for &i in &members {
                let mut c_k = cc.row_mut(k);
                c_k += self.normalized.row(i);
            }
            if !members.is_empty() {
                let mut c_k = cc.row_mut(k);
                c_k /= members.len() as f32;
            }
        }
        cc
    }

    /// Mean cosine similarity between each row and its cluster centroid
    pub fn stability(&self, retained_only: bool) -> f32 {
        let cc = self.centroids(retained_only);
        let sims: Vec<f32> = (0..self.labels.len())
            .filter(|&i| !retained_only || self.retained[i])
            .map(|i| {
                let x_i = self.normalized.row(i);
                let c_k = cc.row(self.labels[i]);
                let denom = x_i.norm() * c_k.norm();
                if denom > 0.0 {
                    x_i.dot(&c_k) / denom
                } else {
                    0.0
                }
            })
            .collect();
        if sims.is_empty() {
            f32::NAN
        } else {
            sims.iter().sum::<f32>() / sims.len() as f32
        }
    }

    /// Element-wise median of the retained rows of each cluster, each
    /// rescaled to sum to one
    pub fn median_spectra(&self) -> anyhow::Result<Mat> {
        let mm = self.normalized.ncols();
        let mut ret = Mat::zeros(self.rank, mm);
        for (k, members) in self.members(true).into_iter().enumerate() {
            if members.is_empty() {
                return Err(CnmfError::EmptyCluster {
                    rank: self.rank,
                    cluster: k,
                }
                .into());
            }
            for j in 0..mm {
                let values: Vec<f32> = members.iter().map(|&i| self.normalized[(i, j)]).collect();
                ret[(k, j)] = median_f32(&values);
            }
        }
        ret.sum_to_one_rows_inplace();
        Ok(ret)
    }

    pub fn histogram_ascii(&self, max_width: usize) -> String {
        let sizes = self.cluster_sizes();
        let max_size = sizes.iter().copied().max().unwrap_or(1).max(1);
        let mut lines = vec![
            format!(
                "Consensus clusters of K={} ({} spectra, {} discarded):",
                self.rank,
                self.labels.len(),
                self.n_discarded()
            ),
            String::new(),
        ];
        let kept = self.members(true);
        for (k, &size) in sizes.iter().enumerate() {
            let kept = kept[k].len();
            let bar_len = ((size as f64 / max_size as f64) * max_width as f64) as usize;
            lines.push(format!(
                "  Cluster {:3}  {:>4} spectra ({:>4} kept)  {}",
                k + 1,
                size,
                kept,
                "█".repeat(bar_len.max(1))
            ));
        }
        lines.join("\n")
    }
}

/// Start from the rows of the replicate whose spectra sit in the
/// densest neighbourhoods. Falls back to seeded k-means++ when the
/// rows don't come in complete replicates or that replicate has
/// coincident rows.
fn initial_centroids(
    normalized: &Mat,
    local_density: &[f32],
    rank: usize,
    n_replicates: usize,
    args: &ConsensusArgs,
) -> Mat {
    let kmeanspp = || {
        normalized
            .kmeans_rows(KmeansArgs {
                num_clusters: rank,
                max_iter: args.kmeans_max_iter,
                seed: args.seed,
            })
            .centroids
    };

    if normalized.nrows() != rank * n_replicates {
        return kmeanspp();
    }

    let typical = (0..n_replicates)
        .map(|r| {
            let d: f32 = local_density[r * rank..(r + 1) * rank].iter().sum();
            (r, d)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(r, _)| r)
        .unwrap_or(0);

    let cc = normalized.rows(typical * rank, rank).into_owned();
    let distinct = (0..rank).all(|a| {
        ((a + 1)..rank).all(|b| (cc.row(a) - cc.row(b)).norm() > 1e-6)
    });
    if distinct {
        debug!("k-means starts from replicate {}", typical);
        cc
    } else {
        kmeanspp()
    }
}

/// Cluster the replicate spectra of one rank and mark which rows
/// survive the local density filter
pub fn cluster_spectra(
    combined: &CombinedRankOutput,
    args: &ConsensusArgs,
) -> anyhow::Result<SpectraClustering> {
    let rank = combined.rank;
    let normalized = combined.spectra.normalize_rows();
    if normalized.nrows() < rank {
        return Err(CnmfError::EmptyCluster {
            rank,
            cluster: normalized.nrows(),
        }
        .into());
    }

    let dist = pairwise_row_distances(&normalized);
    let knn = neighborhood_size(combined.n_replicates, args.local_neighborhood_size);
    let local_density = mean_knn_distance(&dist, knn);

    let init = initial_centroids(
        &normalized,
        &local_density,
        rank,
        combined.n_replicates,
        args,
    );
    let out = normalized.kmeans_rows_from(init, args.kmeans_max_iter);

    // number clusters by first appearance
    let mut relabel = vec![usize::MAX; out.centroids.nrows()];
    let mut next = 0;
    let labels: Vec<usize> = out
        .membership
        .iter()
        .map(|&k| {
            if relabel[k] == usize::MAX {
                relabel[k] = next;
                next += 1;
            }
            relabel[k]
        })
        .collect();
    if next < rank {
        return Err(CnmfError::EmptyCluster {
            rank,
            cluster: next,
        }
        .into());
    }

    let mut retained = vec![false; labels.len()];
    for k in 0..rank {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == k).collect();
        members.sort_by(|&a, &b| local_density[a].total_cmp(&local_density[b]).then(a.cmp(&b)));
        let n_keep = num_kept(members.len(), args.density_threshold);
        if n_keep == 0 {
            return Err(CnmfError::EmptyCluster { rank, cluster: k }.into());
        }
        for &i in &members[..n_keep] {
            retained[i] = true;
        }
    }

    Ok(SpectraClustering {
        rank,
        normalized,
        labels,
        local_density,
        retained,
    })
}

/// TPM over all genes with its per-gene mean and standard deviation
pub struct TpmReference {
    pub tpm: ExpressionMatrix,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl TpmReference {
    pub fn from_tpm(tpm: ExpressionMatrix) -> Self {
        let (mean, var) = column_mean_var(&tpm.counts, 1);
        Self {
            tpm,
            mean,
            std: var.iter().map(|v| v.sqrt()).collect(),
        }
    }
}

pub struct ConsensusSolution {
    pub rank: usize,
    pub density_threshold: f32,
    /// cells x K, not normalized
    pub usage: Mat,
    /// K x selected genes, rows sum to one
    pub spectra: Mat,
    /// K x all genes, regression of z-scored TPM on usage
    pub spectra_score: Mat,
    /// K x all genes, on the TPM scale
    pub spectra_tpm: Mat,
    pub clustering: SpectraClustering,
}

impl ConsensusSolution {
    pub fn n_retained(&self) -> usize {
        self.clustering.n_retained()
    }

    pub fn n_discarded(&self) -> usize {
        self.clustering.n_discarded()
    }
}

/// OLS coefficients `(U'U)⁻¹ U'Z` of per-gene z-scored TPM `Z` on
/// usage `U`, without densifying TPM. Genes without variance get 0.
pub fn usage_regression_scores(usage: &Mat, reference: &TpmReference) -> anyhow::Result<Mat> {
    let utu = usage.transpose() * usage;
    let utu_inv = match utu.clone().try_inverse() {
        Some(inv) => inv,
        None => {
            warn!("usage columns are collinear; using the pseudo-inverse");
            utu.pseudo_inverse(1e-8).map_err(|e| anyhow::anyhow!(e))?
        }
    };

    let mut utz = dense_t_mul_sparse(usage, &reference.tpm.counts)?;
    let u_sums: Vec<f32> = usage.column_iter().map(|u_k| u_k.sum()).collect();
    for (j, mut z_j) in utz.column_iter_mut().enumerate() {
        let (mu, sd) = (reference.mean[j], reference.std[j]);
        for (z, &s) in z_j.iter_mut().zip(u_sums.iter()) {
            *z = if sd > 0.0 { (*z - mu * s) / sd } else { 0.0 };
        }
    }
    Ok(utu_inv * utz)
}

/// Build the consensus factorization of one rank
pub fn build_consensus(
    combined: &CombinedRankOutput,
    norm: &NormalizedMatrix,
    reference: &TpmReference,
    args: &ConsensusArgs,
    nmf_config: &NmfConfig,
) -> anyhow::Result<ConsensusSolution> {
    if combined.spectra.ncols() != norm.data.ncols() {
        return Err(CnmfError::FormatMismatch(format!(
            "spectra over {} genes vs normalized data over {} genes",
            combined.spectra.ncols(),
            norm.data.ncols()
        ))
        .into());
    }
    if reference.tpm.num_cells() != norm.data.nrows() {
        return Err(CnmfError::FormatMismatch(format!(
            "TPM over {} cells vs normalized data over {} cells",
            reference.tpm.num_cells(),
            norm.data.nrows()
        ))
        .into());
    }

    let clustering = cluster_spectra(combined, args)?;
    info!(
        "K={}: kept {} of {} replicate spectra",
        combined.rank,
        clustering.n_retained(),
        clustering.retained.len()
    );

    let spectra = clustering.median_spectra()?;
    let usage = nmf::refit_usage(&norm.data, &spectra, nmf_config)?;

    let spectra_tpm = nmf::refit_spectra(&reference.tpm.counts, &usage.sum_to_one_rows(), nmf_config)?;
    let spectra_score = usage_regression_scores(&usage, reference)?;

    Ok(ConsensusSolution {
        rank: combined.rank,
        density_threshold: args.density_threshold,
        usage,
        spectra,
        spectra_score,
        spectra_tpm,
        clustering,
    })
}

impl ConsensusSolution {
    pub fn save(
        &self,
        ctx: &RunContext,
        norm: &NormalizedMatrix,
        reference: &TpmReference,
        replicate_labels: &[Box<str>],
        show_clustering: bool,
    ) -> anyhow::Result<()> {
        let factors = factor_labels(self.rank);
        let file = |a: ConsensusArtifact| ctx.consensus_file(a, self.rank, self.density_threshold);

        self.usage
            .to_tsv_with_names(&file(ConsensusArtifact::Usages), &norm.cells, &factors)?;
        self.spectra
            .to_tsv_with_names(&file(ConsensusArtifact::Spectra), &factors, &norm.genes)?;
        self.spectra_score.to_tsv_with_names(
            &file(ConsensusArtifact::GeneSpectraScore),
            &factors,
            &reference.tpm.genes,
        )?;
        self.spectra_tpm.to_tsv_with_names(
            &file(ConsensusArtifact::GeneSpectraTpm),
            &factors,
            &reference.tpm.genes,
        )?;

        if show_clustering {
            let c = &self.clustering;
            let lines: Vec<String> = std::iter::once("\tcluster\tlocal_density\tretained".to_string())
                .chain((0..c.labels.len()).map(|i| {
                    format!(
                        "{}\t{}\t{}\t{}",
                        replicate_labels[i],
                        c.labels[i] + 1,
                        c.local_density[i],
                        c.retained[i]
                    )
                }))
                .collect();
            write_lines_atomic(&lines, &file(ConsensusArtifact::Clustering))?;
            info!("\n{}", c.histogram_ascii(40));
        }
        Ok(())
    }
}

/// The `consensus` stage for one rank
pub fn consensus(
    ctx: &RunContext,
    rank: usize,
    args: &ConsensusArgs,
    show_clustering: bool,
) -> anyhow::Result<ConsensusSolution> {
    let plan = load_plan(ctx)?;
    if !plan.ranks.contains(&rank) {
        anyhow::bail!("K={} is not part of the plan {:?}", rank, plan.ranks);
    }
    let combined = load_or_combine(ctx, &plan, rank)?;
    let norm = load_normalized(ctx)?;
    let (mean, std) = load_tpm_stats(ctx)?;
    let reference = TpmReference {
        tpm: load_tpm(ctx)?,
        mean,
        std,
    };
    if reference.mean.len() != reference.tpm.num_genes() {
        return Err(CnmfError::FormatMismatch("TPM statistics don't match the TPM matrix".into()).into());
    }

    let solution = build_consensus(&combined, &norm, &reference, args, &plan.nmf)?;
    solution.save(ctx, &norm, &reference, &combined.labels, show_clustering)?;

    let error = nmf::reconstruction_error(&norm.data, &solution.usage, &solution.spectra, plan.nmf.beta_loss);
    info!(
        "consensus K={} at θ={}: {} spectra kept, {} discarded, error {:.4}",
        rank,
        args.density_threshold,
        solution.n_retained(),
        solution.n_discarded(),
        error
    );
    Ok(solution)
}
