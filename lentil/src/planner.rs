//! Enumerate the `(K, replicate)` factorizations of a run, give each
//! one a reproducible seed, and split them across workers

use crate::common::*;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

#[derive(clap::ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BetaLoss {
    Frobenius,
    KullbackLeibler,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NmfConfig {
    pub max_iter: usize,
    /// stop once the relative improvement of the reconstruction error
    /// over ten iterations drops below `tol`
    pub tol: f32,
    pub beta_loss: BetaLoss,
}

impl Default for NmfConfig {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            tol: 1e-4,
            beta_loss: BetaLoss::Frobenius,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkUnit {
    pub index: usize,
    pub rank: usize,
    pub replicate: usize,
    pub seed: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunPlan {
    pub ranks: Vec<usize>,
    pub n_replicates: usize,
    pub master_seed: u64,
    pub num_cells: usize,
    pub num_genes: usize,
    pub nmf: NmfConfig,
    pub units: Vec<WorkUnit>,
    /// fingerprint of the normalized data the plan was made for
    #[serde(default)]
    pub data_id: u64,
}

/// Seed of one replicate. Depends only on `(master_seed, rank,
/// replicate)`, never on how the plan is partitioned.
pub fn replicate_seed(master_seed: u64, rank: usize, replicate: usize) -> u64 {
    let mut z = master_seed;
    for v in [rank as u64, replicate as u64] {
        z = splitmix64(z ^ splitmix64(v));
    }
    z
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Ranks `min, min + step, ...` up to and including `max`
pub fn rank_range(min: usize, max: usize, step: usize) -> Vec<usize> {
    (min..=max).step_by(step.max(1)).collect()
}

impl RunPlan {
    /// Plan `ranks × n_replicates` factorizations ordered by rank,
    /// then replicate. Ranks are deduplicated and sorted.
    ///
    /// * `num_cells`, `num_genes` - shape of the normalized matrix;
    ///   every rank must satisfy `1 < K < min(num_cells, num_genes)`
    pub fn new(
        ranks: &[usize],
        n_replicates: usize,
        master_seed: u64,
        nmf: NmfConfig,
        num_cells: usize,
        num_genes: usize,
    ) -> anyhow::Result<Self> {
        let mut ranks = ranks.to_vec();
        ranks.sort_unstable();
        ranks.dedup();

        let bound = num_cells.min(num_genes);
        if ranks.is_empty() {
            return Err(CnmfError::InvalidRank { rank: 0, bound }.into());
        }
        if let Some(&rank) = ranks.iter().find(|&&k| k <= 1 || k >= bound) {
            return Err(CnmfError::InvalidRank { rank, bound }.into());
        }
        if n_replicates == 0 {
            anyhow::bail!("need at least one replicate per rank");
        }
        if nmf.max_iter == 0 || nmf.tol.is_nan() || nmf.tol < 0.0 {
            anyhow::bail!("invalid NMF settings: {:?}", nmf);
        }

        let units = ranks
            .iter()
            .flat_map(|&rank| (0..n_replicates).map(move |replicate| (rank, replicate)))
            .enumerate()
            .map(|(index, (rank, replicate))| WorkUnit {
                index,
                rank,
                replicate,
                seed: replicate_seed(master_seed, rank, replicate),
            })
            .collect();

        Ok(Self {
            ranks,
            n_replicates,
            master_seed,
            num_cells,
            num_genes,
            nmf,
            units,
            data_id: 0,
        })
    }

    /// Identifies this plan and its data. Every replicate and merge
    /// records it, so factors of an earlier plan are never mistaken
    /// for current ones.
    pub fn plan_id(&self) -> anyhow::Result<u64> {
        let mut hasher = FnvHasher::default();
        hasher.write(serde_json::to_string(self)?.as_bytes());
        Ok(hasher.finish())
    }

    /// Units assigned to one worker: `index % total_workers == worker_index`
    pub fn partition(
        &self,
        worker_index: usize,
        total_workers: usize,
    ) -> anyhow::Result<Vec<WorkUnit>> {
        if total_workers == 0 || worker_index >= total_workers {
            return Err(CnmfError::InvalidPartition {
                worker_index,
                total_workers,
            }
            .into());
        }
        Ok(self
            .units
            .iter()
            .filter(|u| u.index % total_workers == worker_index)
            .copied()
            .collect())
    }

    pub fn units_of_rank(&self, rank: usize) -> impl Iterator<Item = &WorkUnit> {
        self.units.iter().filter(move |u| u.rank == rank)
    }

    pub fn to_json(&self, file: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        matrix_util::common_io::write_lines_atomic(&[json], file)
    }

    pub fn from_json(file: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(file)
            .map_err(|e| anyhow::anyhow!("failed to read run plan {}: {}", file, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}
