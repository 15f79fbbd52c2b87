//! Where every stage reads and writes its artifacts
//!
//! A run named `<name>` lives in `<out_dir>/<name>/`. Intermediate
//! files (prepared matrices, per-replicate factors, the run plan) go
//! into `<out_dir>/<name>/cnmf_tmp/`; user-facing results sit one level
//! up.

use std::path::{Path, PathBuf};

/// Consensus outputs written for one `(K, θ)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusArtifact {
    Usages,
    Spectra,
    GeneSpectraScore,
    GeneSpectraTpm,
    Clustering,
}

impl ConsensusArtifact {
    fn stem(&self) -> &'static str {
        match self {
            Self::Usages => "usages",
            Self::Spectra => "spectra",
            Self::GeneSpectraScore => "gene_spectra_score",
            Self::GeneSpectraTpm => "gene_spectra_tpm",
            Self::Clustering => "clustering",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Self::Usages | Self::Spectra => "consensus.txt",
            _ => "txt",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunContext {
    out_dir: PathBuf,
    name: Box<str>,
}

impl RunContext {
    pub fn new(out_dir: &str, name: &str) -> anyhow::Result<Self> {
        if name.is_empty() || name.contains(std::path::MAIN_SEPARATOR) {
            anyhow::bail!("invalid run name: {:?}", name);
        }
        Ok(Self {
            out_dir: PathBuf::from(out_dir),
            name: name.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_dir(&self) -> PathBuf {
        self.out_dir.join(&*self.name)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.run_dir().join("cnmf_tmp")
    }

    pub fn create_dirs(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }

    fn in_run_dir(&self, file: String) -> Box<str> {
        path_str(&self.run_dir().join(file))
    }

    fn in_tmp_dir(&self, file: String) -> Box<str> {
        path_str(&self.tmp_dir().join(file))
    }

    pub fn norm_counts_file(&self) -> Box<str> {
        self.in_tmp_dir(format!("{}.norm_counts.mtx.gz", self.name))
    }

    pub fn norm_counts_rows_file(&self) -> Box<str> {
        self.in_tmp_dir(format!("{}.norm_counts.rows.gz", self.name))
    }

    pub fn norm_counts_cols_file(&self) -> Box<str> {
        self.in_tmp_dir(format!("{}.norm_counts.cols.gz", self.name))
    }

    pub fn tpm_file(&self) -> Box<str> {
        self.in_tmp_dir(format!("{}.tpm.mtx.gz", self.name))
    }

    pub fn tpm_rows_file(&self) -> Box<str> {
        self.in_tmp_dir(format!("{}.tpm.rows.gz", self.name))
    }

    pub fn tpm_cols_file(&self) -> Box<str> {
        self.in_tmp_dir(format!("{}.tpm.cols.gz", self.name))
    }

    /// Per-gene mean and standard deviation of TPM
    pub fn tpm_stats_file(&self) -> Box<str> {
        self.in_tmp_dir(format!("{}.tpm_stats.tsv", self.name))
    }

    pub fn highvar_genes_file(&self) -> Box<str> {
        self.in_run_dir(format!("{}.overdispersed_genes.txt", self.name))
    }

    pub fn plan_file(&self) -> Box<str> {
        self.in_tmp_dir(format!("{}.nmf_params.json", self.name))
    }

    pub fn replicate_spectra_file(&self, rank: usize, replicate: usize) -> Box<str> {
        self.in_tmp_dir(format!(
            "{}.spectra.k_{}.iter_{}.tsv.gz",
            self.name, rank, replicate
        ))
    }

    pub fn replicate_usage_file(&self, rank: usize, replicate: usize) -> Box<str> {
        self.in_tmp_dir(format!(
            "{}.usages.k_{}.iter_{}.tsv.gz",
            self.name, rank, replicate
        ))
    }

    /// Written last; its presence marks the replicate as complete
    pub fn replicate_stats_file(&self, rank: usize, replicate: usize) -> Box<str> {
        self.in_tmp_dir(format!(
            "{}.stats.k_{}.iter_{}.json",
            self.name, rank, replicate
        ))
    }

    pub fn merged_spectra_file(&self, rank: usize) -> Box<str> {
        self.in_tmp_dir(format!("{}.spectra.k_{}.merged.tsv.gz", self.name, rank))
    }

    pub fn merged_usage_file(&self, rank: usize) -> Box<str> {
        self.in_tmp_dir(format!("{}.usages.k_{}.merged.tsv.gz", self.name, rank))
    }

    pub fn merged_errors_file(&self, rank: usize) -> Box<str> {
        self.in_tmp_dir(format!("{}.errors.k_{}.merged.tsv", self.name, rank))
    }

    /// Written last; marks a finished merge and names its plan
    pub fn merged_stats_file(&self, rank: usize) -> Box<str> {
        self.in_tmp_dir(format!("{}.stats.k_{}.merged.json", self.name, rank))
    }

    /// Delete every per-replicate and merged factor file of this run.
    /// Returns how many files were removed.
    pub fn remove_factor_artifacts(&self) -> anyhow::Result<usize> {
        let tmp_dir = self.tmp_dir();
        if !tmp_dir.is_dir() {
            return Ok(0);
        }
        let prefixes: Vec<String> = ["spectra.k_", "usages.k_", "stats.k_", "errors.k_"]
            .iter()
            .map(|p| format!("{}.{}", self.name, p))
            .collect();

        let mut removed = 0;
        for entry in std::fs::read_dir(&tmp_dir)? {
            let path = entry?.path();
            let is_factor = path
                .file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| prefixes.iter().any(|p| f.starts_with(p.as_str())));
            if is_factor && path.is_file() {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn k_selection_file(&self) -> Box<str> {
        self.in_run_dir(format!("{}.k_selection_stats.tsv", self.name))
    }

    pub fn consensus_file(
        &self,
        artifact: ConsensusArtifact,
        rank: usize,
        density_threshold: f32,
    ) -> Box<str> {
        self.in_run_dir(format!(
            "{}.{}.k_{}.dt_{}.{}",
            self.name,
            artifact.stem(),
            rank,
            density_threshold_tag(density_threshold),
            artifact.suffix()
        ))
    }
}

/// `0.8 -> "0_8"`, `2 -> "2_0"`
pub fn density_threshold_tag(density_threshold: f32) -> String {
    let s = if density_threshold.fract() == 0.0 {
        format!("{:.1}", density_threshold)
    } else {
        format!("{}", density_threshold)
    };
    s.replace('.', "_")
}

pub fn file_exists(file: &str) -> bool {
    Path::new(file).is_file()
}

fn path_str(path: &Path) -> Box<str> {
    path.to_string_lossy().into_owned().into_boxed_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_density_threshold_tag() {
        assert_eq!(density_threshold_tag(0.8), "0_8");
        assert_eq!(density_threshold_tag(0.05), "0_05");
        assert_eq!(density_threshold_tag(2.0), "2_0");
    }

    #[test]
    fn test_artifact_names() -> anyhow::Result<()> {
        let ctx = RunContext::new("out", "pbmc")?;
        assert!(ctx
            .replicate_spectra_file(7, 3)
            .ends_with("pbmc/cnmf_tmp/pbmc.spectra.k_7.iter_3.tsv.gz"));
        assert!(ctx
            .consensus_file(ConsensusArtifact::Usages, 7, 0.1)
            .ends_with("pbmc/pbmc.usages.k_7.dt_0_1.consensus.txt"));
        assert!(ctx
            .consensus_file(ConsensusArtifact::GeneSpectraTpm, 7, 0.1)
            .ends_with("pbmc/pbmc.gene_spectra_tpm.k_7.dt_0_1.txt"));
        assert!(RunContext::new("out", "").is_err());
        Ok(())
    }

    #[test]
    fn test_remove_factor_artifacts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = RunContext::new(&dir.path().to_string_lossy(), "toy")?;
        assert_eq!(ctx.remove_factor_artifacts()?, 0);

        ctx.create_dirs()?;
        let factors = [
            ctx.replicate_spectra_file(2, 0),
            ctx.replicate_usage_file(2, 0),
            ctx.replicate_stats_file(2, 0),
            ctx.merged_spectra_file(2),
            ctx.merged_errors_file(2),
            ctx.merged_stats_file(2),
        ];
        for file in factors.iter().chain([ctx.plan_file(), ctx.tpm_stats_file()].iter()) {
            std::fs::write(&**file, "x")?;
        }

        assert_eq!(ctx.remove_factor_artifacts()?, factors.len());
        assert!(factors.iter().all(|f| !file_exists(f)));
        assert!(file_exists(&ctx.plan_file()));
        assert!(file_exists(&ctx.tpm_stats_file()));
        Ok(())
    }
}
