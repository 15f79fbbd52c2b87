use thiserror::Error;

/// Failures of the consensus NMF stages that callers may want to
/// tell apart. They travel inside `anyhow::Error`; recover them with
/// `err.downcast_ref::<CnmfError>()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CnmfError {
    /// Malformed input matrix, or names that don't match its shape
    #[error("input format mismatch: {0}")]
    FormatMismatch(String),

    /// Input that parses fine but can't be factorized
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// A candidate rank outside `2 .. bound`
    #[error("invalid rank K={rank}: must be > 1 and < {bound} (min of #cells and #genes)")]
    InvalidRank { rank: usize, bound: usize },

    /// Not every replicate of a rank has been factorized yet
    #[error("rank K={rank} is incomplete: found {found} of {expected} replicates")]
    IncompleteRank {
        rank: usize,
        found: usize,
        expected: usize,
    },

    /// Outlier filtering (or clustering) left a consensus cluster empty
    #[error(
        "consensus cluster {cluster} of K={rank} is empty; \
         raise the local density threshold or pick another K"
    )]
    EmptyCluster { rank: usize, cluster: usize },

    /// A saved artifact belongs to an earlier plan of the same run
    #[error("stale artifact {file}: written for a different run plan")]
    StaleArtifact { file: String },

    #[error("invalid worker partition: worker {worker_index} of {total_workers}")]
    InvalidPartition {
        worker_index: usize,
        total_workers: usize,
    },
}
