pub use log::{debug, info, warn};

pub type Mat = nalgebra::DMatrix<f32>;
pub type CscMat = nalgebra_sparse::CscMatrix<f32>;

pub use crate::error::CnmfError;
pub use crate::run_context::RunContext;

pub use matrix_util::traits::{IoOps, MatOps, MatTriplets, MatWithNames, SampleOps};

/// Labels `1..=K` used for factors in every table
pub fn factor_labels(rank: usize) -> Vec<Box<str>> {
    (1..=rank).map(|k| k.to_string().into_boxed_str()).collect()
}
