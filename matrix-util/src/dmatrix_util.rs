use crate::traits::*;
pub use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, Gamma, StandardNormal};

impl SampleOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn rnorm<R: Rng>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat {
        DMatrix::<f32>::from_fn(dd, nn, |_, _| StandardNormal.sample(rng))
    }

    fn rgamma<R: Rng>(
        dd: usize,
        nn: usize,
        param: (f32, f32),
        rng: &mut R,
    ) -> anyhow::Result<Self::Mat> {
        let (shape, scale) = param;
        let gamma = Gamma::new(shape, scale)?;
        Ok(DMatrix::<f32>::from_fn(dd, nn, |_, _| gamma.sample(rng)))
    }
}

impl MatOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn normalize_rows_inplace(&mut self) {
        for mut x_i in self.row_iter_mut() {
            let denom = x_i.norm();
            if denom > 0.0 {
                x_i /= denom;
            }
        }
    }

    fn normalize_rows(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.normalize_rows_inplace();
        ret
    }

    fn sum_to_one_rows_inplace(&mut self) {
        for mut x_i in self.row_iter_mut() {
            let denom = x_i.sum();
            if denom > 0.0 {
                x_i /= denom;
            }
        }
    }

    fn sum_to_one_rows(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.sum_to_one_rows_inplace();
        ret
    }
}

impl MatTriplets for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn from_nonzero_triplets(
        nrow: usize,
        ncol: usize,
        triplets: &[(usize, usize, f32)],
    ) -> anyhow::Result<Self::Mat> {
        let mut ret = DMatrix::<f32>::zeros(nrow, ncol);
        for &(i, j, x_ij) in triplets {
            if i >= nrow || j >= ncol {
                anyhow::bail!("({}, {}) outside of {} x {}", i, j, nrow, ncol);
            }
            ret[(i, j)] += x_ij;
        }
        Ok(ret)
    }

    fn to_nonzero_triplets(&self) -> Vec<(usize, usize, f32)> {
        let nrow = self.nrows();
        self.iter()
            .enumerate()
            .filter(|(_, &x)| x != 0.0)
            .map(|(k, &x)| (k % nrow, k / nrow, x))
            .collect()
    }
}

/// Median of a slice of values (NaN-free); 0 for an empty slice
pub fn median_f32(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Stack matrices with the same number of columns on top of each other
pub fn concatenate_rows(mats: &[DMatrix<f32>]) -> anyhow::Result<DMatrix<f32>> {
    let ncol = mats.first().map(|m| m.ncols()).unwrap_or(0);
    if mats.iter().any(|m| m.ncols() != ncol) {
        anyhow::bail!("cannot stack rows of matrices with different columns");
    }
    let nrow = mats.iter().map(|m| m.nrows()).sum();
    let mut ret = DMatrix::<f32>::zeros(nrow, ncol);
    let mut lb = 0;
    for m in mats {
        ret.rows_mut(lb, m.nrows()).copy_from(m);
        lb += m.nrows();
    }
    Ok(ret)
}

/// Put matrices with the same number of rows side by side
pub fn concatenate_columns(mats: &[DMatrix<f32>]) -> anyhow::Result<DMatrix<f32>> {
    let nrow = mats.first().map(|m| m.nrows()).unwrap_or(0);
    if mats.iter().any(|m| m.nrows() != nrow) {
        anyhow::bail!("cannot stack columns of matrices with different rows");
    }
    let ncol = mats.iter().map(|m| m.ncols()).sum();
    let mut ret = DMatrix::<f32>::zeros(nrow, ncol);
    let mut lb = 0;
    for m in mats {
        ret.columns_mut(lb, m.ncols()).copy_from(m);
        lb += m.ncols();
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let mut rng1 = rand::rngs::StdRng::seed_from_u64(7);
        let mut rng2 = rand::rngs::StdRng::seed_from_u64(7);
        let a = DMatrix::<f32>::rnorm(4, 3, &mut rng1);
        let b = DMatrix::<f32>::rnorm(4, 3, &mut rng2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sum_to_one_rows() {
        let mut xx = DMatrix::<f32>::from_row_slice(2, 3, &[1.0, 1.0, 2.0, 0.0, 0.0, 0.0]);
        xx.sum_to_one_rows_inplace();
        assert_abs_diff_eq!(xx.row(0).sum(), 1.0);
        assert_abs_diff_eq!(xx.row(1).sum(), 0.0);
    }

    #[test]
    fn test_median() {
        assert_eq!(median_f32(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median_f32(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median_f32(&[]), 0.0);
    }

    #[test]
    fn test_triplets_round_trip() -> anyhow::Result<()> {
        let xx = DMatrix::<f32>::from_row_slice(2, 2, &[0.0, 1.5, 2.0, 0.0]);
        let triplets = xx.to_nonzero_triplets();
        assert_eq!(triplets, vec![(1, 0, 2.0), (0, 1, 1.5)]);
        let yy = DMatrix::<f32>::from_nonzero_triplets(2, 2, &triplets)?;
        assert_eq!(xx, yy);
        Ok(())
    }

    #[test]
    fn test_concatenate() -> anyhow::Result<()> {
        let a = DMatrix::<f32>::from_row_slice(1, 2, &[1.0, 2.0]);
        let b = DMatrix::<f32>::from_row_slice(2, 2, &[3.0, 4.0, 5.0, 6.0]);
        let ab = concatenate_rows(&[a.clone(), b])?;
        assert_eq!(ab.nrows(), 3);
        assert_eq!(ab[(2, 1)], 6.0);
        assert!(concatenate_columns(&[a, ab]).is_err());
        Ok(())
    }
}
