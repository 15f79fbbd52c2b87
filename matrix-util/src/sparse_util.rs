//! Helpers for `nalgebra_sparse::CscMatrix<f32>`: triplet conversion,
//! per-column statistics and products with dense factors

use crate::traits::MatTriplets;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rayon::prelude::*;

impl MatTriplets for CscMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn from_nonzero_triplets(
        nrow: usize,
        ncol: usize,
        triplets: &[(usize, usize, f32)],
    ) -> anyhow::Result<Self::Mat> {
        let mut coo = CooMatrix::new(nrow, ncol);
        for &(i, j, x_ij) in triplets {
            if i >= nrow || j >= ncol {
                anyhow::bail!("({}, {}) outside of {} x {}", i, j, nrow, ncol);
            }
            coo.push(i, j, x_ij);
        }
        // duplicates are summed up in the conversion
        Ok(CscMatrix::from(&coo))
    }

    fn to_nonzero_triplets(&self) -> Vec<(usize, usize, f32)> {
        self.col_iter()
            .enumerate()
            .flat_map(|(j, x_j)| {
                x_j.row_indices()
                    .iter()
                    .zip(x_j.values())
                    .filter(|(_, &x)| x != 0.0)
                    .map(move |(&i, &x)| (i, j, x))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Mean and variance of each column
/// * `ddof` - delta degrees of freedom (1 = unbiased sample variance)
pub fn column_mean_var(xx: &CscMatrix<f32>, ddof: usize) -> (Vec<f32>, Vec<f32>) {
    let nn = xx.nrows() as f64;
    let denom = (xx.nrows().saturating_sub(ddof)).max(1) as f64;

    xx.col_iter()
        .map(|x_j| {
            let s1: f64 = x_j.values().iter().map(|&x| x as f64).sum();
            let s2: f64 = x_j.values().iter().map(|&x| (x as f64) * (x as f64)).sum();
            let mu = if nn > 0. { s1 / nn } else { 0. };
            let var = ((s2 - nn * mu * mu) / denom).max(0.);
            (mu as f32, var as f32)
        })
        .unzip()
}

/// Sum of each row
pub fn row_sums(xx: &CscMatrix<f32>) -> Vec<f32> {
    let mut ret = vec![0_f32; xx.nrows()];
    for x_j in xx.col_iter() {
        for (&i, &x) in x_j.row_indices().iter().zip(x_j.values()) {
            ret[i] += x;
        }
    }
    ret
}

/// Dense copy of the selected columns, in the order of `columns`
pub fn select_columns_dense(xx: &CscMatrix<f32>, columns: &[usize]) -> DMatrix<f32> {
    let mut ret = DMatrix::<f32>::zeros(xx.nrows(), columns.len());
    for (jj, &j) in columns.iter().enumerate() {
        let x_j = xx.col(j);
        for (&i, &x) in x_j.row_indices().iter().zip(x_j.values()) {
            ret[(i, jj)] = x;
        }
    }
    ret
}

/// `W' * X` for a dense `W` (n x k) and sparse `X` (n x m), giving k x m
pub fn dense_t_mul_sparse(ww: &DMatrix<f32>, xx: &CscMatrix<f32>) -> anyhow::Result<DMatrix<f32>> {
    if ww.nrows() != xx.nrows() {
        anyhow::bail!(
            "incompatible dimensions: {} x {} vs {} x {}",
            ww.nrows(),
            ww.ncols(),
            xx.nrows(),
            xx.ncols()
        );
    }

    let kk = ww.ncols();
    let columns: Vec<Vec<f32>> = (0..xx.ncols())
        .into_par_iter()
        .map(|j| {
            let x_j = xx.col(j);
            let mut out = vec![0_f32; kk];
            for (&i, &x) in x_j.row_indices().iter().zip(x_j.values()) {
                for (k, o) in out.iter_mut().enumerate() {
                    *o += ww[(i, k)] * x;
                }
            }
            out
        })
        .collect();

    Ok(DMatrix::<f32>::from_iterator(
        kk,
        xx.ncols(),
        columns.into_iter().flatten(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn toy() -> anyhow::Result<CscMatrix<f32>> {
        // [[1, 0, 2],
        //  [0, 3, 4]]
        CscMatrix::<f32>::from_nonzero_triplets(
            2,
            3,
            &[(0, 0, 1.0), (1, 1, 3.0), (0, 2, 2.0), (1, 2, 4.0)],
        )
    }

    #[test]
    fn test_column_mean_var() -> anyhow::Result<()> {
        let xx = toy()?;
        let (mu, var) = column_mean_var(&xx, 0);
        assert_abs_diff_eq!(mu[2], 3.0);
        assert_abs_diff_eq!(var[2], 1.0);
        let (_, var1) = column_mean_var(&xx, 1);
        assert_abs_diff_eq!(var1[0], 0.5);
        Ok(())
    }

    #[test]
    fn test_products_match_dense() -> anyhow::Result<()> {
        let xx = toy()?;
        let dense = select_columns_dense(&xx, &[0, 1, 2]);
        let ww = DMatrix::<f32>::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let expected = ww.transpose() * &dense;
        let actual = dense_t_mul_sparse(&ww, &xx)?;
        assert_abs_diff_eq!(expected, actual, epsilon = 1e-6);
        assert_eq!(row_sums(&xx), vec![3.0, 7.0]);
        Ok(())
    }

    #[test]
    fn test_duplicate_triplets_are_summed() -> anyhow::Result<()> {
        let xx = CscMatrix::<f32>::from_nonzero_triplets(1, 1, &[(0, 0, 1.0), (0, 0, 2.0)])?;
        assert_eq!(xx.to_nonzero_triplets(), vec![(0, 0, 3.0)]);
        Ok(())
    }
}
