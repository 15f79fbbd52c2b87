use nalgebra::DMatrix;
use rayon::prelude::*;

/// Euclidean distances between all pairs of rows (n x n)
pub fn pairwise_row_distances(xx: &DMatrix<f32>) -> DMatrix<f32> {
    let nn = xx.nrows();
    let gram = xx * xx.transpose();

    let dist: Vec<f32> = (0..(nn * nn))
        .into_par_iter()
        .map(|ij| {
            let (i, j) = (ij % nn, ij / nn);
            if i == j {
                0.0
            } else {
                (gram[(i, i)] + gram[(j, j)] - 2.0 * gram[(i, j)]).max(0.0).sqrt()
            }
        })
        .collect();

    DMatrix::<f32>::from_vec(nn, nn, dist)
}

/// Mean distance of each point to its `knn` nearest other points
///
/// * `dist` - symmetric distance matrix (n x n)
/// * `knn` - number of neighbours (clamped to `n - 1`)
pub fn mean_knn_distance(dist: &DMatrix<f32>, knn: usize) -> Vec<f32> {
    let nn = dist.nrows();
    let knn = knn.min(nn.saturating_sub(1));
    if knn == 0 {
        return vec![0.0; nn];
    }

    (0..nn)
        .into_par_iter()
        .map(|i| {
            let mut d_i: Vec<f32> = (0..nn).filter(|&j| j != i).map(|j| dist[(i, j)]).collect();
            d_i.sort_by(|a, b| a.total_cmp(b));
            d_i[..knn].iter().sum::<f32>() / knn as f32
        })
        .collect()
}

/// Silhouette width of each point given a precomputed distance matrix.
/// Points in singleton clusters get 0.
///
/// * `dist` - symmetric distance matrix (n x n)
/// * `membership` - cluster assignment of each point
pub fn silhouette_widths(dist: &DMatrix<f32>, membership: &[usize]) -> Vec<f32> {
    let nn = dist.nrows();
    let kk = membership.iter().copied().max().map(|k| k + 1).unwrap_or(0);
    let mut sizes = vec![0_usize; kk];
    for &k in membership {
        sizes[k] += 1;
    }

    (0..nn)
        .into_par_iter()
        .map(|i| {
            let own = membership[i];
            if sizes[own] <= 1 {
                return 0.0;
            }
            let mut sum_k = vec![0_f32; kk];
            for j in 0..nn {
                if j != i {
                    sum_k[membership[j]] += dist[(i, j)];
                }
            }
            let a = sum_k[own] / (sizes[own] - 1) as f32;
            let b = (0..kk)
                .filter(|&k| k != own && sizes[k] > 0)
                .map(|k| sum_k[k] / sizes[k] as f32)
                .fold(f32::INFINITY, f32::min);
            if !b.is_finite() {
                return 0.0;
            }
            let denom = a.max(b);
            if denom > 0.0 {
                (b - a) / denom
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_pairwise_row_distances() {
        let xx = DMatrix::<f32>::from_row_slice(3, 2, &[0.0, 0.0, 3.0, 4.0, 0.0, 1.0]);
        let dd = pairwise_row_distances(&xx);
        assert_abs_diff_eq!(dd[(0, 1)], 5.0, epsilon = 1e-5);
        assert_abs_diff_eq!(dd[(1, 0)], 5.0, epsilon = 1e-5);
        assert_abs_diff_eq!(dd[(0, 2)], 1.0, epsilon = 1e-5);
        assert_eq!(dd[(2, 2)], 0.0);
    }

    #[test]
    fn test_mean_knn_distance() {
        let xx = DMatrix::<f32>::from_row_slice(4, 1, &[0.0, 1.0, 2.0, 10.0]);
        let dd = pairwise_row_distances(&xx);
        let density = mean_knn_distance(&dd, 1);
        assert_abs_diff_eq!(density[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(density[3], 8.0, epsilon = 1e-5);
        let density = mean_knn_distance(&dd, 2);
        assert_abs_diff_eq!(density[1], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_silhouette_well_separated() {
        let xx = DMatrix::<f32>::from_row_slice(4, 1, &[0.0, 0.1, 10.0, 10.1]);
        let dd = pairwise_row_distances(&xx);
        let sil = silhouette_widths(&dd, &[0, 0, 1, 1]);
        assert!(sil.iter().all(|&s| s > 0.9));
        let sil = silhouette_widths(&dd, &[0, 1, 0, 1]);
        assert!(sil.iter().all(|&s| s < 0.0));
    }
}
