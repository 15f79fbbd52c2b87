//! K-means clustering traits for matrices
//!
//! Lloyd's algorithm with a seeded k-means++ initialization, so the
//! same seed always yields the same partition.

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Arguments for k-means clustering
#[derive(Debug, Clone)]
pub struct KmeansArgs {
    /// Number of clusters
    pub num_clusters: usize,
    /// Maximum number of iterations
    pub max_iter: usize,
    /// Random seed for the k-means++ initialization
    pub seed: u64,
}

impl Default for KmeansArgs {
    fn default() -> Self {
        Self {
            num_clusters: 1,
            max_iter: 100,
            seed: 42,
        }
    }
}

/// K-means output
#[derive(Debug, Clone)]
pub struct KmeansOut {
    /// Cluster assignment, one per point
    pub membership: Vec<usize>,
    /// Cluster centroids (k x d)
    pub centroids: DMatrix<f32>,
    /// Number of Lloyd iterations until the assignment stopped changing
    pub num_iter: usize,
}

/// Trait for k-means clustering on matrices
pub trait Kmeans {
    /// Cluster rows with a k-means++ initialization
    ///
    /// # Arguments
    /// * `args` - Clustering parameters
    fn kmeans_rows(&self, args: KmeansArgs) -> KmeansOut;

    /// Cluster rows starting from the given centroids (k x d)
    ///
    /// # Arguments
    /// * `init_centroids` - initial centroids
    /// * `max_iter` - maximum number of Lloyd iterations
    fn kmeans_rows_from(&self, init_centroids: DMatrix<f32>, max_iter: usize) -> KmeansOut;
}

fn squared_distance(xx: &DMatrix<f32>, i: usize, cc: &DMatrix<f32>, k: usize) -> f32 {
    xx.row(i)
        .iter()
        .zip(cc.row(k).iter())
        .map(|(&a, &b)| (a - b) * (a - b))
        .sum()
}

/// index of the nearest centroid (ties go to the smaller index)
fn nearest_centroid(xx: &DMatrix<f32>, i: usize, cc: &DMatrix<f32>) -> usize {
    let mut best = 0;
    let mut best_d = f32::INFINITY;
    for k in 0..cc.nrows() {
        let d = squared_distance(xx, i, cc, k);
        if d < best_d {
            best = k;
            best_d = d;
        }
    }
    best
}

fn kmeanspp_init(xx: &DMatrix<f32>, kk: usize, seed: u64) -> DMatrix<f32> {
    let nn = xx.nrows();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut chosen = vec![rng.random_range(0..nn)];

    let mut dist = vec![f32::INFINITY; nn];
    while chosen.len() < kk {
        let last = *chosen.last().unwrap_or(&0);
        for (i, d_i) in dist.iter_mut().enumerate() {
            let d = xx
                .row(i)
                .iter()
                .zip(xx.row(last).iter())
                .map(|(&a, &b)| (a - b) * (a - b))
                .sum::<f32>();
            *d_i = d_i.min(d);
        }

        let total: f32 = dist.iter().sum();
        let next = if total > 0.0 {
            let mut u = rng.random::<f32>() * total;
            let mut pick = nn - 1;
            for (i, &d_i) in dist.iter().enumerate() {
                if u < d_i {
                    pick = i;
                    break;
                }
                u -= d_i;
            }
            pick
        } else {
            // every point coincides with a centroid
            (0..nn).find(|i| !chosen.contains(i)).unwrap_or(0)
        };
        chosen.push(next);
    }

    let mut cc = DMatrix::<f32>::zeros(kk, xx.ncols());
    for (k, &i) in chosen.iter().enumerate() {
        cc.row_mut(k).copy_from(&xx.row(i));
    }
    cc
}

fn lloyd(xx: &DMatrix<f32>, mut cc: DMatrix<f32>, max_iter: usize) -> KmeansOut {
    let nn = xx.nrows();
    let kk = cc.nrows();
    let mut membership = vec![usize::MAX; nn];
    let mut num_iter = 0;

    for _ in 0..max_iter.max(1) {
        num_iter += 1;
        let new_membership: Vec<usize> = (0..nn)
            .into_par_iter()
            .map(|i| nearest_centroid(xx, i, &cc))
            .collect();

        let changed = new_membership != membership;
        membership = new_membership;
        if !changed {
            break;
        }

        let mut sums = DMatrix::<f32>::zeros(kk, xx.ncols());
        let mut counts = vec![0_usize; kk];
        for (i, &k) in membership.iter().enumerate() {
            let mut s_k = sums.row_mut(k);
            s_k += xx.row(i);
            counts[k] += 1;
        }

        // an empty cluster keeps its previous centroid
        for k in 0..kk {
            if counts[k] > 0 {
                let c_k = sums.row(k) / (counts[k] as f32);
                cc.row_mut(k).copy_from(&c_k);
            }
        }
    }

    log::debug!("k-means: {} iterations, {} clusters", num_iter, kk);

    KmeansOut {
        membership,
        centroids: cc,
        num_iter,
    }
}

impl Kmeans for DMatrix<f32> {
    fn kmeans_rows(&self, args: KmeansArgs) -> KmeansOut {
        let nn = self.nrows();
        if args.num_clusters <= 1 || nn == 0 {
            let mut centroids = DMatrix::<f32>::zeros(1, self.ncols());
            if nn > 0 {
                centroids.row_mut(0).copy_from(&self.row_mean());
            }
            return KmeansOut {
                membership: vec![0; nn],
                centroids,
                num_iter: 0,
            };
        }

        let kk = args.num_clusters.min(nn);
        let init = kmeanspp_init(self, kk, args.seed);
        lloyd(self, init, args.max_iter)
    }

    fn kmeans_rows_from(&self, init_centroids: DMatrix<f32>, max_iter: usize) -> KmeansOut {
        debug_assert_eq!(init_centroids.ncols(), self.ncols());
        lloyd(self, init_centroids, max_iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clusters(num_clusters: usize) -> KmeansArgs {
        KmeansArgs {
            num_clusters,
            ..Default::default()
        }
    }

    #[test]
    fn test_kmeans_rows_single_cluster() {
        let mat = DMatrix::<f32>::from_row_slice(4, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        let out = mat.kmeans_rows(clusters(1));

        assert_eq!(out.membership, vec![0; 4]);
        assert!((out.centroids[(0, 0)] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_kmeans_rows_two_clusters() {
        let mat = DMatrix::<f32>::from_row_slice(
            6,
            2,
            &[0.0, 0.0, 0.1, 0.1, 0.2, 0.0, 10.0, 10.0, 10.1, 10.1, 10.2, 10.2],
        );

        let membership = mat.kmeans_rows(clusters(2)).membership;

        assert_eq!(membership[0], membership[1]);
        assert_eq!(membership[1], membership[2]);
        assert_eq!(membership[3], membership[4]);
        assert_eq!(membership[4], membership[5]);
        assert_ne!(membership[0], membership[3]);
    }

    #[test]
    fn test_kmeans_rows_is_seeded() {
        let mat = DMatrix::<f32>::from_row_slice(
            6,
            2,
            &[
                0.0, 0.0, 0.1, 0.1, 5.0, 5.0, 5.1, 5.1, 10.0, 0.0, 10.1, 0.1,
            ],
        );

        let args = KmeansArgs {
            num_clusters: 3,
            max_iter: 50,
            seed: 11,
        };
        let a = mat.kmeans_rows(args.clone());
        let b = mat.kmeans_rows(args);

        assert_eq!(a.membership, b.membership);
        let mut sizes = vec![0; 3];
        a.membership.iter().for_each(|&k| sizes[k] += 1);
        assert_eq!(sizes, vec![2, 2, 2]);
    }

    #[test]
    fn test_kmeans_rows_from_given_centroids() {
        let mat = DMatrix::<f32>::from_row_slice(4, 1, &[0.0, 0.2, 9.8, 10.0]);
        let init = DMatrix::<f32>::from_row_slice(2, 1, &[10.0, 0.0]);
        let out = mat.kmeans_rows_from(init, 10);
        assert_eq!(out.membership, vec![1, 1, 0, 0]);
        assert!((out.centroids[(1, 0)] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_kmeans_empty_matrix() {
        let mat: DMatrix<f32> = DMatrix::zeros(0, 0);

        let membership = mat.kmeans_rows(clusters(2)).membership;
        assert!(membership.is_empty());
    }
}
