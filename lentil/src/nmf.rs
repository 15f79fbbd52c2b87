//! Non-negative matrix factorization by multiplicative updates
//!
//! `X (n x m) ≈ W (n x K) · H (K x m)` under either the Frobenius or
//! the generalized Kullback-Leibler loss. Besides the full fit there
//! are two refits that keep one factor fixed: usage for given
//! spectra, and spectra (against a sparse matrix) for given usage.
//!
//! Convergence is checked every ten iterations: we stop once
//! `(previous error - current error) / initial error < tol`.

use crate::common::*;
use crate::planner::{BetaLoss, NmfConfig};
use matrix_util::sparse_util::dense_t_mul_sparse;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

const EPS: f32 = 1e-10;
const CHECK_EVERY: usize = 10;

pub struct NmfFit {
    pub usage: Mat,
    pub spectra: Mat,
    pub error: f32,
    pub n_iter: usize,
    pub converged: bool,
}

struct Convergence {
    tol: f64,
    err_init: f64,
    err_prev: f64,
}

impl Convergence {
    fn new(err_init: f32, tol: f32) -> Self {
        Self {
            tol: tol as f64,
            err_init: err_init as f64,
            err_prev: err_init as f64,
        }
    }

    /// nothing left to improve
    fn is_exact(&self) -> bool {
        self.err_init <= 0.0
    }

    fn check(&mut self, err: f32) -> bool {
        let err = err as f64;
        let done = (self.err_prev - err) / self.err_init < self.tol;
        self.err_prev = err;
        done
    }
}

/// Factorize `xx` from a random start drawn with `seed`
///
/// The same `(xx, rank, seed, config)` always gives the same result.
pub fn fit(xx: &Mat, rank: usize, seed: u64, config: &NmfConfig) -> anyhow::Result<NmfFit> {
    let (nn, mm) = xx.shape();
    if rank == 0 || rank > nn.min(mm) {
        anyhow::bail!("can't factorize {} x {} with K={}", nn, mm, rank);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let avg = (xx.mean().max(0.) / rank as f32).sqrt();
    let mut ww = Mat::rnorm(nn, rank, &mut rng).map(|x| avg * x.abs());
    let mut hh = Mat::rnorm(rank, mm, &mut rng).map(|x| avg * x.abs());

    let loss = config.beta_loss;
    let mut conv = Convergence::new(reconstruction_error(xx, &ww, &hh, loss), config.tol);
    let mut converged = conv.is_exact();
    let mut n_iter = 0;

    while !converged && n_iter < config.max_iter {
        n_iter += 1;
        update_usage(xx, &mut ww, &hh, loss);
        update_spectra(xx, &ww, &mut hh, loss);
        if n_iter % CHECK_EVERY == 0 {
            converged = conv.check(reconstruction_error(xx, &ww, &hh, loss));
        }
    }

    Ok(NmfFit {
        error: reconstruction_error(xx, &ww, &hh, loss),
        usage: ww,
        spectra: hh,
        n_iter,
        converged,
    })
}

/// Usage (n x K) that best explains `xx` with `spectra` (K x m) held
/// fixed. Starts from the constant `sqrt(mean(xx) / K)`.
pub fn refit_usage(xx: &Mat, spectra: &Mat, config: &NmfConfig) -> anyhow::Result<Mat> {
    if spectra.ncols() != xx.ncols() {
        anyhow::bail!(
            "spectra over {} genes vs data over {} genes",
            spectra.ncols(),
            xx.ncols()
        );
    }
    let kk = spectra.nrows();
    let avg = (xx.mean().max(0.) / kk as f32).sqrt();
    let mut ww = Mat::from_element(xx.nrows(), kk, avg);

    let loss = config.beta_loss;
    let mut conv = Convergence::new(reconstruction_error(xx, &ww, spectra, loss), config.tol);
    let mut converged = conv.is_exact();
    let mut n_iter = 0;

    while !converged && n_iter < config.max_iter {
        n_iter += 1;
        update_usage(xx, &mut ww, spectra, loss);
        if n_iter % CHECK_EVERY == 0 {
            converged = conv.check(reconstruction_error(xx, &ww, spectra, loss));
        }
    }
    debug!("usage refit: {} iterations, converged: {}", n_iter, converged);
    Ok(ww)
}

/// Spectra (K x m) that best explain a sparse `xx` (n x m) with
/// `usage` (n x K) held fixed. Never densifies `xx`.
pub fn refit_spectra(xx: &CscMat, usage: &Mat, config: &NmfConfig) -> anyhow::Result<Mat> {
    if usage.nrows() != xx.nrows() {
        anyhow::bail!(
            "usage over {} cells vs data over {} cells",
            usage.nrows(),
            xx.nrows()
        );
    }
    let kk = usage.ncols();
    let mm = xx.ncols();
    let ntot = (xx.nrows() * mm).max(1) as f64;
    let mean = xx.values().iter().map(|&x| x as f64).sum::<f64>() / ntot;
    let avg = (mean / kk as f64).sqrt() as f32;
    let mut hh = Mat::from_element(kk, mm, avg);

    let sparse_fit: Box<dyn SparseSpectraFit + '_> = match config.beta_loss {
        BetaLoss::Frobenius => Box::new(FrobeniusSpectra::new(xx, usage)?),
        BetaLoss::KullbackLeibler => Box::new(KlSpectra::new(xx, usage)),
    };

    let mut conv = Convergence::new(sparse_fit.error(&hh), config.tol);
    let mut converged = conv.is_exact();
    let mut n_iter = 0;

    while !converged && n_iter < config.max_iter {
        n_iter += 1;
        sparse_fit.update(&mut hh);
        if n_iter % CHECK_EVERY == 0 {
            converged = conv.check(sparse_fit.error(&hh));
        }
    }
    debug!("spectra refit: {} iterations, converged: {}", n_iter, converged);
    Ok(hh)
}

/// Frobenius norm `||X - W H||` or the generalized KL divergence
/// `D(X || W H)`
pub fn reconstruction_error(xx: &Mat, ww: &Mat, hh: &Mat, loss: BetaLoss) -> f32 {
    let wh = ww * hh;
    match loss {
        BetaLoss::Frobenius => xx
            .iter()
            .zip(wh.iter())
            .map(|(&x, &y)| {
                let d = (x - y) as f64;
                d * d
            })
            .sum::<f64>()
            .sqrt() as f32,
        BetaLoss::KullbackLeibler => xx
            .iter()
            .zip(wh.iter())
            .map(|(&x, &y)| kl_term(x, y))
            .sum::<f64>() as f32,
    }
}

/// `x log(x/y) - x + y`
fn kl_term(x: f32, y: f32) -> f64 {
    let y = y.max(EPS) as f64;
    if x > 0.0 {
        let x = x as f64;
        x * (x / y).ln() - x + y
    } else {
        y
    }
}

fn multiply_ratio(target: &mut Mat, numer: &Mat, denom: &Mat) {
    for ((t, &n), &d) in target.iter_mut().zip(numer.iter()).zip(denom.iter()) {
        *t *= n / (d + EPS);
    }
}

fn update_usage(xx: &Mat, ww: &mut Mat, hh: &Mat, loss: BetaLoss) {
    match loss {
        BetaLoss::Frobenius => {
            let numer = xx * hh.transpose();
            let denom = &*ww * (hh * hh.transpose());
            multiply_ratio(ww, &numer, &denom);
        }
        BetaLoss::KullbackLeibler => {
            let ratio = kl_ratio(xx, ww, hh);
            let numer = ratio * hh.transpose();
            let h_sums: Vec<f32> = hh.row_iter().map(|h_k| h_k.sum()).collect();
            for (k, mut w_k) in ww.column_iter_mut().enumerate() {
                let n_k = numer.column(k);
                let d_k = h_sums[k] + EPS;
                w_k.iter_mut().zip(n_k.iter()).for_each(|(w, &n)| *w *= n / d_k);
            }
        }
    }
}

fn update_spectra(xx: &Mat, ww: &Mat, hh: &mut Mat, loss: BetaLoss) {
    match loss {
        BetaLoss::Frobenius => {
            let numer = ww.transpose() * xx;
            let denom = (ww.transpose() * ww) * &*hh;
            multiply_ratio(hh, &numer, &denom);
        }
        BetaLoss::KullbackLeibler => {
            let ratio = kl_ratio(xx, ww, hh);
            let numer = ww.transpose() * ratio;
            let w_sums: Vec<f32> = ww.column_iter().map(|w_k| w_k.sum()).collect();
            for (j, mut h_j) in hh.column_iter_mut().enumerate() {
                let n_j = numer.column(j);
                h_j.iter_mut()
                    .zip(n_j.iter())
                    .zip(w_sums.iter())
                    .for_each(|((h, &n), &s)| *h *= n / (s + EPS));
            }
        }
    }
}

/// `X / (W H)`, elementwise
fn kl_ratio(xx: &Mat, ww: &Mat, hh: &Mat) -> Mat {
    let mut wh = ww * hh;
    wh.iter_mut()
        .zip(xx.iter())
        .for_each(|(y, &x)| *y = x / (*y + EPS));
    wh
}

/// One multiplicative update of the spectra against a sparse matrix
trait SparseSpectraFit {
    fn update(&self, hh: &mut Mat);
    fn error(&self, hh: &Mat) -> f32;
}

/// Only `W'X` (K x m) and `W'W` (K x K) are needed:
/// `||X - WH||² = ||X||² - 2 <H, W'X> + <H, W'W H>`
struct FrobeniusSpectra {
    wtx: Mat,
    wtw: Mat,
    x_sq: f64,
}

impl FrobeniusSpectra {
    fn new(xx: &CscMat, ww: &Mat) -> anyhow::Result<Self> {
        Ok(Self {
            wtx: dense_t_mul_sparse(ww, xx)?,
            wtw: ww.transpose() * ww,
            x_sq: xx.values().iter().map(|&x| (x as f64) * (x as f64)).sum(),
        })
    }
}

impl SparseSpectraFit for FrobeniusSpectra {
    fn update(&self, hh: &mut Mat) {
        let denom = &self.wtw * &*hh;
        multiply_ratio(hh, &self.wtx, &denom);
    }

    fn error(&self, hh: &Mat) -> f32 {
        let inner = |a: &Mat, b: &Mat| -> f64 {
            a.iter()
                .zip(b.iter())
                .map(|(&x, &y)| x as f64 * y as f64)
                .sum()
        };
        let cross = inner(hh, &self.wtx);
        let quad = inner(hh, &(&self.wtw * hh));
        (self.x_sq - 2.0 * cross + quad).max(0.0).sqrt() as f32
    }
}

/// Visits only the non-zero entries of `X`
struct KlSpectra<'a> {
    xx: &'a CscMat,
    ww: &'a Mat,
    w_sums: Vec<f32>,
}

impl<'a> KlSpectra<'a> {
    fn new(xx: &'a CscMat, ww: &'a Mat) -> Self {
        let w_sums = ww.column_iter().map(|w_k| w_k.sum()).collect();
        Self { xx, ww, w_sums }
    }

    fn predict(&self, i: usize, h_j: &[f32]) -> f32 {
        self.ww
            .row(i)
            .iter()
            .zip(h_j)
            .map(|(&w, &h)| w * h)
            .sum()
    }
}

impl SparseSpectraFit for KlSpectra<'_> {
    fn update(&self, hh: &mut Mat) {
        let kk = hh.nrows();
        let columns: Vec<Vec<f32>> = (0..self.xx.ncols())
            .into_par_iter()
            .map(|j| {
                let h_j: Vec<f32> = hh.column(j).iter().copied().collect();
                let x_j = self.xx.col(j);
                let mut numer = vec![0_f32; kk];
                for (&i, &x) in x_j.row_indices().iter().zip(x_j.values()) {
                    let r = x / (self.predict(i, &h_j) + EPS);
                    for (k, n) in numer.iter_mut().enumerate() {
                        *n += self.ww[(i, k)] * r;
                    }
                }
                h_j.iter()
                    .zip(numer.iter().zip(self.w_sums.iter()))
                    .map(|(&h, (&n, &s))| h * n / (s + EPS))
                    .collect()
            })
            .collect();
        *hh = Mat::from_iterator(kk, self.xx.ncols(), columns.into_iter().flatten());
    }

    fn error(&self, hh: &Mat) -> f32 {
        let observed: f64 = (0..self.xx.ncols())
            .into_par_iter()
            .map(|j| {
                let h_j: Vec<f32> = hh.column(j).iter().copied().collect();
                let x_j = self.xx.col(j);
                x_j.row_indices()
                    .iter()
                    .zip(x_j.values())
                    .filter(|(_, &x)| x > 0.0)
                    .map(|(&i, &x)| {
                        let y = self.predict(i, &h_j).max(EPS) as f64;
                        let x = x as f64;
                        x * (x / y).ln() - x
                    })
                    .sum::<f64>()
            })
            .sum();
        let total: f64 = hh
            .row_iter()
            .zip(self.w_sums.iter())
            .map(|(h_k, &s)| h_k.sum() as f64 * s as f64)
            .sum();
        (observed + total) as f32
    }
}
