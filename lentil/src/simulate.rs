use crate::common::*;
use crate::input::ExpressionMatrix;
use indicatif::ParallelProgressIterator;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson, Uniform};
use rayon::prelude::*;

pub struct SimArgs {
    pub cells: usize,
    pub genes: usize,
    pub factors: usize,
    /// expected number of counts per cell
    pub depth: usize,
    pub overdisp: f32,
    /// proportion of each cell's expression owned by its program
    pub pve_topic: f32,
    pub seed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            cells: 500,
            genes: 200,
            factors: 5,
            depth: 2000,
            overdisp: 1.0,
            pve_topic: 0.9,
            seed: 42,
        }
    }
}

pub struct SimOut {
    pub counts: ExpressionMatrix,
    /// cells x factors, rows sum to one
    pub usage: Mat,
    /// factors x genes, rows sum to one
    pub spectra: Mat,
    /// dominant program of each cell
    pub membership: Vec<usize>,
}

/// Sample counts from a factored Poisson model
///
/// ```text
/// Y(i,j) ~ Poisson( depth * sum_k usage(i,k) * spectra(k,j) )
/// ```
///
/// Each cell belongs to one program with weight `pve_topic`; the rest
/// is spread evenly over the other programs.
pub fn simulate_factored_poisson(args: &SimArgs) -> anyhow::Result<SimOut> {
    let (nn, mm, kk) = (args.cells, args.genes, args.factors);
    if kk == 0 || nn == 0 || mm == 0 {
        anyhow::bail!("need at least one cell, gene and factor");
    }
    let overdisp = args.overdisp.max(1e-2);
    let pve_topic = args.pve_topic.clamp(0., 1.);

    let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed);

    let (a, b) = (1. / overdisp, (kk as f32).sqrt() * overdisp);
    let mut spectra = Mat::rgamma(kk, mm, (a, b), &mut rng)?;
    spectra.sum_to_one_rows_inplace();

    let runif = Uniform::new(0, kk)?;
    let membership: Vec<usize> = (0..nn).map(|_| runif.sample(&mut rng)).collect();

    let p_background = if kk > 1 {
        (1. - pve_topic) / (kk - 1) as f32
    } else {
        0.
    };
    let usage = Mat::from_fn(nn, kk, |i, k| {
        if membership[i] == k {
            if kk > 1 {
                pve_topic
            } else {
                1.
            }
        } else {
            p_background
        }
    });

    let lambda = &usage * &spectra * (args.depth as f32);
    let eps = 1e-8;

    let triplets: Vec<(usize, usize, f32)> = (0..nn)
        .into_par_iter()
        .progress_count(nn as u64)
        .map(|i| -> anyhow::Result<Vec<(usize, usize, f32)>> {
            let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed.wrapping_add(1 + i as u64));
            let mut ret = vec![];
            for j in 0..mm {
                let y_ij: f32 = Poisson::new(lambda[(i, j)].max(eps))?.sample(&mut rng);
                if y_ij > 0.5 {
                    ret.push((i, j, y_ij));
                }
            }
            Ok(ret)
        })
        .collect::<anyhow::Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();

    info!(
        "sampled Poisson data with {} non-zero elements",
        triplets.len()
    );

    let cells = (0..nn).map(|i| format!("cell_{}", i).into_boxed_str()).collect();
    let genes = (0..mm).map(|j| format!("gene_{}", j).into_boxed_str()).collect();

    Ok(SimOut {
        counts: ExpressionMatrix::from_triplets(&triplets, cells, genes)?,
        usage,
        spectra,
        membership,
    })
}
