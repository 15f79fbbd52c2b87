//! Load a count matrix and turn it into what the factorization
//! stages consume: TPM over all genes, a set of over-dispersed genes,
//! and the variance-normalized counts of those genes.

use crate::common::*;
use fnv::{FnvHashMap as HashMap, FnvHasher};
use matrix_util::common_io::{file_ext, read_names, write_lines_atomic};
use matrix_util::dmatrix_util::median_f32;
use matrix_util::mtx_io::{read_mtx_triplets, write_mtx_triplets};
use matrix_util::sparse_util::{column_mean_var, row_sums, select_columns_dense};
use std::hash::Hasher;

/// TPM rows sum to this
pub const TPM_SCALE: f32 = 1e6;

/// Number of top-expressed genes used to anchor the dispersion baseline
const NUM_ANCHOR_GENES: usize = 20;

/// Non-negative cells x genes matrix with names on both axes
#[derive(Clone, Debug)]
pub struct ExpressionMatrix {
    pub counts: CscMat,
    pub cells: Vec<Box<str>>,
    pub genes: Vec<Box<str>>,
}

fn mismatch(msg: String) -> anyhow::Error {
    CnmfError::FormatMismatch(msg).into()
}

impl ExpressionMatrix {
    pub fn new(
        counts: CscMat,
        cells: Vec<Box<str>>,
        genes: Vec<Box<str>>,
    ) -> anyhow::Result<Self> {
        if counts.nrows() != cells.len() || counts.ncols() != genes.len() {
            return Err(mismatch(format!(
                "{} x {} matrix with {} cell names and {} gene names",
                counts.nrows(),
                counts.ncols(),
                cells.len(),
                genes.len()
            )));
        }
        if counts.nrows() == 0 || counts.ncols() == 0 {
            return Err(mismatch("empty matrix".into()));
        }
        if let Some(x) = counts
            .values()
            .iter()
            .find(|&&x| !x.is_finite() || x < 0.0)
        {
            return Err(mismatch(format!("found a negative or non-finite value: {}", x)));
        }
        Ok(Self {
            counts,
            cells,
            genes,
        })
    }

    pub fn from_triplets(
        triplets: &[(usize, usize, f32)],
        cells: Vec<Box<str>>,
        genes: Vec<Box<str>>,
    ) -> anyhow::Result<Self> {
        let counts = CscMat::from_nonzero_triplets(cells.len(), genes.len(), triplets)
            .map_err(|e| mismatch(e.to_string()))?;
        Self::new(counts, cells, genes)
    }

    /// Read a MatrixMarket file with one name per line in `rows_file`
    /// and `cols_file`. The matrix is cells x genes unless
    /// `genes_by_cells` says otherwise (the 10x layout).
    pub fn from_mtx(
        mtx_file: &str,
        rows_file: &str,
        cols_file: &str,
        genes_by_cells: bool,
    ) -> anyhow::Result<Self> {
        let (triplets, (nrow, ncol, _)) =
            read_mtx_triplets(mtx_file).map_err(|e| mismatch(e.to_string()))?;
        let rows = read_names(rows_file).map_err(|e| mismatch(e.to_string()))?;
        let cols = read_names(cols_file).map_err(|e| mismatch(e.to_string()))?;

        if rows.len() != nrow || cols.len() != ncol {
            return Err(mismatch(format!(
                "{} is {} x {}, but {} has {} names and {} has {} names",
                mtx_file,
                nrow,
                ncol,
                rows_file,
                rows.len(),
                cols_file,
                cols.len()
            )));
        }

        if genes_by_cells {
            let triplets: Vec<_> = triplets.into_iter().map(|(i, j, x)| (j, i, x)).collect();
            Self::from_triplets(&triplets, cols, rows)
        } else {
            Self::from_triplets(&triplets, rows, cols)
        }
    }

    /// Read a dense tab-separated table: gene names on the first line,
    /// a cell name leading every other line
    pub fn from_tsv(tsv_file: &str) -> anyhow::Result<Self> {
        let MatWithNames { rows, cols, mat } =
            Mat::read_data_with_names(tsv_file, "\t").map_err(|e| mismatch(e.to_string()))?;
        Self::from_triplets(&mat.to_nonzero_triplets(), rows, cols)
    }

    /// Pick the reader by file extension (`.gz` is looked through)
    pub fn from_file(
        data_file: &str,
        rows_file: Option<&str>,
        cols_file: Option<&str>,
        genes_by_cells: bool,
    ) -> anyhow::Result<Self> {
        match file_ext(data_file)?.as_ref() {
            "mtx" => match (rows_file, cols_file) {
                (Some(r), Some(c)) => Self::from_mtx(data_file, r, c, genes_by_cells),
                _ => anyhow::bail!("{} needs both row and column name files", data_file),
            },
            "tsv" | "txt" => {
                let ret = Self::from_tsv(data_file)?;
                if genes_by_cells {
                    Ok(ret.transpose())
                } else {
                    Ok(ret)
                }
            }
            ext => anyhow::bail!("unsupported input format: .{}", ext),
        }
    }

    pub fn transpose(&self) -> Self {
        Self {
            counts: self.counts.transpose(),
            cells: self.genes.clone(),
            genes: self.cells.clone(),
        }
    }

    pub fn num_cells(&self) -> usize {
        self.counts.nrows()
    }

    pub fn num_genes(&self) -> usize {
        self.counts.ncols()
    }

    pub fn to_mtx(&self, mtx_file: &str, rows_file: &str, cols_file: &str) -> anyhow::Result<()> {
        write_mtx_triplets(
            &self.counts.to_nonzero_triplets(),
            self.num_cells(),
            self.num_genes(),
            mtx_file,
        )?;
        write_lines_atomic(&self.cells, rows_file)?;
        write_lines_atomic(&self.genes, cols_file)
    }

    /// Scale every cell to [`TPM_SCALE`] total counts
    pub fn tpm(&self) -> anyhow::Result<Self> {
        let totals = row_sums(&self.counts);
        if let Some(i) = totals.iter().position(|&s| s <= 0.0) {
            return Err(CnmfError::DegenerateInput(format!(
                "cell {} has no counts",
                self.cells[i]
            ))
            .into());
        }
        let triplets: Vec<_> = self
            .counts
            .to_nonzero_triplets()
            .into_iter()
            .map(|(i, j, x)| (i, j, x * TPM_SCALE / totals[i]))
            .collect();
        Self::from_triplets(&triplets, self.cells.clone(), self.genes.clone())
    }
}

/// How to go from raw counts to the matrix being factorized
#[derive(Clone, Debug, Default)]
pub struct NormalizeArgs {
    /// keep this many over-dispersed genes
    pub num_highvar_genes: Option<usize>,
    /// or exactly these genes (takes precedence)
    pub genes: Option<Vec<Box<str>>>,
    /// `ln(1 + x)` before scaling
    pub log_transform: bool,
}

/// Dense cells x genes matrix of variance-normalized counts
#[derive(Clone, Debug)]
pub struct NormalizedMatrix {
    pub data: Mat,
    pub cells: Vec<Box<str>>,
    pub genes: Vec<Box<str>>,
}

impl NormalizedMatrix {
    /// Hash of the names and the exact values
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        for name in self.cells.iter().chain(self.genes.iter()) {
            hasher.write(name.as_bytes());
            hasher.write_u8(0);
        }
        for x in self.data.iter() {
            hasher.write_u32(x.to_bits());
        }
        hasher.finish()
    }
}

pub struct PreparedInput {
    pub norm: NormalizedMatrix,
    pub tpm: ExpressionMatrix,
    pub tpm_mean: Vec<f32>,
    pub tpm_std: Vec<f32>,
}

pub fn prepare_input(raw: &ExpressionMatrix, args: &NormalizeArgs) -> anyhow::Result<PreparedInput> {
    let tpm = raw.tpm()?;
    let (tpm_mean, tpm_var) = column_mean_var(&tpm.counts, 1);
    let tpm_std = tpm_var.iter().map(|v| v.sqrt()).collect();

    let selected = match (&args.genes, args.num_highvar_genes) {
        (Some(names), n) => {
            if n.is_some() {
                warn!("using the given gene list; ignoring the number of highly variable genes");
            }
            resolve_gene_names(&raw.genes, names)?
        }
        (None, Some(n)) => select_overdispersed_genes(&tpm.counts, n),
        (None, None) => (0..raw.num_genes()).collect(),
    };
    info!(
        "selected {} of {} genes for factorization",
        selected.len(),
        raw.num_genes()
    );

    let norm = normalize_counts(raw, &selected, args.log_transform)?;

    Ok(PreparedInput {
        norm,
        tpm,
        tpm_mean,
        tpm_std,
    })
}

fn resolve_gene_names(all_genes: &[Box<str>], wanted: &[Box<str>]) -> anyhow::Result<Vec<usize>> {
    let position: HashMap<&str, usize> = all_genes
        .iter()
        .enumerate()
        .map(|(j, g)| (&**g, j))
        .collect();

    let mut missing = 0;
    let mut selected: Vec<usize> = wanted
        .iter()
        .filter_map(|g| {
            let j = position.get(&**g).copied();
            if j.is_none() {
                missing += 1;
            }
            j
        })
        .collect();
    selected.sort_unstable();
    selected.dedup();

    if missing > 0 {
        warn!("{} of {} requested genes are not in the data", missing, wanted.len());
    }
    if selected.is_empty() {
        return Err(CnmfError::DegenerateInput("none of the requested genes are present".into()).into());
    }
    Ok(selected)
}

/// `q`-quantile of sorted values with linear interpolation
fn quantile(sorted: &[f32], q: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f32;
    let lb = pos.floor() as usize;
    let ub = pos.ceil() as usize;
    sorted[lb] + (sorted[ub] - sorted[lb]) * (pos - lb as f32)
}

/// Rank genes by how much their Fano factor exceeds a mean-dependent
/// baseline `a² μ + b²` and keep the top `num_genes`, in column order.
///
/// `a` is the smallest coefficient of variation among the most highly
/// expressed genes. `b²` is the median Fano factor of genes whose mean
/// and Fano factor both fall within the 10-90% quantile box.
/// Unexpressed genes are never selected.
pub fn select_overdispersed_genes(tpm: &CscMat, num_genes: usize) -> Vec<usize> {
    let (mean, var) = column_mean_var(tpm, 1);
    let expressed: Vec<usize> = (0..tpm.ncols()).filter(|&j| mean[j] > 0.0).collect();
    if expressed.is_empty() {
        return vec![];
    }
    let fano: Vec<f32> = (0..tpm.ncols())
        .map(|j| if mean[j] > 0.0 { var[j] / mean[j] } else { 0.0 })
        .collect();

    let mut by_mean = expressed.clone();
    by_mean.sort_by(|&a, &b| mean[b].total_cmp(&mean[a]).then(a.cmp(&b)));
    let cv_min = by_mean
        .iter()
        .take(NUM_ANCHOR_GENES)
        .map(|&j| var[j].sqrt() / mean[j])
        .fold(f32::INFINITY, f32::min);

    let sorted_of = |v: &[f32]| {
        let mut s: Vec<f32> = expressed.iter().map(|&j| v[j]).collect();
        s.sort_by(|a, b| a.total_cmp(b));
        s
    };
    let (means, fanos) = (sorted_of(&mean), sorted_of(&fano));
    let (m_lo, m_hi) = (quantile(&means, 0.1), quantile(&means, 0.9));
    let (f_lo, f_hi) = (quantile(&fanos, 0.1), quantile(&fanos, 0.9));

    let boxed: Vec<f32> = expressed
        .iter()
        .filter(|&&j| fano[j] > f_lo && fano[j] < f_hi && mean[j] > m_lo && mean[j] < m_hi)
        .map(|&j| fano[j])
        .collect();
    let fano_median = if boxed.is_empty() {
        median_f32(&fanos)
    } else {
        median_f32(&boxed)
    };

    let ratio = |j: usize| {
        let expected = cv_min * cv_min * mean[j] + fano_median;
        if expected > 0.0 {
            fano[j] / expected
        } else {
            0.0
        }
    };

    let mut ranked = expressed;
    ranked.sort_by(|&a, &b| ratio(b).total_cmp(&ratio(a)).then(a.cmp(&b)));
    ranked.truncate(num_genes);
    ranked.sort_unstable();
    ranked
}

/// Raw counts of the `genes` columns, optionally `ln(1 + x)`
/// transformed, each divided by its standard deviation (not
/// centered). Genes without variance are dropped.
pub fn normalize_counts(
    raw: &ExpressionMatrix,
    genes: &[usize],
    log_transform: bool,
) -> anyhow::Result<NormalizedMatrix> {
    let mut data = select_columns_dense(&raw.counts, genes);
    if log_transform {
        data.apply(|x| *x = x.ln_1p());
    }

    let nn = data.nrows();
    let stds: Vec<f32> = data
        .column_iter()
        .map(|x_j| {
            if nn < 2 {
                return 0.0;
            }
            let mu = x_j.mean();
            let ss: f32 = x_j.iter().map(|&x| (x - mu) * (x - mu)).sum();
            (ss / (nn - 1) as f32).sqrt()
        })
        .collect();

    let kept: Vec<usize> = (0..genes.len()).filter(|&j| stds[j] > 0.0).collect();
    if kept.len() < genes.len() {
        warn!(
            "dropping {} genes with zero variance",
            genes.len() - kept.len()
        );
    }
    if kept.is_empty() {
        return Err(CnmfError::DegenerateInput("no gene has non-zero variance".into()).into());
    }

    let mut data = data.select_columns(kept.iter());
    for (mut x_j, &j) in data.column_iter_mut().zip(kept.iter()) {
        x_j /= stds[j];
    }

    let empty: Vec<usize> = data
        .row_iter()
        .enumerate()
        .filter(|(_, x_i)| x_i.sum() <= 0.0)
        .map(|(i, _)| i)
        .collect();
    if let Some(&i) = empty.first() {
        return Err(CnmfError::DegenerateInput(format!(
            "{} cells (e.g., {}) have zero counts in the selected genes; \
         filter them out or select more genes",
            empty.len(),
            raw.cells[i]
        ))
        .into());
    }

    Ok(NormalizedMatrix {
        data,
        cells: raw.cells.clone(),
        genes: kept.iter().map(|&j| raw.genes[genes[j]].clone()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn names(prefix: &str, n: usize) -> Vec<Box<str>> {
        (0..n).map(|i| format!("{}{}", prefix, i).into_boxed_str()).collect()
    }

    fn toy() -> anyhow::Result<ExpressionMatrix> {
        // 4 cells x 3 genes
        let dense = Mat::from_row_slice(
            4,
            3,
            &[1.0, 0.0, 3.0, 2.0, 2.0, 0.0, 0.0, 5.0, 5.0, 4.0, 1.0, 3.0],
        );
        ExpressionMatrix::from_triplets(&dense.to_nonzero_triplets(), names("c", 4), names("g", 3))
    }

    fn error_of(r: anyhow::Error) -> Option<CnmfError> {
        r.downcast_ref::<CnmfError>().cloned()
    }

    #[test]
    fn test_tpm_rows_sum_to_scale() -> anyhow::Result<()> {
        let tpm = toy()?.tpm()?;
        for s in row_sums(&tpm.counts) {
            assert_abs_diff_eq!(s, TPM_SCALE, epsilon = 1.0);
        }
        Ok(())
    }

    #[test]
    fn test_format_mismatch() {
        let bad_value = ExpressionMatrix::from_triplets(&[(0, 0, -1.0)], names("c", 1), names("g", 1));
        assert!(matches!(
            bad_value.err().and_then(error_of),
            Some(CnmfError::FormatMismatch(_))
        ));

        let bad_names = ExpressionMatrix::from_triplets(&[(0, 0, 1.0)], names("c", 1), names("g", 0));
        assert!(matches!(
            bad_names.err().and_then(error_of),
            Some(CnmfError::FormatMismatch(_))
        ));

        let nan = ExpressionMatrix::from_triplets(&[(0, 0, f32::NAN)], names("c", 1), names("g", 1));
        assert!(nan.is_err());
    }

    #[test]
    fn test_mtx_round_trip_genes_by_cells() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = |f: &str| dir.path().join(f).to_string_lossy().into_owned();
        let xx = toy()?;

        // write the transposed (genes x cells) layout
        xx.transpose().to_mtx(&path("x.mtx.gz"), &path("r.gz"), &path("c.gz"))?;
        let yy = ExpressionMatrix::from_file(&path("x.mtx.gz"), Some(&path("r.gz")), Some(&path("c.gz")), true)?;
        assert_eq!(yy.cells, xx.cells);
        assert_eq!(yy.genes, xx.genes);
        assert_eq!(yy.counts.to_nonzero_triplets(), xx.counts.to_nonzero_triplets());

        // names that don't fit the matrix
        let short = ExpressionMatrix::from_mtx(&path("x.mtx.gz"), &path("c.gz"), &path("c.gz"), false);
        assert!(matches!(
            short.err().and_then(error_of),
            Some(CnmfError::FormatMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_normalize_drops_constant_genes() -> anyhow::Result<()> {
        let dense = Mat::from_row_slice(3, 3, &[1.0, 2.0, 4.0, 1.0, 4.0, 0.0, 1.0, 0.0, 2.0]);
        let xx = ExpressionMatrix::from_triplets(&dense.to_nonzero_triplets(), names("c", 3), names("g", 3))?;
        let norm = normalize_counts(&xx, &[0, 1, 2], false)?;
        assert_eq!(norm.genes, names("g", 3)[1..].to_vec());
        // sample std of (2, 4, 0) is 2
        assert_abs_diff_eq!(norm.data[(1, 0)], 2.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_cells_without_selected_counts() -> anyhow::Result<()> {
        let xx = toy()?;
        // cell 2 has no counts in gene 0
        let err = normalize_counts(&xx, &[0], false).err();
        assert!(matches!(
            err.and_then(error_of),
            Some(CnmfError::DegenerateInput(_))
        ));
        Ok(())
    }

    #[test]
    fn test_overdispersed_gene_is_selected() -> anyhow::Result<()> {
        // 40 cells; gene 3 is bursty, the others are flat-ish
        let mut triplets = vec![];
        for i in 0..40 {
            for j in 0..3 {
                triplets.push((i, j, 10.0 + ((i + j) % 3) as f32));
            }
            if i % 10 == 0 {
                triplets.push((i, 3, 60.0));
            }
        }
        let xx = ExpressionMatrix::from_triplets(&triplets, names("c", 40), names("g", 4))?;
        let tpm = xx.tpm()?;
        assert_eq!(select_overdispersed_genes(&tpm.counts, 1), vec![3]);
        assert_eq!(select_overdispersed_genes(&tpm.counts, 10).len(), 4);
        Ok(())
    }

    #[test]
    fn test_prepare_with_gene_list() -> anyhow::Result<()> {
        let xx = toy()?;
        let args = NormalizeArgs {
            genes: Some(vec!["g2".into(), "g1".into(), "nope".into()]),
            ..Default::default()
        };
        let prepared = prepare_input(&xx, &args)?;
        assert_eq!(prepared.norm.genes, names("g", 3)[1..].to_vec());
        assert_eq!(prepared.tpm_mean.len(), 3);
        Ok(())
    }
}
