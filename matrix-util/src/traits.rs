use crate::common_io::Delimiter;
use rand::Rng;

/// A matrix with row and column names
pub struct MatWithNames<Mat> {
    pub rows: Vec<Box<str>>,
    pub cols: Vec<Box<str>>,
    pub mat: Mat,
}

/// Convert to and from the vector of triplets
pub trait MatTriplets {
    type Mat;
    type Scalar;

    /// Build a matrix from `(row, col, value)` triplets; duplicated
    /// entries are summed up
    fn from_nonzero_triplets(
        nrow: usize,
        ncol: usize,
        triplets: &[(usize, usize, Self::Scalar)],
    ) -> anyhow::Result<Self::Mat>;

    /// Non-zero `(row, col, value)` triplets in column-major order
    fn to_nonzero_triplets(&self) -> Vec<(usize, usize, Self::Scalar)>;
}

/// Normalize or scale rows and columns
pub trait MatOps {
    type Mat;
    type Scalar;

    /// Divide each row by its L2 norm (zero rows stay zero)
    fn normalize_rows_inplace(&mut self);
    fn normalize_rows(&self) -> Self::Mat;

    /// Divide each row by its sum (zero rows stay zero)
    fn sum_to_one_rows_inplace(&mut self);
    fn sum_to_one_rows(&self) -> Self::Mat;
}

/// Operations to sample random matrices with a caller-provided
/// random number generator, so the draws can be replayed from a seed
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm<R: Rng>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat;

    /// Sample a matrix from a gamma distribution with `param` is
    /// `(shape α, scale θ)`
    ///
    /// $$f(x|\alpha,\theta) = \frac{\theta^{-\alpha}}{\Gamma(\alpha)} x^{\alpha - 1} e^{-x/\theta}$$
    ///
    /// Note: `rate = 1/scale` or $\beta = 1/\theta$
    fn rgamma<R: Rng>(
        dd: usize,
        nn: usize,
        param: (f32, f32),
        rng: &mut R,
    ) -> anyhow::Result<Self::Mat>;
}

/// Read and write matrices from and to files
pub trait IoOps {
    type Scalar;
    type Mat;

    fn read_file_delim(
        file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat>;

    fn from_tsv(tsv_file: &str, skip: Option<usize>) -> anyhow::Result<Self::Mat> {
        Self::read_file_delim(tsv_file, "\t", skip)
    }

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()>;

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(tsv_file, "\t")
    }

    /// Read a labelled table: the first line holds column names
    /// (optionally preceded by an index header), the first field of
    /// every other line is a row name
    fn read_data_with_names(
        file: &str,
        delim: impl Into<Delimiter>,
    ) -> anyhow::Result<MatWithNames<Self::Mat>>;

    /// Write a labelled table with an empty index header, the layout
    /// `pandas.read_csv(sep="\t", index_col=0)` expects. The file is
    /// written atomically.
    fn write_data_with_names(
        &self,
        file: &str,
        row_names: &[Box<str>],
        column_names: &[Box<str>],
        delim: &str,
    ) -> anyhow::Result<()>;

    fn to_tsv_with_names(
        &self,
        tsv_file: &str,
        row_names: &[Box<str>],
        column_names: &[Box<str>],
    ) -> anyhow::Result<()> {
        self.write_data_with_names(tsv_file, row_names, column_names, "\t")
    }
}
