use approx::assert_abs_diff_eq;
use matrix_util::dmatrix_util::*;
use matrix_util::traits::{MatOps, SampleOps};
use rand::SeedableRng;

#[test]
fn dmatrix_row_normalization_test() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(3);
    let mut xx = DMatrix::<f32>::rnorm(100, 10, &mut rng);
    xx.normalize_rows_inplace();

    for i in 0..xx.nrows() {
        let norm = xx.row(i).norm();
        assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-5);
    }
}
