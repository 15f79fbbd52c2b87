pub mod clustering;
pub mod common_io;
pub mod dmatrix_dist;
pub mod dmatrix_io;
pub mod dmatrix_util;
pub mod mtx_io;
pub mod sparse_util;
pub mod traits;
pub mod utils;
