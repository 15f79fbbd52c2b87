use crate::common_io::*;
use rayon::prelude::*;
use std::io::Write;

/// Shape of a MatrixMarket coordinate file: `(nrow, ncol, nnz)`
pub type MtxShape = (usize, usize, usize);

/// Write the triplets into a MatrixMarket file with 1-based indices.
/// The file appears at `mtx_file` only after it is fully written.
/// * `triplets` - the triplets to write
/// * `nrow` - number of rows
/// * `ncol` - number of columns
/// * `mtx_file` - the output file (e.g., "matrix.mtx.gz")
pub fn write_mtx_triplets(
    triplets: &[(usize, usize, f32)],
    nrow: usize,
    ncol: usize,
    mtx_file: &str,
) -> anyhow::Result<()> {
    write_atomic(mtx_file, |buf| {
        // write the header
        let nnz = triplets.len();
        writeln!(buf, "%%MatrixMarket matrix coordinate real general")?;
        writeln!(buf, "{}\t{}\t{}", nrow, ncol, nnz)?;

        // write them with 1-based indices
        for (row, col, val) in triplets {
            writeln!(buf, "{}\t{}\t{}", row + 1, col + 1, val)?;
        }
        Ok(())
    })
}

/// Read a matrix market file and return a vector of 0-based triplets
/// `(row, col, val)` sorted by column, then row, together with the
/// header shape.
///
/// Every entry line must parse and fall inside the header shape.
///
/// * `mtx_file` - Path to the matrix market file
pub fn read_mtx_triplets(mtx_file: &str) -> anyhow::Result<(Vec<(usize, usize, f32)>, MtxShape)> {
    let WordTable {
        lines: mtx_data_lines,
        header: mtx_data_hdr,
    } = read_word_table(mtx_file, Delimiter::Whitespace, Some(0), Some('%'))?;

    if mtx_data_hdr.len() != 3 {
        return Err(anyhow::anyhow!(
            "failed to parse mtx header in {}: expected `nrow ncol nnz`",
            mtx_file
        ));
    }

    let nrow = mtx_data_hdr[0].parse::<usize>()?;
    let ncol = mtx_data_hdr[1].parse::<usize>()?;
    let nnz = mtx_data_hdr[2].parse::<usize>()?;

    // Convert a triplet of strings to a triplet of usize, usize, f32
    let parse_row_col_val = |(line, triplet): (usize, &Vec<Box<str>>)| -> anyhow::Result<(usize, usize, f32)> {
        if triplet.len() != 3 {
            anyhow::bail!("line {}: expected 3 fields, found {}", line + 2, triplet.len());
        }

        // f32 should be enough for most cases
        let val = triplet[2].parse::<f32>()?;

        let row = triplet[0].parse::<usize>()?;
        let col = triplet[1].parse::<usize>()?;

        if row == 0 || row > nrow || col == 0 || col > ncol {
            anyhow::bail!(
                "line {}: index ({}, {}) outside of {} x {}",
                line + 2,
                row,
                col,
                nrow,
                ncol
            );
        }

        // convert 1-based to 0-based
        Ok((row - 1, col - 1, val))
    };

    let mut mtx_triplets = mtx_data_lines
        .par_iter()
        .enumerate()
        .map(parse_row_col_val)
        .collect::<anyhow::Result<Vec<_>>>()?;

    if mtx_triplets.len() != nnz {
        anyhow::bail!(
            "{}: header declares {} entries, found {}",
            mtx_file,
            nnz,
            mtx_triplets.len()
        );
    }

    mtx_triplets.par_sort_by_key(|&(row, col, _)| (col, row));
    log::info!("read {} x {} matrix, {} non-zeros, from {}", nrow, ncol, nnz, mtx_file);
    Ok((mtx_triplets, (nrow, ncol, nnz)))
}
