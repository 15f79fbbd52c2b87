use crate::common_io::{read_word_table, write_lines_atomic, Delimiter};
use crate::traits::*;
pub use nalgebra::{DMatrix, DVector};

use std::fmt::{Debug, Display};
use std::str::FromStr;

fn parse_words<T>(words: &[Box<str>], file: &str, line: usize) -> anyhow::Result<Vec<T>>
where
    T: FromStr,
    <T as FromStr>::Err: Debug,
{
    words
        .iter()
        .map(|w| {
            w.parse::<T>().map_err(|e| {
                anyhow::anyhow!("{}:{}: failed to parse `{}`: {:?}", file, line, w, e)
            })
        })
        .collect()
}

impl<T> IoOps for DMatrix<T>
where
    T: nalgebra::Scalar + Send + FromStr + Display + Copy,
    <T as FromStr>::Err: Debug,
{
    type Scalar = T;
    type Mat = Self;

    fn read_file_delim(
        tsv_file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat> {
        let lines = read_word_table(tsv_file, delim, skip, None)?.lines;

        if lines.is_empty() {
            return Err(anyhow::anyhow!("No data in file {}", tsv_file));
        }

        let ncols = lines[0].len();
        let nrows = lines.len();

        let mut data = Vec::with_capacity(nrows * ncols);
        for (i, words) in lines.iter().enumerate() {
            if words.len() != ncols {
                anyhow::bail!(
                    "{}: line {} has {} fields, expected {}",
                    tsv_file,
                    i + 1,
                    words.len(),
                    ncols
                );
            }
            data.extend(parse_words::<T>(words, tsv_file, i + 1)?);
        }

        Ok(DMatrix::<T>::from_row_iterator(nrows, ncols, data))
    }

    fn write_file_delim(&self, tsv_file: &str, delim: &str) -> anyhow::Result<()> {
        // par_iter() or par_bridge() will
        // mess up the order of the rows
        let lines = self
            .row_iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", *x))
                    .collect::<Vec<String>>()
                    .join(delim)
                    .into_boxed_str()
            })
            .collect::<Vec<_>>();

        write_lines_atomic(&lines, tsv_file)
    }

    fn read_data_with_names(
        file: &str,
        delim: impl Into<Delimiter>,
    ) -> anyhow::Result<MatWithNames<Self::Mat>> {
        let out = read_word_table(file, delim, Some(0), None)?;

        let ncols = match out.lines.first() {
            Some(words) if !words.is_empty() => words.len() - 1,
            _ => anyhow::bail!("No data in file {}", file),
        };

        // either `[index_name] col_1 .. col_n` or `col_1 .. col_n`
        let cols: Vec<Box<str>> = if out.header.len() == ncols + 1 {
            out.header[1..].to_vec()
        } else if out.header.len() == ncols {
            out.header.clone()
        } else {
            anyhow::bail!(
                "{}: header has {} fields for {} data columns",
                file,
                out.header.len(),
                ncols
            );
        };

        let nrows = out.lines.len();
        let mut rows = Vec::with_capacity(nrows);
        let mut data = Vec::with_capacity(nrows * ncols);

        for (i, words) in out.lines.iter().enumerate() {
            if words.len() != ncols + 1 {
                anyhow::bail!(
                    "{}: line {} has {} fields, expected {}",
                    file,
                    i + 2,
                    words.len(),
                    ncols + 1
                );
            }
            rows.push(words[0].clone());
            data.extend(parse_words::<T>(&words[1..], file, i + 2)?);
        }

        Ok(MatWithNames {
            rows,
            cols,
            mat: DMatrix::<T>::from_row_iterator(nrows, ncols, data),
        })
    }

    fn write_data_with_names(
        &self,
        file: &str,
        row_names: &[Box<str>],
        column_names: &[Box<str>],
        delim: &str,
    ) -> anyhow::Result<()> {
        if row_names.len() != self.nrows() || column_names.len() != self.ncols() {
            anyhow::bail!(
                "names ({} x {}) don't match the matrix ({} x {})",
                row_names.len(),
                column_names.len(),
                self.nrows(),
                self.ncols()
            );
        }

        let mut lines: Vec<Box<str>> = Vec::with_capacity(self.nrows() + 1);

        let header = std::iter::once("")
            .chain(column_names.iter().map(|x| x.as_ref()))
            .collect::<Vec<_>>()
            .join(delim);
        lines.push(header.into_boxed_str());

        for (name, row) in row_names.iter().zip(self.row_iter()) {
            let line = std::iter::once(name.to_string())
                .chain(row.iter().map(|x| format!("{}", *x)))
                .collect::<Vec<_>>()
                .join(delim);
            lines.push(line.into_boxed_str());
        }

        write_lines_atomic(&lines, file)
    }
}
