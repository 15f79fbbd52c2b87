//! Line-oriented file I/O, gzipped or not (decided by the `.gz`
//! extension).
//!
//! Writers are atomic: content goes into a temporary file in the
//! destination directory and is renamed into place once complete, so a
//! reader either sees the whole file or no file.

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// How to split a line into words
#[derive(Clone, Debug)]
pub enum Delimiter {
    /// any run of whitespace; empty words never appear
    Whitespace,
    /// this exact separator; words are trimmed and may be empty
    Str(Box<str>),
}

impl From<&str> for Delimiter {
    fn from(s: &str) -> Self {
        Delimiter::Str(s.into())
    }
}

impl Delimiter {
    fn split(&self, line: &str) -> Vec<Box<str>> {
        match self {
            Delimiter::Whitespace => line.split_whitespace().map(Box::from).collect(),
            Delimiter::Str(sep) => line.split(&**sep).map(|w| w.trim().into()).collect(),
        }
    }
}

/// Lines of words with an optional header line
pub struct WordTable {
    pub header: Vec<Box<str>>,
    pub lines: Vec<Vec<Box<str>>>,
}

fn is_data_line(line: &str, comment: Option<char>) -> bool {
    !(line.trim().is_empty() || comment.is_some_and(|c| line.starts_with(c)))
}

/// Open `input_file` for buffered reading, decompressing `.gz`
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    match Path::new(input_file).extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(MultiGzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

/// Every line of `input_file`, as is
pub fn read_lines(input_file: &str) -> anyhow::Result<Vec<Box<str>>> {
    open_buf_reader(input_file)?
        .lines()
        .map(|line| -> anyhow::Result<Box<str>> { Ok(line?.into_boxed_str()) })
        .collect()
}

///
/// Read the data lines of `input_file` and split them into words.
/// Blank lines, and comment lines if a comment marker is given, are
/// skipped before counting.
///
/// * `input_file` - file name--either gzipped or not
/// * `delim` - how words are separated
/// * `header_line` - which data line holds the header; lines before it
///   are dropped (`None` = no header)
/// * `comment` - lines starting with this character are comments
///   (`None` = every non-blank line is data)
///
pub fn read_word_table(
    input_file: &str,
    delim: impl Into<Delimiter>,
    header_line: Option<usize>,
    comment: Option<char>,
) -> anyhow::Result<WordTable> {
    let delim = delim.into();

    let mut raw = Vec::new();
    for line in open_buf_reader(input_file)?.lines() {
        let line = line?;
        if is_data_line(&line, comment) {
            raw.push(line);
        }
    }

    let (header, body) = match header_line {
        Some(h) if h < raw.len() => (delim.split(&raw[h]), &raw[(h + 1)..]),
        Some(_) => anyhow::bail!("no header line in {}", input_file),
        None => (vec![], &raw[..]),
    };

    // splitting dominates on large files; par_iter keeps the order
    let lines = body.par_iter().map(|line| delim.split(line)).collect();
    Ok(WordTable { header, lines })
}

/// The first word of every line, e.g. barcodes or feature names
pub fn read_names(input_file: &str) -> anyhow::Result<Vec<Box<str>>> {
    read_word_table(input_file, Delimiter::Whitespace, None, None)?
        .lines
        .into_iter()
        .map(|words| words.into_iter().next())
        .enumerate()
        .map(|(i, name)| {
            name.ok_or_else(|| anyhow::anyhow!("{}: empty name on line {}", input_file, i + 1))
        })
        .collect()
}

///
/// Stream content into a temporary file next to `output_file` and
/// rename it into place once `write_fn` succeeds.
///
/// * `output_file` - file name--either gzipped or not
/// * `write_fn` - writes the content
///
pub fn write_atomic<F>(output_file: &str, write_fn: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut dyn Write) -> anyhow::Result<()>,
{
    let path = Path::new(output_file);
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;

    if path.extension().and_then(|x| x.to_str()) == Some("gz") {
        let mut encoder = GzEncoder::new(
            BufWriter::new(temp.as_file_mut()),
            flate2::Compression::default(),
        );
        write_fn(&mut encoder)?;
        encoder.finish()?.flush()?;
    } else {
        let mut buf = BufWriter::new(temp.as_file_mut());
        write_fn(&mut buf)?;
        buf.flush()?;
    }

    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {}", output_file, e))?;
    Ok(())
}

/// Write one item per line, atomically
pub fn write_lines_atomic<T>(lines: &[T], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    write_atomic(output_file, |buf| {
        for line in lines {
            writeln!(buf, "{}", line)?;
        }
        Ok(())
    })
}

/// Extension of `file`, looking through `.gz` (`a.mtx.gz` -> `mtx`)
pub fn file_ext(file: &str) -> anyhow::Result<Box<str>> {
    let path = Path::new(file);
    let inner = match path.extension().and_then(|x| x.to_str()) {
        Some("gz") => Path::new(path.file_stem().unwrap_or_default()),
        _ => path,
    };
    inner
        .extension()
        .and_then(|x| x.to_str())
        .map(Box::from)
        .ok_or_else(|| anyhow::anyhow!("no file extension: {}", file))
}
