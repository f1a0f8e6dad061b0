//! CSV reconstruction from intermediate records.
//!
//! An intermediate record is `key|value...|payload...` where each payload
//! group expands to its own columns. Column counts are known from the
//! [`HeaderSpec`], so splitting is positional.

use crate::format::EMPTY_PAYLOAD;
use crate::relabel::UNMAPPED_PREFIX;
use crate::reverse::INTERMEDIATE_DELIMITER;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ReconstructError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("nothing to union")]
    NoInputs,
}

/// Output columns of a reconstructed CSV.
///
/// `None` entries are present in the intermediate record but dropped from
/// the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSpec {
    pub key: Option<String>,
    pub values: Vec<Option<String>>,
    pub payload_groups: Vec<Vec<String>>,
}

impl HeaderSpec {
    pub fn filter(key: impl Into<String>, payload: Vec<String>) -> Self {
        Self {
            key: Some(key.into()),
            values: Vec::new(),
            payload_groups: vec![payload],
        }
    }

    /// Join output, qualified by table: `t1.key, t1.p..., t2.p...`.
    pub fn join(key: &str, payload1: &[String], payload2: &[String]) -> Self {
        let qualify = |prefix: &str, cols: &[String]| -> Vec<String> {
            cols.iter().map(|c| format!("{prefix}.{c}")).collect()
        };
        Self {
            key: Some(format!("t1.{key}")),
            values: Vec::new(),
            payload_groups: vec![qualify("t1", payload1), qualify("t2", payload2)],
        }
    }

    pub fn aggregate(group: impl Into<String>, payload: Vec<String>) -> Self {
        Self {
            key: Some(group.into()),
            values: vec![
                Some("representative_value".into()),
                Some("global_aggregate".into()),
            ],
            payload_groups: vec![payload],
        }
    }

    /// Aggregate output used as a sort: only the payload survives.
    pub fn sort(payload: Vec<String>) -> Self {
        Self {
            key: None,
            values: vec![None, None],
            payload_groups: vec![payload],
        }
    }

    pub fn columns(&self) -> Vec<String> {
        self.key
            .iter()
            .chain(self.values.iter().flatten())
            .chain(self.payload_groups.iter().flatten())
            .cloned()
            .collect()
    }

    /// Tokens in a record with every id mapped.
    fn token_count(&self) -> usize {
        1 + self.values.len()
            + self
                .payload_groups
                .iter()
                .map(|g| g.len().max(1))
                .sum::<usize>()
    }

    /// Split one record into output values.
    ///
    /// An unmapped payload id arrives as a single `UNMAPPED_<id>` token even
    /// for a multi-column group; it fills the group's first column and the
    /// remaining columns stay empty.
    fn split(&self, record: &str) -> Option<Vec<String>> {
        let mut tokens = record.split(INTERMEDIATE_DELIMITER).peekable();
        let mut row = Vec::with_capacity(self.columns().len());

        let key = tokens.next()?;
        if self.key.is_some() {
            row.push(key.to_string());
        }
        for value in &self.values {
            let token = tokens.next()?;
            if value.is_some() {
                row.push(token.to_string());
            }
        }
        for group in &self.payload_groups {
            match group.len() {
                0 => {
                    tokens.next()?;
                }
                1 => {
                    let token = tokens.next()?;
                    row.push(if token == EMPTY_PAYLOAD { "" } else { token }.to_string());
                }
                n if tokens.peek()?.starts_with(UNMAPPED_PREFIX) => {
                    row.push(tokens.next()?.to_string());
                    row.extend(std::iter::repeat_n(String::new(), n - 1));
                }
                n => {
                    for _ in 0..n {
                        row.push(tokens.next()?.to_string());
                    }
                }
            }
        }
        tokens.next().is_none().then_some(row)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconstructStats {
    pub rows: usize,
    pub skipped: usize,
}

/// Writes a CSV with exactly one header row from intermediate records.
#[derive(Debug, Clone)]
pub struct CsvReconstructor {
    header: HeaderSpec,
    delimiter: u8,
    limit: Option<usize>,
}

impl CsvReconstructor {
    pub fn new(header: HeaderSpec) -> Self {
        Self {
            header,
            delimiter: b',',
            limit: None,
        }
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Stop after this many data rows.
    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn header(&self) -> &HeaderSpec {
        &self.header
    }

    pub fn reconstruct_stream<R: BufRead, W: Write>(
        &self,
        reader: R,
        writer: W,
    ) -> Result<ReconstructStats, ReconstructError> {
        let mut out = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(writer);
        out.write_record(self.header.columns())?;

        let mut stats = ReconstructStats::default();
        for (index, line) in reader.lines().enumerate() {
            if self.limit.is_some_and(|limit| stats.rows >= limit) {
                break;
            }
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match self.header.split(&line) {
                Some(row) => {
                    out.write_record(&row)?;
                    stats.rows += 1;
                }
                None => {
                    tracing::warn!(
                        line = index + 1,
                        expected = self.header.token_count(),
                        found = line.split(INTERMEDIATE_DELIMITER).count(),
                        "skipping record with mismatched column count"
                    );
                    stats.skipped += 1;
                }
            }
        }
        out.flush()?;
        Ok(stats)
    }

    pub fn reconstruct(&self, input: &Path, output: &Path) -> Result<ReconstructStats, ReconstructError> {
        let reader = BufReader::new(File::open(input)?);
        let stats = self.reconstruct_stream(reader, File::create(output)?)?;
        tracing::debug!(output = %output.display(), rows = stats.rows, skipped = stats.skipped, "reconstructed csv");
        Ok(stats)
    }
}

/// Concatenate CSVs positionally under the first file's header.
pub fn union_csvs(inputs: &[PathBuf], output: &Path, delimiter: u8) -> Result<usize, ReconstructError> {
    let (first, _) = inputs.split_first().ok_or(ReconstructError::NoInputs)?;
    let header = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_path(first)?
        .headers()?
        .clone();

    let mut out = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(output)?;
    out.write_record(&header)?;

    let mut rows = 0;
    for input in inputs {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_path(input)?;
        if reader.headers()?.len() != header.len() {
            tracing::warn!(input = %input.display(), "column count differs from the first input");
        }
        for record in reader.records() {
            out.write_record(&record?)?;
            rows += 1;
        }
    }
    out.flush()?;
    Ok(rows)
}
