//! Record formatting: relational CSV to engine input rows.

use crate::engine::OperatorKind;
use crate::sort_key::sort_key_for;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Separator between payload columns inside one payload field.
pub const PAYLOAD_DELIMITER: char = '|';

/// Written instead of an empty payload so field counts stay stable.
pub const EMPTY_PAYLOAD: &str = "_";

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(
        "{}: missing column(s) {}; required {}; found {}",
        .path.display(), .missing.join(", "), .required.join(", "), .found.join(", ")
    )]
    MissingColumns {
        path: PathBuf,
        required: Vec<String>,
        found: Vec<String>,
        missing: Vec<String>,
    },

    #[error("{0} needs two input tables")]
    MissingTable(OperatorKind),

    #[error("{0} takes a single input table")]
    UnexpectedTable(OperatorKind),

    #[error("{0} needs a value column")]
    MissingValueColumn(OperatorKind),
}

/// A delimited file with a header row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvSource {
    pub path: PathBuf,
    pub delimiter: u8,
}

impl CsvSource {
    /// Comma-delimited source.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
        }
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn reader(&self) -> Result<csv::Reader<File>, FormatError> {
        Ok(csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_path(&self.path)?)
    }
}

/// Read the column names of a source.
pub fn csv_header(source: &CsvSource) -> Result<Vec<String>, FormatError> {
    let mut reader = source.reader()?;
    Ok(clean_header(reader.headers()?))
}

fn clean_header(record: &csv::StringRecord) -> Vec<String> {
    record
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect()
}

/// Where a row's key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Column(String),
    /// Newest-first composite of a creation date and an id.
    SortKey { timestamp: String, id: String },
}

impl KeySource {
    fn columns(&self) -> Vec<&str> {
        match self {
            KeySource::Column(c) => vec![c.as_str()],
            KeySource::SortKey { timestamp, id } => vec![timestamp.as_str(), id.as_str()],
        }
    }
}

/// One table's contribution to a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub source: CsvSource,
    pub key: KeySource,
    pub value: Option<String>,
    pub payload: Vec<String>,
}

impl TableSpec {
    pub fn new(source: CsvSource, key: impl Into<String>) -> Self {
        Self {
            source,
            key: KeySource::Column(key.into()),
            value: None,
            payload: Vec::new(),
        }
    }

    /// Key rows by a composite sort key instead of a column.
    pub fn sort_key(source: CsvSource, timestamp: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            source,
            key: KeySource::SortKey {
                timestamp: timestamp.into(),
                id: id.into(),
            },
            value: None,
            payload: Vec::new(),
        }
    }

    pub fn value(mut self, column: impl Into<String>) -> Self {
        self.value = Some(column.into());
        self
    }

    pub fn payload<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.payload = columns.into_iter().map(Into::into).collect();
        self
    }

    fn required_columns(&self) -> Vec<&str> {
        let mut cols = self.key.columns();
        cols.extend(self.value.as_deref());
        cols.extend(self.payload.iter().map(String::as_str));
        cols
    }
}

/// One engine input row before relabeling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInputRow {
    pub key: String,
    pub value: Option<String>,
    pub payload: String,
}

impl StageInputRow {
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = vec![self.key.as_str()];
        fields.extend(self.value.as_deref());
        fields.push(&self.payload);
        fields
    }
}

/// Rows for one stage, partitioned by table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInput {
    pub operator: OperatorKind,
    pub table1: Vec<StageInputRow>,
    pub table2: Vec<StageInputRow>,
    /// Rows dropped because their key or value could not be used.
    pub skipped: usize,
}

impl StageInput {
    pub fn header(&self) -> String {
        self.operator
            .header_convention()
            .header(self.table1.len(), self.table2.len())
    }

    pub fn rows(&self) -> impl Iterator<Item = &StageInputRow> {
        self.table1.iter().chain(&self.table2)
    }

    pub fn len(&self) -> usize {
        self.table1.len() + self.table2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the count header followed by space-separated rows.
    pub fn write_to<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writeln!(writer, "{}", self.header())?;
        for row in self.rows() {
            writeln!(writer, "{}", row.fields().join(" "))?;
        }
        writer.flush()
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        self.write_to(BufWriter::new(File::create(path)?))
    }
}

/// Join payload column values into one field.
pub fn join_payload<S: AsRef<str>>(values: &[S]) -> String {
    let joined = values
        .iter()
        .map(|v| v.as_ref())
        .collect::<Vec<_>>()
        .join(&PAYLOAD_DELIMITER.to_string());
    if joined.is_empty() {
        EMPTY_PAYLOAD.to_string()
    } else {
        joined
    }
}

/// Turns CSV sources into [`StageInput`] for one operator.
#[derive(Debug, Clone, Copy)]
pub struct RecordFormatter {
    operator: OperatorKind,
}

impl RecordFormatter {
    pub fn new(operator: OperatorKind) -> Self {
        Self { operator }
    }

    /// Format one or two tables.
    ///
    /// All required columns of every table are checked before any data row
    /// is read.
    pub fn format(
        &self,
        table1: &TableSpec,
        table2: Option<&TableSpec>,
    ) -> Result<StageInput, FormatError> {
        match (self.operator.is_binary(), table2.is_some()) {
            (true, false) => return Err(FormatError::MissingTable(self.operator)),
            (false, true) => return Err(FormatError::UnexpectedTable(self.operator)),
            _ => {}
        }
        if self.operator == OperatorKind::Aggregate && table1.value.is_none() {
            return Err(FormatError::MissingValueColumn(self.operator));
        }

        let mut reader1 = table1.source.reader()?;
        let index1 = validate(table1, &mut reader1)?;
        let mut second = match table2 {
            Some(spec) => {
                let mut reader = spec.source.reader()?;
                let index = validate(spec, &mut reader)?;
                Some((spec, reader, index))
            }
            None => None,
        };

        let mut skipped = 0;
        let rows1 = self.read_rows(table1, &mut reader1, &index1, &mut skipped)?;
        let rows2 = match second.as_mut() {
            Some((spec, reader, index)) => self.read_rows(spec, reader, index, &mut skipped)?,
            None => Vec::new(),
        };

        tracing::debug!(
            operator = %self.operator,
            table1 = rows1.len(),
            table2 = rows2.len(),
            skipped,
            "formatted stage input"
        );

        Ok(StageInput {
            operator: self.operator,
            table1: rows1,
            table2: rows2,
            skipped,
        })
    }

    fn read_rows(
        &self,
        spec: &TableSpec,
        reader: &mut csv::Reader<File>,
        index: &ColumnIndex,
        skipped: &mut usize,
    ) -> Result<Vec<StageInputRow>, FormatError> {
        let mut rows = Vec::new();
        for (n, record) in reader.records().enumerate() {
            let record = record?;
            // +2: header row and 1-based numbering
            let line = n + 2;
            match self.build_row(spec, &record, index) {
                Ok(row) => rows.push(row),
                Err(reason) => {
                    tracing::warn!(path = %spec.source.path.display(), line, "skipping row: {reason}");
                    *skipped += 1;
                }
            }
        }
        Ok(rows)
    }

    fn build_row(
        &self,
        spec: &TableSpec,
        record: &csv::StringRecord,
        index: &ColumnIndex,
    ) -> Result<StageInputRow, String> {
        let field = |i: usize| {
            record
                .get(i)
                .ok_or_else(|| format!("expected at least {} fields, found {}", i + 1, record.len()))
        };

        let key = match (&spec.key, index.key.as_slice()) {
            (KeySource::Column(_), [k]) => field(*k)?.trim().to_string(),
            (KeySource::SortKey { .. }, [ts, id]) => {
                sort_key_for(field(*ts)?, field(*id)?).map_err(|e| e.to_string())?
            }
            _ => return Err("key columns not resolved".into()),
        };
        if key.is_empty() {
            return Err("empty key".into());
        }
        if self.operator == OperatorKind::Filter && key.parse::<i64>().is_err() {
            return Err(format!("filter key '{key}' is not an integer"));
        }

        let value = match index.value {
            Some(i) => {
                let v = field(i)?.trim();
                if v.parse::<i64>().is_err() {
                    return Err(format!("value '{v}' is not an integer"));
                }
                Some(v.to_string())
            }
            None => None,
        };

        let payload: Vec<&str> = index
            .payload
            .iter()
            .map(|&i| field(i))
            .collect::<Result<_, _>>()?;

        Ok(StageInputRow {
            key,
            value,
            payload: join_payload(&payload),
        })
    }
}

/// Positions of a table's required columns.
struct ColumnIndex {
    key: Vec<usize>,
    value: Option<usize>,
    payload: Vec<usize>,
}

fn validate(spec: &TableSpec, reader: &mut csv::Reader<File>) -> Result<ColumnIndex, FormatError> {
    let found = clean_header(reader.headers()?);
    let position = |name: &str| found.iter().position(|h| h == name);

    let required = spec.required_columns();
    let missing: Vec<String> = required
        .iter()
        .filter(|c| position(c).is_none())
        .map(|c| c.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(FormatError::MissingColumns {
            path: spec.source.path.clone(),
            required: required.iter().map(|c| c.to_string()).collect(),
            found,
            missing,
        });
    }

    // Every lookup below succeeds after the check above.
    let resolve = |name: &str| position(name).unwrap_or_default();
    Ok(ColumnIndex {
        key: spec.key.columns().into_iter().map(resolve).collect(),
        value: spec.value.as_deref().map(resolve),
        payload: spec.payload.iter().map(|c| resolve(c)).collect(),
    })
}
