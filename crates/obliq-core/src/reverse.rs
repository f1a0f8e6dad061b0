//! Reverse relabeling of engine output.
//!
//! Rows are interpreted according to the operator that produced them, never
//! by sniffing their field count alone. The result is one `|`-separated
//! intermediate record per row, in logical order.

use crate::engine::{OperatorKind, OutputShape};
use crate::relabel::{FieldRole, Resolved, ReverseMap};
use crate::stage::StageError;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Separator between fields of an intermediate record.
pub const INTERMEDIATE_DELIMITER: &str = "|";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReverseStats {
    pub rows: usize,
    /// Rows whose field count did not fit the operator's output shape.
    pub skipped: usize,
    /// Fields written as `UNMAPPED_<id>`.
    pub unmapped: usize,
}

/// Maps one stage's engine output back to original values.
#[derive(Debug, Clone)]
pub struct ReverseRelabeler {
    map: ReverseMap,
    operator: OperatorKind,
    key_role: FieldRole,
    payload_role: FieldRole,
}

impl ReverseRelabeler {
    pub fn new(map: ReverseMap, operator: OperatorKind) -> Self {
        let roles = operator.input_roles();
        let key_role = roles.first().copied().unwrap_or(FieldRole::Relabel);
        let payload_role = roles.last().copied().unwrap_or(FieldRole::Relabel);
        Self {
            map,
            operator,
            key_role,
            payload_role,
        }
    }

    pub fn shape(&self) -> OutputShape {
        self.operator.output_shape()
    }

    fn field(&self, token: &str, role: FieldRole, unmapped: &mut usize) -> String {
        if role == FieldRole::Passthrough {
            return token.to_string();
        }
        let resolved = self.map.resolve(token);
        if resolved.is_unmapped() {
            *unmapped += 1;
        }
        match resolved {
            Resolved::Mapped(v) | Resolved::Verbatim(v) => v.to_string(),
            Resolved::Unmapped(s) => s,
        }
    }

    /// Reverse one row of engine fields.
    ///
    /// Returns `None` if the field count does not fit the operator's shape.
    /// The second value counts unmapped ids.
    pub fn reverse_fields(&self, fields: &[&str]) -> Option<(Vec<String>, usize)> {
        let mut unmapped = 0;
        let key = self.key_role;
        let payload = self.payload_role;
        let pass = FieldRole::Passthrough;

        let out = match (self.shape(), fields) {
            (OutputShape::KeyPayload, [k, p]) => vec![
                self.field(k, key, &mut unmapped),
                self.field(p, payload, &mut unmapped),
            ],
            (OutputShape::KeyAggregatesPayload, [k, v, p]) => vec![
                self.field(k, key, &mut unmapped),
                self.field(v, pass, &mut unmapped),
                self.field(p, payload, &mut unmapped),
            ],
            (OutputShape::KeyAggregatesPayload, [k, a1, a2, p]) => vec![
                self.field(k, key, &mut unmapped),
                self.field(a1, pass, &mut unmapped),
                self.field(a2, pass, &mut unmapped),
                self.field(p, payload, &mut unmapped),
            ],
            // Engine order is (key_b, payload_b, key_a, payload_a).
            (OutputShape::JoinPair, [_key_b, payload_b, key_a, payload_a]) => vec![
                self.field(key_a, key, &mut unmapped),
                self.field(payload_a, payload, &mut unmapped),
                self.field(payload_b, payload, &mut unmapped),
            ],
            _ => return None,
        };
        Some((out, unmapped))
    }

    /// Reverse one whitespace-separated line. Blank lines yield `None`.
    pub fn reverse_line(&self, line: &str) -> Option<Result<(String, usize), usize>> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            return None;
        }
        Some(
            self.reverse_fields(&fields)
                .map(|(out, unmapped)| (out.join(INTERMEDIATE_DELIMITER), unmapped))
                .ok_or(fields.len()),
        )
    }

    pub fn reverse_stream<R: BufRead, W: Write>(
        &self,
        reader: R,
        mut writer: W,
    ) -> Result<ReverseStats, StageError> {
        let mut stats = ReverseStats::default();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            match self.reverse_line(&line) {
                None => {}
                Some(Ok((record, unmapped))) => {
                    writeln!(writer, "{record}")?;
                    stats.rows += 1;
                    stats.unmapped += unmapped;
                }
                Some(Err(found)) => {
                    tracing::warn!(
                        operator = %self.operator,
                        line = index + 1,
                        found,
                        expected = ?self.shape().arities(),
                        "skipping engine row with unexpected field count"
                    );
                    stats.skipped += 1;
                }
            }
        }
        writer.flush()?;

        if stats.rows == 0 && stats.skipped > 0 {
            return Err(StageError::ContractViolation {
                operator: self.operator,
                detail: format!(
                    "none of {} rows has {:?} fields",
                    stats.skipped,
                    self.shape().arities()
                ),
            });
        }
        if stats.unmapped > 0 {
            tracing::warn!(operator = %self.operator, count = stats.unmapped, "ids missing from the value map");
        }
        Ok(stats)
    }

    pub fn reverse_file(&self, input: &Path, output: &Path) -> Result<ReverseStats, StageError> {
        let reader = BufReader::new(File::open(input)?);
        let writer = BufWriter::new(File::create(output)?);
        self.reverse_stream(reader, writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{CsvSource, RecordFormatter, TableSpec};
    use crate::relabel::ValueRelabeler;
    use std::io::Cursor;

    fn map(entries: &[(u64, &str)]) -> ReverseMap {
        entries.iter().map(|(id, v)| (*id, v.to_string())).collect()
    }

    #[test]
    fn test_join_permutation() {
        let r = ReverseRelabeler::new(map(&[(5, "K"), (6, "PB"), (7, "PA")]), OperatorKind::Join);
        let (line, unmapped) = r.reverse_line("5 6 5 7").unwrap().unwrap();
        assert_eq!(line, "K|PA|PB");
        assert_eq!(unmapped, 0);
    }

    #[test]
    fn test_unmapped_id_is_visible() {
        let r = ReverseRelabeler::new(map(&[(5, "K"), (7, "PA")]), OperatorKind::FkJoin);
        let (line, unmapped) = r.reverse_line("5 9 5 7").unwrap().unwrap();
        assert_eq!(line, "K|PA|UNMAPPED_9");
        assert_eq!(unmapped, 1);
    }

    #[test]
    fn test_unmapped_row_does_not_abort_others() {
        let r = ReverseRelabeler::new(map(&[(0, "apple"), (1, "banana")]), OperatorKind::Filter);
        let mut out = Vec::new();
        let stats = r
            .reverse_stream(Cursor::new("1 0\n2 8\n3 1\n"), &mut out)
            .unwrap();
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.unmapped, 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "1|apple\n2|UNMAPPED_8\n3|banana\n"
        );
    }

    #[test]
    fn test_aggregate_passthrough_values() {
        let r = ReverseRelabeler::new(map(&[(0, "g1"), (3, "row")]), OperatorKind::Aggregate);
        let (four, _) = r.reverse_line("0 17 42 3").unwrap().unwrap();
        assert_eq!(four, "g1|17|42|row");
        let (three, _) = r.reverse_line("0 17 3").unwrap().unwrap();
        assert_eq!(three, "g1|17|row");
    }

    #[test]
    fn test_wrong_arity_is_skipped() {
        let r = ReverseRelabeler::new(map(&[(0, "a"), (1, "b")]), OperatorKind::Join);
        let mut out = Vec::new();
        let stats = r
            .reverse_stream(Cursor::new("0 1 0 1\n0 1\n\n"), &mut out)
            .unwrap();
        assert_eq!(stats.rows, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_all_rows_malformed_is_contract_violation() {
        let r = ReverseRelabeler::new(map(&[]), OperatorKind::Join);
        let err = r
            .reverse_stream(Cursor::new("1 2\n3 4\n"), Vec::new())
            .unwrap_err();
        assert!(matches!(err, StageError::ContractViolation { .. }));
    }

    #[test]
    fn test_empty_output_is_fine() {
        let r = ReverseRelabeler::new(map(&[]), OperatorKind::Filter);
        let stats = r.reverse_stream(Cursor::new(""), Vec::new()).unwrap();
        assert_eq!(stats, ReverseStats::default());
    }

    #[test]
    fn test_format_relabel_reverse_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "id,name,city\n1,Ada,London\n2,Alan,\n3,Grace,New York\n").unwrap();
        let spec = TableSpec::new(CsvSource::new(&path), "id").payload(["name", "city"]);
        let input = RecordFormatter::new(OperatorKind::Filter)
            .format(&spec, None)
            .unwrap();

        let mut relabeler = ValueRelabeler::new(OperatorKind::Filter.input_roles());
        let relabeled: Vec<String> = input
            .rows()
            .map(|row| relabeler.relabel_fields(&row.fields()).unwrap().join(" "))
            .collect();

        let reverse = ReverseRelabeler::new(relabeler.into_map().into(), OperatorKind::Filter);
        for (row, line) in input.rows().zip(&relabeled) {
            let (back, _) = reverse.reverse_line(line).unwrap().unwrap();
            assert_eq!(back, format!("{}|{}", row.key, row.payload));
        }
    }
}
