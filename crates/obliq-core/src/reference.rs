//! In-process engine over the same file contract.
//!
//! Computes the operators in the clear. Useful for tests, dry runs of
//! workflows, and hosts without the enclave toolchain. Output files, row
//! order, and the elapsed-time stdout line mirror the subprocess engine.

use crate::engine::{Engine, EngineRequest, EngineRun, HeaderConvention, OperatorKind};
use crate::stage::{StageError, expected_output_path};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Instant;

/// Exit code reported for unreadable input, mimicking an engine crash.
const BAD_INPUT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy)]
pub struct ReferenceEngine {
    operator: OperatorKind,
}

impl ReferenceEngine {
    pub fn new(operator: OperatorKind) -> Self {
        Self { operator }
    }
}

impl Engine for ReferenceEngine {
    fn name(&self) -> &str {
        "reference"
    }

    fn operator(&self) -> OperatorKind {
        self.operator
    }

    fn execute(&self, request: &EngineRequest) -> Result<EngineRun, StageError> {
        let start = Instant::now();
        let text = std::fs::read_to_string(&request.input)?;

        let (table1, table2) = match split_tables(&text, self.operator.header_convention()) {
            Ok(tables) => tables,
            Err(msg) => return Ok(bad_input(msg)),
        };

        let rows = match self.operator {
            OperatorKind::Join | OperatorKind::FkJoin => join(&table1, &table2),
            OperatorKind::Filter => {
                let mut rows = Vec::new();
                for row in table1.iter().chain(&table2) {
                    let [key, payload] = row.as_slice() else {
                        return Ok(bad_input(format!("filter row '{}' needs 2 fields", row.join(" "))));
                    };
                    let Ok(k) = key.parse::<i64>() else {
                        return Ok(bad_input(format!("filter key '{key}' is not an integer")));
                    };
                    if request.predicate.is_none_or(|p| p.matches(k)) {
                        rows.push(vec![*key, *payload]);
                    }
                }
                rows.into_iter().map(|r| r.join(" ")).collect()
            }
            OperatorKind::Aggregate => match aggregate(&table1) {
                Ok(rows) => rows,
                Err(msg) => return Ok(bad_input(msg)),
            },
        };

        let mut out = String::new();
        for row in &rows {
            let _ = writeln!(out, "{row}");
        }
        std::fs::write(expected_output_path(&request.input), out)?;

        Ok(EngineRun {
            exit_code: 0,
            stdout: format!("{:.6}\n", start.elapsed().as_secs_f64()),
            stderr: String::new(),
        })
    }
}

fn bad_input(msg: String) -> EngineRun {
    EngineRun {
        exit_code: BAD_INPUT_CODE,
        stdout: String::new(),
        stderr: msg,
    }
}

type Table<'a> = Vec<Vec<&'a str>>;

fn split_tables(text: &str, convention: HeaderConvention) -> Result<(Table<'_>, Table<'_>), String> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or("empty input")?;
    let counts: Vec<usize> = header
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| format!("bad header '{header}'"))?;
    let (n1, n2) = match (convention, counts.as_slice()) {
        (HeaderConvention::Pair, [a, b]) => (*a, *b),
        (HeaderConvention::Single, [a]) => (*a, 0),
        _ => return Err(format!("bad header '{header}'")),
    };

    let mut rows: Table = lines.map(|l| l.split_whitespace().collect()).collect();
    if rows.len() != n1 + n2 {
        return Err(format!("header declares {} rows, found {}", n1 + n2, rows.len()));
    }
    let table2 = rows.split_off(n1);
    Ok((rows, table2))
}

/// Emits `key_b payload_b key_a payload_a` for every matching pair.
fn join(table1: &Table, table2: &Table) -> Vec<String> {
    let mut by_key: HashMap<&str, Vec<&str>> = HashMap::new();
    for row in table1 {
        if let [key, payload] = row.as_slice() {
            by_key.entry(*key).or_default().push(*payload);
        }
    }
    let mut out = Vec::new();
    for row in table2 {
        let [key_b, payload_b] = row.as_slice() else {
            continue;
        };
        for payload_a in by_key.get(key_b).into_iter().flatten() {
            out.push(format!("{key_b} {payload_b} {key_b} {payload_a}"));
        }
    }
    out
}

/// One row per group in ascending key order:
/// `key first_value group_sum first_payload`.
fn aggregate(rows: &Table) -> Result<Vec<String>, String> {
    let mut groups: IndexMap<&str, (i64, i64, &str)> = IndexMap::new();
    for row in rows {
        let [key, value, payload] = row.as_slice() else {
            return Err(format!("aggregate row '{}' needs 3 fields", row.join(" ")));
        };
        let v: i64 = value
            .parse()
            .map_err(|_| format!("aggregate value '{value}' is not an integer"))?;
        match groups.get_mut(*key) {
            Some((_, sum, _)) => {
                *sum = sum
                    .checked_add(v)
                    .ok_or_else(|| format!("aggregate overflow in group '{key}'"))?;
            }
            None => {
                groups.insert(*key, (v, v, *payload));
            }
        }
    }
    groups.sort_by(|a, _, b, _| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    });
    Ok(groups
        .into_iter()
        .map(|(key, (first, sum, payload))| format!("{key} {first} {sum} {payload}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Comparator, FilterPredicate};
    use std::fs;
    use std::path::Path;

    fn run(op: OperatorKind, input: &str, predicate: Option<FilterPredicate>) -> (EngineRun, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.txt");
        fs::write(&path, input).unwrap();
        let request = EngineRequest {
            operator: op,
            input: path.clone(),
            predicate,
        };
        let run = ReferenceEngine::new(op).execute(&request).unwrap();
        let out = fs::read_to_string(expected_output_path(Path::new(&path))).unwrap_or_default();
        (run, out)
    }

    #[test]
    fn test_filter() {
        let (run, out) = run(
            OperatorKind::Filter,
            "3 0\n1 10\n2 11\n3 12\n",
            Some(FilterPredicate::new(Comparator::Ge, 2)),
        );
        assert_eq!(run.exit_code, 0);
        assert!(run.stdout.trim().parse::<f64>().is_ok());
        assert_eq!(out, "2 11\n3 12\n");
    }

    #[test]
    fn test_join_field_order() {
        let (_, out) = run(OperatorKind::Join, "2 2\n0 1\n2 3\n0 4\n9 5\n", None);
        assert_eq!(out, "0 4 0 1\n");
    }

    #[test]
    fn test_aggregate_orders_keys() {
        let (_, out) = run(OperatorKind::Aggregate, "3\n5 1 10\n2 4 11\n5 3 12\n", None);
        assert_eq!(out, "2 4 4 11\n5 1 4 10\n");
    }

    #[test]
    fn test_aggregate_overflow_is_engine_failure() {
        let input = format!("2\n1 {} 10\n1 1 11\n", i64::MAX);
        let (run, out) = run(OperatorKind::Aggregate, &input, None);
        assert_eq!(run.exit_code, BAD_INPUT_CODE);
        assert!(run.stderr.contains("aggregate overflow"));
        assert!(out.is_empty());
    }

    #[test]
    fn test_count_mismatch_is_engine_failure() {
        let (run, _) = run(OperatorKind::Filter, "5 0\n1 2\n", None);
        assert_eq!(run.exit_code, BAD_INPUT_CODE);
        assert!(run.stderr.contains("declares 5 rows"));
    }
}
