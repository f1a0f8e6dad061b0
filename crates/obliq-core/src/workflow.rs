//! Workflow definition and execution.
//!
//! A workflow is a serializable list of steps, each one operator or a union.
//! Steps read CSV files or, with `@<step-id>`, the output of an earlier
//! step. The last step writes the workflow output; everything else lives in
//! the run's scratch directory.

use crate::engine::{Comparator, FilterPredicate};
use crate::format::{CsvSource, TableSpec};
use crate::pipeline::{
    AggregateSpec, Cleanup, FilterSpec, JoinSpec, Pipeline, PipelineError, PipelineRun, RunReport,
    SortColumns, SortSpec, StageReport, qualify_column,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

/// Prefix marking a reference to an earlier step's output.
pub const STEP_REF: char = '@';

/// A workflow definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub steps: Vec<Step>,

    /// Where the last step writes.
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Keep intermediate files after the run.
    #[serde(default)]
    pub keep_scratch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,

    #[serde(flatten)]
    pub operation: Operation,
}

/// One table read by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    /// CSV path, or `@<step-id>`.
    pub input: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub payload: Vec<String>,
    /// Field delimiter of a CSV path input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Join {
        left: TableRef,
        right: TableRef,
        #[serde(default)]
        foreign_key: bool,
    },
    Filter {
        table: TableRef,
        comparator: Comparator,
        threshold: i64,
    },
    Aggregate {
        table: TableRef,
    },
    /// Newest first by `timestamp`, then by `id_column`.
    Sort {
        input: String,
        timestamp: String,
        id_column: String,
        payload: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delimiter: Option<char>,
    },
    Union {
        inputs: Vec<String>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Join {
                foreign_key: true, ..
            } => "fk_join",
            Operation::Join { .. } => "join",
            Operation::Filter { .. } => "filter",
            Operation::Aggregate { .. } => "aggregate",
            Operation::Sort { .. } => "sort",
            Operation::Union { .. } => "union",
        }
    }

    /// Every input reference, in reading order.
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            Operation::Join { left, right, .. } => vec![left.input.as_str(), right.input.as_str()],
            Operation::Filter { table, .. } | Operation::Aggregate { table } => {
                vec![table.input.as_str()]
            }
            Operation::Sort { input, .. } => vec![input.as_str()],
            Operation::Union { inputs } => inputs.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.operation.name())?;
        match &self.operation {
            Operation::Join { left, right, .. } => write!(
                f,
                " {}.{} = {}.{}",
                left.input, left.key, right.input, right.key
            ),
            Operation::Filter {
                table,
                comparator,
                threshold,
            } => write!(f, " {} where {} {comparator} {threshold}", table.input, table.key),
            Operation::Aggregate { table } => write!(
                f,
                " {} by {} over {}",
                table.input,
                table.key,
                table.value.as_deref().unwrap_or("?")
            ),
            Operation::Sort {
                input,
                timestamp,
                id_column,
                limit,
                ..
            } => {
                write!(f, " {input} by {timestamp} desc, {id_column} desc")?;
                match limit {
                    Some(n) => write!(f, " limit {n}"),
                    None => Ok(()),
                }
            }
            Operation::Union { inputs } => write!(f, " {}", inputs.join(" + ")),
        }
    }
}

/// Errors related to workflow parsing and execution.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("failed to parse workflow: {0}")]
    Parse(String),

    #[error("invalid workflow: {0}")]
    Invalid(String),

    #[error("step '{step}' failed")]
    Execution {
        step: String,
        #[source]
        source: PipelineError,
    },
}

impl Workflow {
    /// Parse a workflow, picking the format from `path`'s extension (YAML if unknown).
    pub fn from_bytes(data: &[u8], path: Option<&str>) -> Result<Self, WorkflowError> {
        let format = path.and_then(detect_format).unwrap_or("yaml");
        Self::from_bytes_format(data, format)
    }

    pub fn from_bytes_format(data: &[u8], format: &str) -> Result<Self, WorkflowError> {
        match format {
            "json" => serde_json::from_slice(data).map_err(parse_error),
            "yaml" | "yml" => serde_yaml::from_slice(data).map_err(parse_error),
            "toml" => {
                let text = std::str::from_utf8(data).map_err(parse_error)?;
                toml::from_str(text).map_err(parse_error)
            }
            other => Err(unsupported(other)),
        }
    }

    pub fn to_bytes(&self, format: &str) -> Result<Vec<u8>, WorkflowError> {
        let text = match format {
            "json" => return serde_json::to_vec_pretty(self).map_err(parse_error),
            "yaml" | "yml" => serde_yaml::to_string(self).map_err(parse_error)?,
            "toml" => toml::to_string_pretty(self).map_err(parse_error)?,
            other => return Err(unsupported(other)),
        };
        Ok(text.into_bytes())
    }

    /// Check structure without touching any file.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let invalid = |msg: String| Err(WorkflowError::Invalid(msg));
        if self.steps.is_empty() {
            return invalid("no steps".into());
        }
        if self.output.is_none() {
            return invalid("no output path".into());
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() || step.id.starts_with(STEP_REF) {
                return invalid(format!("bad step id '{}'", step.id));
            }
            for input in step.operation.inputs() {
                if let Some(target) = input.strip_prefix(STEP_REF)
                    && !seen.contains(target)
                {
                    return invalid(format!(
                        "step '{}' reads '{input}', which is not an earlier step",
                        step.id
                    ));
                }
            }
            if let Operation::Aggregate { table } = &step.operation
                && table.value.is_none()
            {
                return invalid(format!("aggregate step '{}' needs a value column", step.id));
            }
            if let Operation::Union { inputs } = &step.operation
                && inputs.is_empty()
            {
                return invalid(format!("union step '{}' has no inputs", step.id));
            }
            for delimiter in step_delimiters(&step.operation) {
                if !delimiter.is_ascii() {
                    return invalid(format!(
                        "step '{}': delimiter '{delimiter}' is not a single byte",
                        step.id
                    ));
                }
            }
            if !seen.insert(step.id.as_str()) {
                return invalid(format!("duplicate step id '{}'", step.id));
            }
        }
        Ok(())
    }

    /// Run every step in one pipeline run.
    pub fn execute(&self, pipeline: &Pipeline) -> Result<RunReport, WorkflowError> {
        self.validate()?;
        let output = self
            .output
            .clone()
            .ok_or_else(|| WorkflowError::Invalid("no output path".into()))?;

        let keep;
        let pipeline = if self.keep_scratch {
            let mut options = pipeline.options().clone();
            options.cleanup = Cleanup::Keep;
            keep = Pipeline::new(pipeline.registry().clone(), options);
            &keep
        } else {
            pipeline
        };

        if let Some(name) = &self.name {
            tracing::info!(workflow = %name, steps = self.steps.len(), "running workflow");
        }
        let failed = |step: &Step| {
            let step = step.id.clone();
            move |source: PipelineError| WorkflowError::Execution { step, source }
        };

        let mut run = pipeline.start().map_err(|source| WorkflowError::Execution {
            step: "setup".into(),
            source,
        })?;
        let mut outputs: IndexMap<String, StageReport> = IndexMap::new();
        let last = self.steps.len() - 1;
        for (index, step) in self.steps.iter().enumerate() {
            let target = if index == last {
                output.clone()
            } else {
                run.scratch().file(&format!("{}.csv", step.id))
            };
            let report = run_step(&mut run, step, &outputs, &target).map_err(failed(step))?;
            outputs.insert(step.id.clone(), report);
        }

        run.finish(&output).map_err(|source| WorkflowError::Execution {
            step: "finish".into(),
            source,
        })
    }
}

fn step_delimiters(operation: &Operation) -> Vec<char> {
    match operation {
        Operation::Join { left, right, .. } => left.delimiter.into_iter().chain(right.delimiter).collect(),
        Operation::Filter { table, .. } | Operation::Aggregate { table } => {
            table.delimiter.into_iter().collect()
        }
        Operation::Sort { delimiter, .. } => delimiter.iter().copied().collect(),
        Operation::Union { .. } => Vec::new(),
    }
}

/// A resolved input: where to read and, for step outputs, which columns exist.
struct Resolved<'a> {
    source: CsvSource,
    columns: Option<&'a [String]>,
}

impl Resolved<'_> {
    fn column(&self, name: &str) -> Result<String, PipelineError> {
        match self.columns {
            Some(columns) => qualify_column(name, columns),
            None => Ok(name.to_string()),
        }
    }

    fn columns(&self, names: &[String]) -> Result<Vec<String>, PipelineError> {
        names.iter().map(|n| self.column(n)).collect()
    }
}

fn resolve<'a>(
    run: &PipelineRun<'_>,
    input: &str,
    delimiter: Option<char>,
    outputs: &'a IndexMap<String, StageReport>,
) -> Result<Resolved<'a>, PipelineError> {
    match input.strip_prefix(STEP_REF) {
        Some(id) => {
            let report = outputs.get(id).ok_or_else(|| PipelineError::UnknownColumn {
                column: input.to_string(),
                available: outputs.keys().map(|k| format!("{STEP_REF}{k}")).collect(),
            })?;
            Ok(Resolved {
                source: run.source(&report.output),
                columns: Some(&report.columns),
            })
        }
        None => {
            let mut source = CsvSource::new(input);
            if let Some(d) = delimiter {
                source = source.delimiter(d as u8);
            }
            Ok(Resolved {
                source,
                columns: None,
            })
        }
    }
}

fn table_spec(
    run: &PipelineRun<'_>,
    table: &TableRef,
    outputs: &IndexMap<String, StageReport>,
) -> Result<TableSpec, PipelineError> {
    let resolved = resolve(run, &table.input, table.delimiter, outputs)?;
    let mut spec = TableSpec::new(resolved.source.clone(), resolved.column(&table.key)?)
        .payload(resolved.columns(&table.payload)?);
    if let Some(value) = &table.value {
        spec = spec.value(resolved.column(value)?);
    }
    Ok(spec)
}

fn run_step(
    run: &mut PipelineRun<'_>,
    step: &Step,
    outputs: &IndexMap<String, StageReport>,
    target: &std::path::Path,
) -> Result<StageReport, PipelineError> {
    tracing::debug!(step = %step, "workflow step");
    match &step.operation {
        Operation::Join {
            left,
            right,
            foreign_key,
        } => {
            let spec = JoinSpec {
                left: table_spec(run, left, outputs)?,
                right: table_spec(run, right, outputs)?,
                foreign_key: *foreign_key,
            };
            run.join(&spec, target)
        }
        Operation::Filter {
            table,
            comparator,
            threshold,
        } => {
            let spec = FilterSpec {
                table: table_spec(run, table, outputs)?,
                predicate: FilterPredicate::new(*comparator, *threshold),
            };
            run.filter(&spec, target)
        }
        Operation::Aggregate { table } => {
            let spec = AggregateSpec {
                table: table_spec(run, table, outputs)?,
            };
            run.aggregate(&spec, target)
        }
        Operation::Sort {
            input,
            timestamp,
            id_column,
            payload,
            limit,
            delimiter,
        } => {
            let resolved = resolve(run, input, *delimiter, outputs)?;
            let spec = SortSpec {
                source: resolved.source.clone(),
                columns: SortColumns {
                    timestamp: resolved.column(timestamp)?,
                    id: resolved.column(id_column)?,
                    payload: resolved.columns(payload)?,
                    limit: *limit,
                },
            };
            run.sort_desc(&spec, target)
        }
        Operation::Union { inputs } => {
            let paths = inputs
                .iter()
                .map(|input| resolve(run, input, None, outputs).map(|r| r.source.path))
                .collect::<Result<Vec<_>, _>>()?;
            run.union(&paths, target)
        }
    }
}

/// Detect format from file path extension.
fn detect_format(path: &str) -> Option<&'static str> {
    let (_, ext) = path.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "json" => Some("json"),
        "yaml" | "yml" => Some("yaml"),
        "toml" => Some("toml"),
        _ => None,
    }
}

fn parse_error(e: impl fmt::Display) -> WorkflowError {
    WorkflowError::Parse(e.to_string())
}

fn unsupported(format: &str) -> WorkflowError {
    WorkflowError::Parse(format!("unsupported workflow format '{format}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineOptions;
    use crate::registry::EngineRegistry;
    use std::fs;
    use std::path::Path;

    const FRIENDS_YAML: &str = r#"
name: friends-of-one
output: out.csv
steps:
  - id: forward
    op: join
    left: { input: edges.csv, key: dst, payload: [src] }
    right: { input: nodes.csv, key: id, payload: [name] }
  - id: forward_x
    op: filter
    table: { input: "@forward", key: src, payload: [dst, name] }
    comparator: "=="
    threshold: 1
  - id: backward
    op: join
    left: { input: edges.csv, key: src, payload: [dst] }
    right: { input: nodes.csv, key: id, payload: [name] }
  - id: backward_x
    op: filter
    table: { input: "@backward", key: dst, payload: [src, name] }
    comparator: "=="
    threshold: 1
  - id: all
    op: union
    inputs: ["@forward_x", "@backward_x"]
"#;

    fn in_dir(dir: &Path, yaml: &str) -> Workflow {
        let text = yaml
            .replace("edges.csv", &dir.join("edges.csv").display().to_string())
            .replace("nodes.csv", &dir.join("nodes.csv").display().to_string())
            .replace("out.csv", &dir.join("out.csv").display().to_string());
        Workflow::from_bytes(text.as_bytes(), Some("friends.yaml")).unwrap()
    }

    #[test]
    fn test_parse_yaml() {
        let wf = Workflow::from_bytes(FRIENDS_YAML.as_bytes(), None).unwrap();
        assert_eq!(wf.steps.len(), 5);
        assert_eq!(wf.steps[1].operation.name(), "filter");
        assert_eq!(wf.steps[4].operation.inputs(), vec!["@forward_x", "@backward_x"]);
        wf.validate().unwrap();
        assert_eq!(
            wf.steps[1].to_string(),
            "forward_x: filter @forward where src == 1"
        );
    }

    #[test]
    fn test_toml_and_json_roundtrip() {
        let wf = Workflow::from_bytes(FRIENDS_YAML.as_bytes(), None).unwrap();
        for format in ["json", "toml", "yaml"] {
            let bytes = wf.to_bytes(format).unwrap();
            let parsed = Workflow::from_bytes_format(&bytes, format).unwrap();
            assert_eq!(parsed.steps[3].operation, wf.steps[3].operation);
        }
    }

    #[test]
    fn test_rejects_forward_reference() {
        let wf = Workflow::from_bytes(
            br#"
output: o.csv
steps:
  - { id: a, op: union, inputs: ["@b"] }
  - { id: b, op: union, inputs: [x.csv] }
"#,
            None,
        )
        .unwrap();
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("not an earlier step"));
    }

    #[test]
    fn test_rejects_duplicates_and_missing_output() {
        let dup = Workflow::from_bytes(
            br#"
output: o.csv
steps:
  - { id: a, op: union, inputs: [x.csv] }
  - { id: a, op: union, inputs: [y.csv] }
"#,
            None,
        )
        .unwrap();
        assert!(matches!(dup.validate(), Err(WorkflowError::Invalid(_))));

        let no_output = Workflow {
            output: None,
            ..dup
        };
        assert!(no_output.validate().unwrap_err().to_string().contains("output"));
    }

    #[test]
    fn test_bad_comparator_is_parse_error() {
        let err = Workflow::from_bytes(
            br#"
output: o.csv
steps:
  - id: f
    op: filter
    table: { input: t.csv, key: id }
    comparator: "=>"
    threshold: 1
"#,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Parse(_)));
    }

    #[test]
    fn test_demo_workflows_validate() {
        for (name, text) in [
            ("ldbc-short2.yaml", include_str!("../../../demos/ldbc-short2.yaml")),
            ("ldbc-short3.yaml", include_str!("../../../demos/ldbc-short3.yaml")),
        ] {
            let wf = Workflow::from_bytes(text.as_bytes(), Some(name)).unwrap();
            wf.validate().unwrap();
        }
    }

    #[test]
    fn test_execute_symmetric_friends() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("edges.csv"), "src,dst\n1,2\n3,1\n1,4\n").unwrap();
        fs::write(dir.path().join("nodes.csv"), "id,name\n1,X\n2,B\n3,C\n4,D\n").unwrap();
        let wf = in_dir(dir.path(), FRIENDS_YAML);

        let pipeline = Pipeline::new(
            EngineRegistry::reference(),
            PipelineOptions {
                scratch_root: dir.path().join("scratch"),
                ..PipelineOptions::default()
            },
        );
        let report = wf.execute(&pipeline).unwrap();
        assert_eq!(report.stages.len(), 5);
        assert_eq!(
            fs::read_to_string(dir.path().join("out.csv")).unwrap(),
            "t1.src,t1.dst,t2.name\n1,2,B\n1,4,D\n1,3,C\n"
        );
    }

    #[test]
    fn test_execute_filter_then_sort() {
        let dir = tempfile::tempdir().unwrap();
        let posts = dir.path().join("posts.csv");
        fs::write(
            &posts,
            "creator,id,created,content\n\
             7,1,2010-01-01T00:00:00Z,old\n\
             7,2,2012-01-01T00:00:00Z,new\n\
             8,3,2011-01-01T00:00:00Z,mid\n\
             7,4,2012-01-01T00:00:00Z,tie\n",
        )
        .unwrap();
        let yaml = format!(
            r#"
output: {out}
steps:
  - id: mine
    op: filter
    table: {{ input: {posts}, key: creator, payload: [id, created, content] }}
    comparator: "=="
    threshold: 7
  - id: recent
    op: sort
    input: "@mine"
    timestamp: created
    id_column: id
    payload: [id, content]
    limit: 2
"#,
            out = dir.path().join("out.csv").display(),
            posts = posts.display(),
        );
        let wf = Workflow::from_bytes(yaml.as_bytes(), Some("recent.yaml")).unwrap();
        wf.validate().unwrap();
        assert_eq!(wf.steps[1].to_string(), "recent: sort @mine by created desc, id desc limit 2");

        let pipeline = Pipeline::new(
            EngineRegistry::reference(),
            PipelineOptions {
                scratch_root: dir.path().join("scratch"),
                ..PipelineOptions::default()
            },
        );
        let report = wf.execute(&pipeline).unwrap();
        assert_eq!(report.stages.len(), 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("out.csv")).unwrap(),
            "id,content\n4,tie\n2,new\n"
        );
    }

    #[test]
    fn test_execution_error_names_step() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("nodes.csv"), "id,name\n1,X\n").unwrap();
        let wf = in_dir(
            dir.path(),
            r#"
output: out.csv
steps:
  - id: only
    op: filter
    table: { input: nodes.csv, key: id, payload: [age] }
    comparator: "<"
    threshold: 3
"#,
        );
        let pipeline = Pipeline::new(
            EngineRegistry::reference(),
            PipelineOptions {
                scratch_root: dir.path().join("scratch"),
                ..PipelineOptions::default()
            },
        );
        match wf.execute(&pipeline).unwrap_err() {
            WorkflowError::Execution { step, source } => {
                assert_eq!(step, "only");
                assert!(matches!(source, PipelineError::Format { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
