//! Multi-stage plans over the engine's primitive operators.
//!
//! Every stage runs the same chain: format, relabel, run the engine, reverse
//! the labels, reconstruct a CSV. Stages run strictly one after another and
//! share a scratch directory for the duration of a [`PipelineRun`].

use crate::engine::{EngineRequest, FilterPredicate, OperatorKind};
use crate::format::{CsvSource, FormatError, KeySource, RecordFormatter, StageInput, TableSpec};
use crate::reconstruct::{CsvReconstructor, HeaderSpec, ReconstructError, union_csvs};
use crate::registry::EngineRegistry;
use crate::relabel::{RelabelError, ReverseMap, ValueRelabeler};
use crate::reverse::ReverseRelabeler;
use crate::stage::{ErrorCategory, StageError, StageRunner, timing_path, write_timing};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Errors raised while running a plan.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage '{stage}' failed")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("stage '{stage}': cannot format input")]
    Format {
        stage: String,
        #[source]
        source: FormatError,
    },

    #[error("stage '{stage}': value map error")]
    Relabel {
        stage: String,
        #[source]
        source: RelabelError,
    },

    #[error("stage '{stage}': cannot write output")]
    Reconstruct {
        stage: String,
        #[source]
        source: ReconstructError,
    },

    #[error("no engine registered for {0}")]
    EngineNotRegistered(OperatorKind),

    #[error("column '{column}' not found; available: {}", .available.join(", "))]
    UnknownColumn {
        column: String,
        available: Vec<String>,
    },

    #[error("cannot create scratch directory under {}", .root.display())]
    Scratch {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Stage { source, .. } => source.category(),
            PipelineError::Format { source, .. } => match source {
                FormatError::Io(_) | FormatError::Csv(_) => ErrorCategory::Io,
                _ => ErrorCategory::Configuration,
            },
            PipelineError::Relabel { source, .. } => match source {
                RelabelError::Io(_) => ErrorCategory::Io,
                _ => ErrorCategory::ContractViolation,
            },
            PipelineError::EngineNotRegistered(_) | PipelineError::UnknownColumn { .. } => {
                ErrorCategory::Configuration
            }
            PipelineError::Reconstruct { .. }
            | PipelineError::Scratch { .. }
            | PipelineError::Io(_) => ErrorCategory::Io,
        }
    }

    /// The stage the error belongs to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::Stage { stage, .. }
            | PipelineError::Format { stage, .. }
            | PipelineError::Relabel { stage, .. }
            | PipelineError::Reconstruct { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// What happens to the scratch directory when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Cleanup {
    #[default]
    Remove,
    Keep,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Parent of per-run scratch directories.
    pub scratch_root: PathBuf,
    pub cleanup: Cleanup,
    /// Delimiter of every CSV the pipeline writes.
    pub output_delimiter: u8,
    /// Engine exit codes treated as success.
    pub success_codes: Vec<i32>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir(),
            cleanup: Cleanup::Remove,
            output_delimiter: b',',
            success_codes: vec![0, 1],
        }
    }
}

static NEXT_SCRATCH: AtomicU64 = AtomicU64::new(0);

/// Per-run directory for intermediate files.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    cleanup: Cleanup,
}

impl ScratchDir {
    /// Create `obliq-<pid>-<n>` under `root`.
    pub fn create(root: &Path, cleanup: Cleanup) -> Result<Self, PipelineError> {
        let scratch_err = |source| PipelineError::Scratch {
            root: root.to_path_buf(),
            source,
        };
        fs::create_dir_all(root).map_err(scratch_err)?;
        loop {
            let n = NEXT_SCRATCH.fetch_add(1, Ordering::Relaxed);
            let path = root.join(format!("obliq-{}-{n}", std::process::id()));
            match fs::create_dir(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "created scratch directory");
                    return Ok(Self { path, cleanup });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(scratch_err(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn cleanup(&self) -> Cleanup {
        self.cleanup
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match self.cleanup {
            Cleanup::Keep => {
                tracing::info!(path = %self.path.display(), "keeping scratch directory");
            }
            Cleanup::Remove => {
                if let Err(e) = fs::remove_dir_all(&self.path) {
                    tracing::warn!(path = %self.path.display(), "failed to remove scratch directory: {e}");
                }
            }
        }
    }
}

/// Elapsed engine time per stage.
#[derive(Debug, Clone, Default)]
pub struct TimingLedger {
    stages: Vec<(String, Option<f64>)>,
}

impl TimingLedger {
    pub fn record(&mut self, stage: impl Into<String>, elapsed: Option<f64>) {
        self.stages.push((stage.into(), elapsed));
    }

    pub fn stages(&self) -> &[(String, Option<f64>)] {
        &self.stages
    }

    /// Sum of the reported times. Stages that reported nothing count as zero.
    pub fn total(&self) -> f64 {
        self.stages.iter().filter_map(|(_, t)| *t).sum()
    }

    /// Write the total next to `output`, if any stage reported a time.
    pub fn finish(&self, output: &Path) -> std::io::Result<Option<PathBuf>> {
        if self.stages.iter().all(|(_, t)| t.is_none()) {
            tracing::debug!("no stage reported a time");
            return Ok(None);
        }
        let path = timing_path(output);
        write_timing(&path, self.total())?;
        Ok(Some(path))
    }
}

/// Equi-join of two tables.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub left: TableSpec,
    pub right: TableSpec,
    /// Run the foreign-key join instead of the general one.
    pub foreign_key: bool,
}

impl JoinSpec {
    pub fn operator(&self) -> OperatorKind {
        if self.foreign_key {
            OperatorKind::FkJoin
        } else {
            OperatorKind::Join
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub table: TableSpec,
    pub predicate: FilterPredicate,
}

/// Group aggregate; the table needs a value column.
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub table: TableSpec,
}

/// Columns of a newest-first sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortColumns {
    pub timestamp: String,
    /// Integer id, used as the tie-break.
    pub id: String,
    pub payload: Vec<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SortSpec {
    pub source: CsvSource,
    pub columns: SortColumns,
}

/// Both directions of an edge table, each joined with a node table and
/// filtered on the anchor endpoint, then unioned.
#[derive(Debug, Clone)]
pub struct SymmetricJoinSpec {
    pub edges: CsvSource,
    pub endpoints: [String; 2],
    pub nodes: TableSpec,
    pub predicate: FilterPredicate,
}

/// Outcome of one stage.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    /// `None` for stages that do not call the engine.
    pub operator: Option<OperatorKind>,
    pub output: PathBuf,
    pub columns: Vec<String>,
    pub rows: usize,
    /// Input, engine, and reconstruction rows that were dropped.
    pub skipped: usize,
    pub unmapped: usize,
    pub elapsed: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub output: PathBuf,
    pub stages: Vec<StageReport>,
    pub total_secs: f64,
    /// Set when the scratch directory was kept.
    pub scratch: Option<PathBuf>,
}

/// Runs plans against a set of engines.
#[derive(Clone)]
pub struct Pipeline {
    registry: EngineRegistry,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(registry: EngineRegistry, options: PipelineOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Start a run with its own scratch directory.
    pub fn start(&self) -> Result<PipelineRun<'_>, PipelineError> {
        let scratch = ScratchDir::create(&self.options.scratch_root, self.options.cleanup)?;
        Ok(PipelineRun {
            pipeline: self,
            scratch,
            ledger: TimingLedger::default(),
            stages: Vec::new(),
        })
    }

    pub fn join(&self, spec: &JoinSpec, output: &Path) -> Result<RunReport, PipelineError> {
        let mut run = self.start()?;
        run.join(spec, output)?;
        run.finish(output)
    }

    pub fn filter(&self, spec: &FilterSpec, output: &Path) -> Result<RunReport, PipelineError> {
        let mut run = self.start()?;
        run.filter(spec, output)?;
        run.finish(output)
    }

    pub fn aggregate(&self, spec: &AggregateSpec, output: &Path) -> Result<RunReport, PipelineError> {
        let mut run = self.start()?;
        run.aggregate(spec, output)?;
        run.finish(output)
    }

    pub fn sort_desc(&self, spec: &SortSpec, output: &Path) -> Result<RunReport, PipelineError> {
        let mut run = self.start()?;
        run.sort_desc(spec, output)?;
        run.finish(output)
    }

    pub fn union(&self, inputs: &[PathBuf], output: &Path) -> Result<RunReport, PipelineError> {
        let mut run = self.start()?;
        run.union(inputs, output)?;
        run.finish(output)
    }

    pub fn join_then_filter(
        &self,
        join: &JoinSpec,
        column: &str,
        predicate: FilterPredicate,
        output: &Path,
    ) -> Result<RunReport, PipelineError> {
        let mut run = self.start()?;
        run.join_then_filter(join, column, predicate, output)?;
        run.finish(output)
    }

    pub fn filter_then_sort(
        &self,
        filter: &FilterSpec,
        sort: &SortColumns,
        output: &Path,
    ) -> Result<RunReport, PipelineError> {
        let mut run = self.start()?;
        run.filter_then_sort(filter, sort, output)?;
        run.finish(output)
    }

    pub fn symmetric_join(&self, spec: &SymmetricJoinSpec, output: &Path) -> Result<RunReport, PipelineError> {
        let mut run = self.start()?;
        run.symmetric_join(spec, output)?;
        run.finish(output)
    }
}

/// One invocation of a plan: a scratch directory and the stages run so far.
pub struct PipelineRun<'p> {
    pipeline: &'p Pipeline,
    scratch: ScratchDir,
    ledger: TimingLedger,
    stages: Vec<StageReport>,
}

impl PipelineRun<'_> {
    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    pub fn stages(&self) -> &[StageReport] {
        &self.stages
    }

    /// Source for a CSV this run wrote.
    pub fn source(&self, path: impl Into<PathBuf>) -> CsvSource {
        CsvSource::new(path).delimiter(self.pipeline.options.output_delimiter)
    }

    fn next_name(&self, label: &str) -> String {
        format!("{:02}_{label}", self.stages.len() + 1)
    }

    pub fn join(&mut self, spec: &JoinSpec, output: &Path) -> Result<StageReport, PipelineError> {
        let operator = spec.operator();
        let name = self.next_name(operator.name());
        let input = RecordFormatter::new(operator)
            .format(&spec.left, Some(&spec.right))
            .map_err(|source| PipelineError::Format {
                stage: name.clone(),
                source,
            })?;
        let header = HeaderSpec::join(
            &key_name(&spec.left.key),
            &spec.left.payload,
            &spec.right.payload,
        );
        self.engine_stage(name, input, None, header, None, output)
    }

    pub fn filter(&mut self, spec: &FilterSpec, output: &Path) -> Result<StageReport, PipelineError> {
        let name = self.next_name("filter");
        let input = RecordFormatter::new(OperatorKind::Filter)
            .format(&spec.table, None)
            .map_err(|source| PipelineError::Format {
                stage: name.clone(),
                source,
            })?;
        let header = HeaderSpec::filter(key_name(&spec.table.key), spec.table.payload.clone());
        self.engine_stage(name, input, Some(spec.predicate), header, None, output)
    }

    pub fn aggregate(&mut self, spec: &AggregateSpec, output: &Path) -> Result<StageReport, PipelineError> {
        let name = self.next_name("aggregate");
        let input = RecordFormatter::new(OperatorKind::Aggregate)
            .format(&spec.table, None)
            .map_err(|source| PipelineError::Format {
                stage: name.clone(),
                source,
            })?;
        let header = HeaderSpec::aggregate(key_name(&spec.table.key), spec.table.payload.clone());
        self.engine_stage(name, input, None, header, None, output)
    }

    /// Newest first, ties broken by larger id first.
    pub fn sort_desc(&mut self, spec: &SortSpec, output: &Path) -> Result<StageReport, PipelineError> {
        let name = self.next_name("sort");
        let cols = &spec.columns;
        let table = TableSpec::sort_key(spec.source.clone(), &cols.timestamp, &cols.id)
            .value(&cols.id)
            .payload(cols.payload.iter().cloned());
        let input = RecordFormatter::new(OperatorKind::Aggregate)
            .format(&table, None)
            .map_err(|source| PipelineError::Format {
                stage: name.clone(),
                source,
            })?;
        let mut seen = HashSet::new();
        let collisions = input.rows().filter(|row| !seen.insert(row.key.as_str())).count();
        if collisions > 0 {
            tracing::warn!(
                stage = %name,
                collisions,
                "rows sharing a timestamp and id collapse into one output row"
            );
        }
        let header = HeaderSpec::sort(cols.payload.clone());
        self.engine_stage(name, input, None, header, cols.limit, output)
    }

    pub fn union(&mut self, inputs: &[PathBuf], output: &Path) -> Result<StageReport, PipelineError> {
        let name = self.next_name("union");
        tracing::info!(stage = %name, inputs = inputs.len(), "running stage");
        create_parent(output)?;
        let rows = union_csvs(inputs, output, self.pipeline.options.output_delimiter).map_err(
            |source| PipelineError::Reconstruct {
                stage: name.clone(),
                source,
            },
        )?;
        let columns = crate::format::csv_header(&self.source(output)).map_err(|source| {
            PipelineError::Format {
                stage: name.clone(),
                source,
            }
        })?;
        let report = StageReport {
            name,
            operator: None,
            output: output.to_path_buf(),
            columns,
            rows,
            skipped: 0,
            unmapped: 0,
            elapsed: None,
        };
        self.stages.push(report.clone());
        Ok(report)
    }

    /// Join, then filter on a column of the join result.
    ///
    /// `column` may be bare (`id`) or qualified (`t2.id`). Every other join
    /// column is carried as payload.
    pub fn join_then_filter(
        &mut self,
        join: &JoinSpec,
        column: &str,
        predicate: FilterPredicate,
        output: &Path,
    ) -> Result<StageReport, PipelineError> {
        let joined = self.scratch.file(&format!("{}.csv", self.next_name("joined")));
        let join_report = self.join(join, &joined)?;
        let key = qualify_column(column, &join_report.columns)?;
        let payload: Vec<String> = join_report
            .columns
            .iter()
            .filter(|c| **c != key)
            .cloned()
            .collect();
        let filter = FilterSpec {
            table: TableSpec::new(self.source(&joined), key).payload(payload),
            predicate,
        };
        self.filter(&filter, output)
    }

    /// Filter, then sort the survivors newest first.
    pub fn filter_then_sort(
        &mut self,
        filter: &FilterSpec,
        sort: &SortColumns,
        output: &Path,
    ) -> Result<StageReport, PipelineError> {
        let filtered = self.scratch.file(&format!("{}.csv", self.next_name("filtered")));
        let report = self.filter(filter, &filtered)?;
        for column in [&sort.timestamp, &sort.id].into_iter().chain(&sort.payload) {
            qualify_column(column, &report.columns)?;
        }
        let spec = SortSpec {
            source: self.source(&filtered),
            columns: sort.clone(),
        };
        self.sort_desc(&spec, output)
    }

    /// Neighbors of the nodes matching the predicate, from both edge directions.
    pub fn symmetric_join(&mut self, spec: &SymmetricJoinSpec, output: &Path) -> Result<StageReport, PipelineError> {
        let [a, b] = &spec.endpoints;
        let mut parts = Vec::with_capacity(2);
        for (anchor, neighbor) in [(a, b), (b, a)] {
            let join = JoinSpec {
                left: TableSpec::new(spec.edges.clone(), neighbor.as_str()).payload([anchor.as_str()]),
                right: spec.nodes.clone(),
                foreign_key: false,
            };
            let part = self.scratch.file(&format!("{}.csv", self.next_name("direction")));
            self.join_then_filter(&join, anchor, spec.predicate, &part)?;
            parts.push(part);
        }
        self.union(&parts, output)
    }

    fn engine_stage(
        &mut self,
        name: String,
        input: StageInput,
        predicate: Option<FilterPredicate>,
        header: HeaderSpec,
        limit: Option<usize>,
        output: &Path,
    ) -> Result<StageReport, PipelineError> {
        let operator = input.operator;
        let stage_err = |source: StageError| PipelineError::Stage {
            stage: name.clone(),
            source,
        };
        let engine = self.pipeline.registry.require(operator)?;
        tracing::info!(stage = %name, %operator, rows = input.len(), "running stage");
        if input.is_empty() {
            tracing::warn!(stage = %name, "stage input has no rows");
        }

        let format_path = self.scratch.file(&format!("{name}_format.txt"));
        input.save(&format_path)?;

        let mut relabeler = ValueRelabeler::new(operator.input_roles());
        if operator == OperatorKind::Aggregate {
            // The engine emits groups in id order.
            let mut keys: Vec<&str> = input.rows().map(|r| r.key.as_str()).collect();
            keys.sort_unstable();
            keys.dedup();
            relabeler.seed_ordered(keys);
        }
        let relabel_path = self.scratch.file(&format!("{name}_relabel.txt"));
        let mut writer = BufWriter::new(File::create(&relabel_path)?);
        writeln!(writer, "{}", input.header())?;
        for row in input.rows() {
            let fields = row.fields();
            let relabeled = relabeler.relabel_fields(&fields).ok_or_else(|| {
                stage_err(StageError::ContractViolation {
                    operator,
                    detail: format!(
                        "input row has {} fields, operator takes {}",
                        fields.len(),
                        relabeler.roles().len()
                    ),
                })
            })?;
            writeln!(writer, "{}", relabeled.join(" "))?;
        }
        writer.flush()?;
        drop(writer);

        let map_path = self.scratch.file(&format!("{name}_map.txt"));
        let relabel_err = |source| PipelineError::Relabel {
            stage: name.clone(),
            source,
        };
        relabeler.into_map().save(&map_path).map_err(relabel_err)?;
        tracing::debug!(map = %map_path.display(), "wrote value map");

        let request = EngineRequest {
            operator,
            input: relabel_path,
            predicate,
        };
        let stage = StageRunner::new()
            .success_codes(self.pipeline.options.success_codes.clone())
            .run(engine.as_ref(), &request)
            .map_err(stage_err)?;

        let map = ReverseMap::load(&map_path).map_err(relabel_err)?;
        let reversed = self.scratch.file(&format!("{name}_reversed.txt"));
        let reverse = ReverseRelabeler::new(map, operator)
            .reverse_file(&stage.raw_output, &reversed)
            .map_err(stage_err)?;

        create_parent(output)?;
        let rebuilt = CsvReconstructor::new(header.clone())
            .delimiter(self.pipeline.options.output_delimiter)
            .limit(limit)
            .reconstruct(&reversed, output)
            .map_err(|source| PipelineError::Reconstruct {
                stage: name.clone(),
                source,
            })?;

        if let Some(secs) = stage.elapsed {
            write_timing(&timing_path(output), secs)?;
        }
        self.ledger.record(name.as_str(), stage.elapsed);

        let report = StageReport {
            name,
            operator: Some(operator),
            output: output.to_path_buf(),
            columns: header.columns(),
            rows: rebuilt.rows,
            skipped: input.skipped + reverse.skipped + rebuilt.skipped,
            unmapped: reverse.unmapped,
            elapsed: stage.elapsed,
        };
        tracing::info!(
            stage = %report.name,
            rows = report.rows,
            skipped = report.skipped,
            elapsed = ?report.elapsed,
            "stage finished"
        );
        self.stages.push(report.clone());
        Ok(report)
    }

    /// Write the total time next to `output` and end the run.
    pub fn finish(self, output: &Path) -> Result<RunReport, PipelineError> {
        self.ledger.finish(output)?;
        let scratch = (self.scratch.cleanup() == Cleanup::Keep).then(|| self.scratch.path().to_path_buf());
        Ok(RunReport {
            output: output.to_path_buf(),
            total_secs: self.ledger.total(),
            stages: self.stages,
            scratch,
        })
    }
}

fn key_name(key: &KeySource) -> String {
    match key {
        KeySource::Column(c) => c.clone(),
        KeySource::SortKey { .. } => "sort_key".to_string(),
    }
}

fn create_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Resolve a column reference against a stage's output columns.
///
/// Exact matches win; otherwise a bare name matches `t1.<name>` before
/// `t2.<name>`.
pub fn qualify_column(column: &str, columns: &[String]) -> Result<String, PipelineError> {
    if columns.iter().any(|c| c == column) {
        return Ok(column.to_string());
    }
    ["t1", "t2"]
        .iter()
        .map(|prefix| format!("{prefix}.{column}"))
        .find(|q| columns.contains(q))
        .ok_or_else(|| PipelineError::UnknownColumn {
            column: column.to_string(),
            available: columns.to_vec(),
        })
}
