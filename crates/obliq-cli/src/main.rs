//! Obliq CLI - relational queries over an oblivious integer engine

mod config;
mod errors;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use config::{Config, EngineKind};
use indicatif::{ProgressBar, ProgressStyle};
use obliq_core::{
    AggregateSpec, Cleanup, Comparator, CsvSource, EngineRegistry, EngineSettings, FilterPredicate,
    FilterSpec, JoinSpec, OperatorKind, Pipeline, PipelineOptions, ReverseMap, ReverseRelabeler,
    RunReport, SortColumns, SortSpec, Strictness, TableSpec, ValueRelabeler, Workflow,
};
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Verbosity level for output.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    fn debug(self, msg: &str) {
        if matches!(self, Verbosity::Verbose) {
            println!("[debug] {msg}");
        }
    }

    fn result(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            println!("{msg}");
        }
    }

    fn log_filter(self) -> &'static str {
        match self {
            Verbosity::Quiet => "obliq=error,obliq_core=error",
            Verbosity::Normal => "obliq=info,obliq_core=info",
            Verbosity::Verbose => "obliq=debug,obliq_core=debug",
        }
    }

    /// Spinner for a long-running command, hidden unless output is normal.
    fn spinner(self, msg: &str) -> Option<ProgressBar> {
        if self != Verbosity::Normal {
            return None;
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]") {
            pb.set_style(style);
        }
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    }
}

#[derive(Parser)]
#[command(name = "obliq")]
#[command(about = "Relational queries over an oblivious integer engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine that runs each stage
    #[arg(long, global = true, value_enum)]
    engine: Option<EngineKind>,

    /// Config file (default: ~/.config/obliq/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keep the scratch directory of each run
    #[arg(long, global = true)]
    keep_scratch: bool,

    /// Parent directory for scratch directories
    #[arg(long, global = true)]
    scratch_dir: Option<PathBuf>,

    /// Delimiter of input CSV files
    #[arg(long, global = true)]
    input_delimiter: Option<char>,

    /// Delimiter of written CSV files
    #[arg(long, global = true)]
    delimiter: Option<char>,

    /// Verbose output (show stages and timings)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// `--where <column> --cmp <op> --threshold <n>` as a unit.
#[derive(clap::Args)]
struct WhereArgs {
    /// Integer column the predicate applies to
    #[arg(long = "where", requires_all = ["cmp", "threshold"])]
    column: Option<String>,
    /// Comparator: < > == <= >= !=
    #[arg(long)]
    cmp: Option<Comparator>,
    /// Right-hand side of the comparison
    #[arg(long, allow_negative_numbers = true)]
    threshold: Option<i64>,
}

impl WhereArgs {
    fn predicate(&self) -> Option<(&str, FilterPredicate)> {
        match (&self.column, self.cmp, self.threshold) {
            (Some(column), Some(cmp), Some(threshold)) => {
                Some((column.as_str(), FilterPredicate::new(cmp, threshold)))
            }
            _ => None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Keep rows whose integer key satisfies a comparison
    Filter {
        /// Input CSV
        input: PathBuf,
        /// Integer column compared against the threshold
        #[arg(long)]
        key: String,
        /// Columns carried through (comma-separated)
        #[arg(long, value_delimiter = ',')]
        payload: Vec<String>,
        /// Comparator: < > == <= >= !=
        #[arg(long)]
        cmp: Comparator,
        #[arg(long, allow_negative_numbers = true)]
        threshold: i64,
        /// Output CSV
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Equi-join two tables, optionally filtering the result
    Join {
        left: PathBuf,
        right: PathBuf,
        #[arg(long)]
        left_key: String,
        #[arg(long)]
        right_key: String,
        #[arg(long, value_delimiter = ',')]
        left_payload: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        right_payload: Vec<String>,
        /// Left key references a unique id on the right
        #[arg(long)]
        fk: bool,
        #[command(flatten)]
        filter: WhereArgs,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Group by a column and sum an integer column
    Aggregate {
        input: PathBuf,
        #[arg(long)]
        group: String,
        /// Integer column summed per group
        #[arg(long)]
        value: String,
        #[arg(long, value_delimiter = ',')]
        payload: Vec<String>,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Order rows newest first by timestamp, then id
    Sort {
        input: PathBuf,
        /// Timestamp column (RFC 3339 or epoch seconds)
        #[arg(long)]
        timestamp: String,
        /// Integer id column breaking timestamp ties
        #[arg(long)]
        id: String,
        #[arg(long, value_delimiter = ',')]
        payload: Vec<String>,
        /// Keep at most this many rows
        #[arg(long)]
        limit: Option<usize>,
        /// Filter before sorting
        #[command(flatten)]
        filter: WhereArgs,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Concatenate CSVs under the first file's header
    Union {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run a workflow file
    Run {
        /// Workflow file (YAML, TOML, or JSON)
        workflow: PathBuf,
        /// Override the workflow's output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a workflow and show its steps without executing
    Plan {
        workflow: PathBuf,
    },

    /// Relabel an engine-format file to dense ids
    Relabel {
        input: PathBuf,
        /// Operator the file is for (join, fk_join, filter, aggregate)
        #[arg(long)]
        operator: OperatorKind,
        /// Where to write the value map
        #[arg(long)]
        map: PathBuf,
        /// Fail on rows with the wrong number of fields
        #[arg(long)]
        strict: bool,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Map engine output ids back to values
    Reverse {
        input: PathBuf,
        #[arg(long)]
        operator: OperatorKind,
        /// Value map written by the relabel step
        #[arg(long)]
        map: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Set the payload width compiled into every operator
    SetPayloadSize {
        size: usize,
    },

    /// Rebuild operator trees
    Build {
        /// Only this operator
        #[arg(long)]
        operator: Option<OperatorKind>,
    },

    /// List the engines used for each operator
    Engines,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Settings merged from flags and the config file.
struct Session {
    verbosity: Verbosity,
    engine: EngineKind,
    settings: EngineSettings,
    options: PipelineOptions,
    input_delimiter: u8,
}

impl Session {
    fn new(cli: &Cli, config: Config) -> Result<Self> {
        let verbose = cli.verbose || config.defaults.verbose;
        let quiet = cli.quiet || (config.defaults.quiet && !cli.verbose);
        let verbosity = Verbosity::from_flags(verbose, quiet);

        let mut options = PipelineOptions::default();
        if let Some(dir) = cli.scratch_dir.clone().or(config.defaults.scratch_dir) {
            options.scratch_root = dir;
        }
        if cli.keep_scratch || config.defaults.keep_scratch {
            options.cleanup = Cleanup::Keep;
        }
        if let Some(d) = cli.delimiter.or(config.defaults.delimiter) {
            options.output_delimiter = ascii_delimiter(d)?;
        }
        options.success_codes = config.engine.success_codes.clone();

        let input_delimiter = match cli.input_delimiter.or(config.defaults.input_delimiter) {
            Some(d) => ascii_delimiter(d)?,
            None => b',',
        };

        Ok(Self {
            verbosity,
            engine: cli.engine.unwrap_or(config.defaults.engine),
            settings: config.engine,
            options,
            input_delimiter,
        })
    }

    fn registry(&self) -> EngineRegistry {
        match self.engine {
            EngineKind::Reference => EngineRegistry::reference(),
            EngineKind::External => EngineRegistry::external(&self.settings),
        }
    }

    fn pipeline(&self) -> Result<Pipeline> {
        if self.engine == EngineKind::External {
            self.settings.validate().context("invalid [engine] settings")?;
        }
        Ok(Pipeline::new(self.registry(), self.options.clone()))
    }

    fn source(&self, path: &Path) -> Result<CsvSource> {
        if let Err(e) = std::fs::metadata(path) {
            bail!(errors::file_read_error(path, &e));
        }
        Ok(CsvSource::new(path).delimiter(self.input_delimiter))
    }

    /// Run `f` under a spinner and print the report.
    fn run<F>(&self, label: &str, f: F) -> Result<()>
    where
        F: FnOnce(&Pipeline) -> Result<RunReport>,
    {
        let pipeline = self.pipeline()?;
        let spinner = self.verbosity.spinner(&format!("Running {label}"));
        let result = f(&pipeline);
        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }
        self.report(&result?);
        Ok(())
    }

    fn report(&self, report: &RunReport) {
        let v = self.verbosity;
        for stage in &report.stages {
            let elapsed = stage
                .elapsed
                .map(|s| format!("{s:.3}s"))
                .unwrap_or_else(|| "-".to_string());
            v.debug(&format!(
                "{}: {} rows, {} skipped, {} unmapped, {elapsed} -> {}",
                stage.name,
                stage.rows,
                stage.skipped,
                stage.unmapped,
                stage.output.display()
            ));
        }
        let rows = report.stages.last().map_or(0, |s| s.rows);
        v.result(&format!(
            "Wrote {} ({rows} rows, {} stages, {:.3}s engine time)",
            report.output.display(),
            report.stages.len(),
            report.total_secs
        ));
        if let Some(scratch) = &report.scratch {
            v.result(&format!("Scratch kept at {}", scratch.display()));
        }
    }
}

fn ascii_delimiter(c: char) -> Result<u8> {
    if !c.is_ascii() {
        bail!("delimiter '{c}' is not a single ASCII character");
    }
    Ok(c as u8)
}

fn init_tracing(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.log_filter()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load_from_path(Some(path.clone())),
        None => Config::load(),
    };

    let ctx = match Session::new(&cli, config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };
    init_tracing(ctx.verbosity);
    tracing::debug!(
        engine = ?ctx.engine,
        scratch = %ctx.options.scratch_root.display(),
        "session ready"
    );

    match dispatch(cli.command, &ctx) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            if let Some(hint) = errors::hint(&e) {
                eprintln!("\n{hint}");
            }
            ExitCode::from(errors::exit_code(&e))
        }
    }
}

fn dispatch(command: Commands, ctx: &Session) -> Result<()> {
    match command {
        Commands::Filter {
            input,
            key,
            payload,
            cmp,
            threshold,
            output,
        } => {
            let spec = FilterSpec {
                table: TableSpec::new(ctx.source(&input)?, key).payload(payload),
                predicate: FilterPredicate::new(cmp, threshold),
            };
            ctx.run("filter", |p| Ok(p.filter(&spec, &output)?))
        }

        Commands::Join {
            left,
            right,
            left_key,
            right_key,
            left_payload,
            right_payload,
            fk,
            filter,
            output,
        } => {
            let spec = JoinSpec {
                left: TableSpec::new(ctx.source(&left)?, left_key).payload(left_payload),
                right: TableSpec::new(ctx.source(&right)?, right_key).payload(right_payload),
                foreign_key: fk,
            };
            match filter.predicate() {
                Some((column, predicate)) => ctx.run("join, filter", |p| {
                    Ok(p.join_then_filter(&spec, column, predicate, &output)?)
                }),
                None => ctx.run("join", |p| Ok(p.join(&spec, &output)?)),
            }
        }

        Commands::Aggregate {
            input,
            group,
            value,
            payload,
            output,
        } => {
            let spec = AggregateSpec {
                table: TableSpec::new(ctx.source(&input)?, group)
                    .value(value)
                    .payload(payload),
            };
            ctx.run("aggregate", |p| Ok(p.aggregate(&spec, &output)?))
        }

        Commands::Sort {
            input,
            timestamp,
            id,
            payload,
            limit,
            filter,
            output,
        } => {
            let source = ctx.source(&input)?;
            let columns = SortColumns {
                timestamp,
                id,
                payload,
                limit,
            };
            match filter.predicate() {
                Some((key, predicate)) => {
                    let carried = sort_carried_columns(key, &columns);
                    let spec = FilterSpec {
                        table: TableSpec::new(source, key).payload(carried),
                        predicate,
                    };
                    ctx.run("filter, sort", |p| Ok(p.filter_then_sort(&spec, &columns, &output)?))
                }
                None => {
                    let spec = SortSpec { source, columns };
                    ctx.run("sort", |p| Ok(p.sort_desc(&spec, &output)?))
                }
            }
        }

        Commands::Union { inputs, output } => {
            for input in &inputs {
                ctx.source(input)?;
            }
            ctx.run("union", |p| Ok(p.union(&inputs, &output)?))
        }

        Commands::Run { workflow, output } => {
            let mut workflow = load_workflow(&workflow)?;
            if output.is_some() {
                workflow.output = output;
            }
            workflow.validate()?;
            let label = workflow.name.clone().unwrap_or_else(|| "workflow".to_string());
            ctx.run(&label, |p| Ok(workflow.execute(p)?))
        }

        Commands::Plan { workflow } => {
            let path = workflow;
            let workflow = load_workflow(&path)?;
            workflow.validate()?;
            let v = ctx.verbosity;
            v.result(&format!(
                "{} ({} steps)",
                workflow.name.as_deref().unwrap_or(&path.display().to_string()),
                workflow.steps.len()
            ));
            for (i, step) in workflow.steps.iter().enumerate() {
                v.result(&format!("  {}. {step}", i + 1));
            }
            if let Some(output) = &workflow.output {
                v.result(&format!("  -> {}", output.display()));
            }
            Ok(())
        }

        Commands::Relabel {
            input,
            operator,
            map,
            strict,
            output,
        } => relabel(ctx, &input, operator, &map, strict, &output),

        Commands::Reverse {
            input,
            operator,
            map,
            output,
        } => {
            let values = ReverseMap::load(&map)
                .with_context(|| format!("loading value map {}", map.display()))?;
            let stats = ReverseRelabeler::new(values, operator).reverse_file(&input, &output)?;
            ctx.verbosity.result(&format!(
                "Reversed {} rows ({} skipped, {} unmapped) -> {}",
                stats.rows,
                stats.skipped,
                stats.unmapped,
                output.display()
            ));
            Ok(())
        }

        Commands::SetPayloadSize { size } => {
            if size == 0 {
                bail!("payload size must be positive");
            }
            let patched = obliq_core::set_payload_sizes(&ctx.settings, size)?;
            for header in patched {
                ctx.verbosity
                    .result(&format!("DATA_LENGTH {size} in {}", header.display()));
            }
            Ok(())
        }

        Commands::Build { operator } => {
            let built = match operator {
                Some(op) => {
                    let dir = ctx.settings.operator_dir(op)?;
                    obliq_core::build(&dir)?;
                    vec![dir]
                }
                None => obliq_core::build_all(&ctx.settings)?,
            };
            for dir in built {
                ctx.verbosity.result(&format!("Built {}", dir.display()));
            }
            Ok(())
        }

        Commands::Engines => {
            for (operator, engine) in ctx.registry().iter() {
                let location = match ctx.engine {
                    EngineKind::Reference => "in-process".to_string(),
                    EngineKind::External => match ctx.settings.operator_dir(operator) {
                        Ok(dir) if dir.is_dir() => dir.display().to_string(),
                        Ok(dir) => format!("{} (missing)", dir.display()),
                        Err(e) => e.to_string(),
                    },
                };
                println!("{:<10} {:<10} {location}", operator.name(), engine.name());
            }
            Ok(())
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "obliq", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn load_workflow(path: &Path) -> Result<Workflow> {
    let data = std::fs::read(path).map_err(|e| anyhow::anyhow!(errors::file_read_error(path, &e)))?;
    let workflow = Workflow::from_bytes(&data, path.to_str())
        .with_context(|| format!("parsing workflow {}", path.display()))?;
    Ok(workflow)
}

/// Columns a filter must carry so the sort after it can see them.
fn sort_carried_columns(key: &str, columns: &SortColumns) -> Vec<String> {
    let mut carried: Vec<String> = Vec::new();
    for column in [&columns.timestamp, &columns.id].into_iter().chain(&columns.payload) {
        if column != key && !carried.contains(column) {
            carried.push(column.clone());
        }
    }
    carried
}

fn relabel(
    ctx: &Session,
    input: &Path,
    operator: OperatorKind,
    map: &Path,
    strict: bool,
    output: &Path,
) -> Result<()> {
    let open = || -> Result<BufReader<std::fs::File>> {
        let file = std::fs::File::open(input).map_err(|e| anyhow::anyhow!(errors::file_read_error(input, &e)))?;
        Ok(BufReader::new(file))
    };

    let strictness = if strict {
        Strictness::Strict
    } else {
        Strictness::Permissive
    };
    let mut relabeler = ValueRelabeler::new(operator.input_roles()).strictness(strictness);

    // Groups come back in id order, so group keys get ids in sorted order.
    if operator == OperatorKind::Aggregate {
        let mut keys = Vec::new();
        for line in open()?.lines().skip(1) {
            let line = line?;
            if let Some(key) = line.split(' ').next().filter(|k| !k.is_empty()) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        keys.dedup();
        relabeler.seed_ordered(keys);
    }

    let writer = BufWriter::new(
        std::fs::File::create(output).with_context(|| format!("creating {}", output.display()))?,
    );
    let stats = relabeler.relabel_stream(open()?, writer)?;
    let values = relabeler.into_map();
    values.save(map)?;

    ctx.verbosity.result(&format!(
        "Relabeled {} rows ({} passed through), {} distinct values -> {}",
        stats.rows,
        stats.passed_through,
        values.len(),
        output.display()
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_negative_threshold() {
        let cli = Cli::try_parse_from([
            "obliq", "filter", "in.csv", "--key", "k", "--cmp", ">=", "--threshold", "-5", "-o",
            "out.csv",
        ])
        .unwrap();
        match cli.command {
            Commands::Filter { threshold, cmp, .. } => {
                assert_eq!(threshold, -5);
                assert_eq!(cmp, Comparator::Ge);
            }
            _ => panic!("expected filter"),
        }
    }

    #[test]
    fn test_sort_carried_columns() {
        let columns = SortColumns {
            timestamp: "creationDate".into(),
            id: "id".into(),
            payload: vec!["content".into(), "id".into()],
            limit: Some(10),
        };
        assert_eq!(
            sort_carried_columns("creator", &columns),
            vec!["creationDate", "id", "content"]
        );
        assert_eq!(
            sort_carried_columns("id", &columns),
            vec!["creationDate", "content"]
        );
    }

    #[test]
    fn test_where_requires_all_parts() {
        let result = Cli::try_parse_from([
            "obliq", "join", "a.csv", "b.csv", "--left-key", "x", "--right-key", "y", "--where",
            "x", "-o", "out.csv",
        ]);
        assert!(result.is_err());
    }
}
