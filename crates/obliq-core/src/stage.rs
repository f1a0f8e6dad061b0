//! Running one operator against a prepared input file.

use crate::engine::{Engine, EngineRequest, EngineRun, OperatorKind};
use crate::patch::PatchError;
use std::path::{Path, PathBuf};

/// Suffix the engine appends to the input stem when naming its output.
pub const OUTPUT_SUFFIX: &str = "_output.txt";

/// Errors raised while building or running the engine.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error(
        "build failed in {}: `{command}` exited with {}{}",
        .dir.display(), exit_label(.status), captured(.stdout, .stderr)
    )]
    Build {
        dir: PathBuf,
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("engine exited with unexpected code {code}{}", captured(.stdout, .stderr))]
    Execution {
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "engine output not found at {}; directory contains: [{}]",
        .expected.display(), .listing.join(", ")
    )]
    MissingOutput {
        expected: PathBuf,
        listing: Vec<String>,
    },

    #[error("{operator} output violates the engine contract: {detail}")]
    ContractViolation {
        operator: OperatorKind,
        detail: String,
    },

    #[error("malformed timing file {}: '{content}'", .path.display())]
    Timing { path: PathBuf, content: String },

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of failures, used for exit codes and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Build,
    Execution,
    ContractViolation,
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Build => "build",
            ErrorCategory::Execution => "execution",
            ErrorCategory::ContractViolation => "contract violation",
            ErrorCategory::Io => "i/o",
        })
    }
}

impl StageError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StageError::Config(_) => ErrorCategory::Configuration,
            StageError::Patch(PatchError::Io { .. }) => ErrorCategory::Io,
            StageError::Patch(_) => ErrorCategory::Configuration,
            StageError::Build { .. } => ErrorCategory::Build,
            StageError::Execution { .. } | StageError::Spawn { .. } => ErrorCategory::Execution,
            StageError::MissingOutput { .. }
            | StageError::ContractViolation { .. }
            | StageError::Timing { .. } => ErrorCategory::ContractViolation,
            StageError::Io(_) => ErrorCategory::Io,
        }
    }
}

fn exit_label(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

fn captured(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    if !stdout.trim().is_empty() {
        out.push_str("\n--- stdout ---\n");
        out.push_str(stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        out.push_str("\n--- stderr ---\n");
        out.push_str(stderr.trim_end());
    }
    out
}

/// Result of a successful stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// The engine's `<stem>_output.txt`.
    pub raw_output: PathBuf,
    /// Seconds reported on the first stdout line, if any.
    pub elapsed: Option<f64>,
    pub run: EngineRun,
}

/// Runs an engine and checks the file contract.
#[derive(Debug, Clone)]
pub struct StageRunner {
    success_codes: Vec<i32>,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self {
            success_codes: vec![0, 1],
        }
    }
}

impl StageRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit codes treated as success.
    pub fn success_codes(mut self, codes: impl Into<Vec<i32>>) -> Self {
        self.success_codes = codes.into();
        self
    }

    pub fn run(&self, engine: &dyn Engine, request: &EngineRequest) -> Result<StageOutput, StageError> {
        let input = request.input.canonicalize()?;
        let request = EngineRequest {
            input,
            ..request.clone()
        };

        tracing::info!(
            operator = %request.operator,
            engine = engine.name(),
            input = %request.input.display(),
            "running stage"
        );
        let run = engine.execute(&request)?;

        if !self.success_codes.contains(&run.exit_code) {
            return Err(StageError::Execution {
                code: run.exit_code,
                stdout: run.stdout,
                stderr: run.stderr,
            });
        }

        let raw_output = expected_output_path(&request.input);
        if !raw_output.is_file() {
            let listing = raw_output
                .parent()
                .map(list_dir)
                .unwrap_or_default();
            return Err(StageError::MissingOutput {
                expected: raw_output,
                listing,
            });
        }

        let elapsed = parse_elapsed(&run.stdout);
        tracing::debug!(output = %raw_output.display(), ?elapsed, code = run.exit_code, "stage finished");
        Ok(StageOutput {
            raw_output,
            elapsed,
            run,
        })
    }
}

/// `<dir>/<stem>_output.txt` for an input file.
pub fn expected_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}{OUTPUT_SUFFIX}"))
}

/// Parse the elapsed-seconds line the engine prints first.
pub fn parse_elapsed(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<f64>().ok())
        .filter(|secs| secs.is_finite())
}

/// Sidecar path holding the elapsed time for `output`.
pub fn timing_path(output: &Path) -> PathBuf {
    output.with_extension("time")
}

pub fn write_timing(path: &Path, secs: f64) -> std::io::Result<()> {
    std::fs::write(path, format!("{secs}\n"))
}

pub fn read_timing(path: &Path) -> Result<f64, StageError> {
    let content = std::fs::read_to_string(path)?;
    content.trim().parse().map_err(|_| StageError::Timing {
        path: path.to_path_buf(),
        content: content.trim().to_string(),
    })
}

fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
