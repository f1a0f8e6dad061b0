//! Subprocess-backed engine.
//!
//! Each operator lives in its own build tree under a common root. A run
//! optionally rebuilds the tree with `make`, then invokes
//! `<host-runner> <enclave-image> <threads> <absolute-input>` from inside it.

use crate::engine::{Engine, EngineRequest, EngineRun, FilterPredicate, OperatorKind};
use crate::patch::{FILTER_SOURCE, PAYLOAD_HEADER, SourcePatch, filter_substitutions, set_payload_size};
use crate::stage::StageError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Build variants and the subdirectory they live in.
const VARIANTS: &[(&str, Option<&str>)] = &[
    ("default", None),
    ("opaque_shared_memory", Some("opaque_shared_memory")),
];

/// How a filter predicate reaches the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterInjection {
    /// Rewrite placeholders in the engine source and rebuild.
    #[default]
    Patch,
    /// Append `<comparator> <threshold>` to the command line.
    Args,
}

/// Where the engine lives and how to drive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory containing one build tree per operator.
    pub root: PathBuf,
    /// `default` or `opaque_shared_memory`.
    pub variant: String,
    pub host_runner: String,
    pub enclave_image: String,
    pub threads: usize,
    /// Run `make clean && make` before every stage.
    pub rebuild: bool,
    pub filter_injection: FilterInjection,
    /// Per-operator directory overrides, keyed by operator name.
    pub dirs: IndexMap<String, PathBuf>,
    /// Exit codes treated as success.
    pub success_codes: Vec<i32>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .map(|h| h.join("obliviator"))
                .unwrap_or_else(|| PathBuf::from("obliviator")),
            variant: "default".into(),
            host_runner: "./host/parallel".into(),
            enclave_image: "./enclave/parallel_enc.signed".into(),
            threads: 1,
            rebuild: true,
            filter_injection: FilterInjection::default(),
            dirs: IndexMap::new(),
            success_codes: vec![0, 1],
        }
    }
}

impl EngineSettings {
    /// Check values that can be checked without touching the engine.
    pub fn validate(&self) -> Result<(), StageError> {
        self.variant_base()?;
        if self.threads == 0 {
            return Err(StageError::Config("threads must be at least 1".into()));
        }
        for name in self.dirs.keys() {
            name.parse::<OperatorKind>()
                .map_err(|e| StageError::Config(e.to_string()))?;
        }
        Ok(())
    }

    fn variant_base(&self) -> Result<PathBuf, StageError> {
        let (_, sub) = VARIANTS
            .iter()
            .find(|(name, _)| *name == self.variant)
            .ok_or_else(|| {
                let known: Vec<&str> = VARIANTS.iter().map(|(n, _)| *n).collect();
                StageError::Config(format!(
                    "unknown variant '{}': choose one of {}",
                    self.variant,
                    known.join(", ")
                ))
            })?;
        Ok(match sub {
            Some(sub) => self.root.join(sub),
            None => self.root.clone(),
        })
    }

    /// Build tree for an operator.
    pub fn operator_dir(&self, operator: OperatorKind) -> Result<PathBuf, StageError> {
        let base = self.variant_base()?;
        let configured = self.dirs.iter().find_map(|(name, dir)| {
            (name.parse::<OperatorKind>().ok() == Some(operator)).then_some(dir)
        });
        Ok(match configured {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base.join(dir),
            None => base.join(operator.default_dir()),
        })
    }
}

/// Runs one operator's build tree as a subprocess.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    operator: OperatorKind,
    settings: EngineSettings,
}

impl ExternalEngine {
    pub fn new(operator: OperatorKind, settings: EngineSettings) -> Self {
        Self { operator, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn dir(&self) -> Result<PathBuf, StageError> {
        let dir = self.settings.operator_dir(self.operator)?;
        if !dir.is_dir() {
            return Err(StageError::Config(format!(
                "{} directory not found: {}",
                self.operator,
                dir.display()
            )));
        }
        Ok(dir)
    }

    fn invocation(&self, dir: &Path, input: &Path, predicate: Option<&FilterPredicate>) -> Command {
        let runner = Path::new(&self.settings.host_runner);
        let runner = if runner.is_relative() {
            dir.join(runner)
        } else {
            runner.to_path_buf()
        };
        let mut cmd = Command::new(runner);
        cmd.arg(&self.settings.enclave_image)
            .arg(self.settings.threads.to_string())
            .arg(input)
            .current_dir(dir);
        if let (Some(p), FilterInjection::Args) = (predicate, self.settings.filter_injection) {
            cmd.arg(p.comparator.symbol()).arg(p.threshold.to_string());
        }
        cmd
    }
}

impl Engine for ExternalEngine {
    fn name(&self) -> &str {
        "external"
    }

    fn operator(&self) -> OperatorKind {
        self.operator
    }

    fn execute(&self, request: &EngineRequest) -> Result<EngineRun, StageError> {
        let dir = self.dir()?;
        let predicate = request.predicate.as_ref();

        // Held until the run finishes; dropping it restores the source.
        let patch = match (predicate, self.settings.filter_injection) {
            (Some(p), FilterInjection::Patch) => {
                tracing::info!(predicate = %p, "injecting filter into engine source");
                Some(SourcePatch::apply(&dir.join(FILTER_SOURCE), &filter_substitutions(p))?)
            }
            _ => None,
        };

        if self.settings.rebuild || patch.is_some() {
            build(&dir)?;
        }

        let mut cmd = self.invocation(&dir, &request.input, predicate);
        tracing::debug!(?cmd, "invoking engine");
        let output = cmd.output().map_err(|source| StageError::Spawn {
            command: format!("{cmd:?}"),
            source,
        })?;

        if let Some(patch) = patch {
            patch.restore()?;
        }

        Ok(EngineRun {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// `make clean` followed by `make` in `dir`.
pub fn build(dir: &Path) -> Result<(), StageError> {
    tracing::info!(dir = %dir.display(), "building engine");
    for args in [&["clean"][..], &[][..]] {
        let command = format!("make {}", args.join(" ")).trim_end().to_string();
        let output: Output = Command::new("make")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|source| StageError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(StageError::Build {
                dir: dir.to_path_buf(),
                command,
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
    }
    Ok(())
}

/// Rebuild every operator tree that exists. Returns the directories built.
pub fn build_all(settings: &EngineSettings) -> Result<Vec<PathBuf>, StageError> {
    let mut built = Vec::new();
    for operator in OperatorKind::ALL {
        let dir = settings.operator_dir(operator)?;
        if !dir.is_dir() {
            tracing::warn!(%operator, dir = %dir.display(), "directory not found, skipping build");
            continue;
        }
        build(&dir)?;
        built.push(dir);
    }
    Ok(built)
}

/// Set `DATA_LENGTH` for every operator tree that has a payload header.
pub fn set_payload_sizes(settings: &EngineSettings, size: usize) -> Result<Vec<PathBuf>, StageError> {
    let mut patched = Vec::new();
    for operator in OperatorKind::ALL {
        let header = settings.operator_dir(operator)?.join(PAYLOAD_HEADER);
        if !header.is_file() {
            tracing::debug!(%operator, header = %header.display(), "no payload header");
            continue;
        }
        set_payload_size(&header, size)?;
        patched.push(header);
    }
    if patched.is_empty() {
        return Err(StageError::Config(format!(
            "no {PAYLOAD_HEADER} found under {}",
            settings.root.display()
        )));
    }
    Ok(patched)
}
