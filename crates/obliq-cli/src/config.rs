//! Configuration file support.

use obliq_core::EngineSettings;
use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default CLI options.
    pub defaults: Defaults,
    /// How to find and drive the external engine.
    pub engine: EngineSettings,
}

/// Which engine runs the stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// The enclave build trees under `[engine] root`.
    #[default]
    External,
    /// In-process cleartext operators.
    Reference,
}

/// Default CLI options.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Enable verbose output by default.
    pub verbose: bool,
    /// Enable quiet output by default.
    pub quiet: bool,
    /// Keep scratch directories after each run.
    pub keep_scratch: bool,
    /// Parent directory for scratch directories (default: system temp).
    pub scratch_dir: Option<PathBuf>,
    pub engine: EngineKind,
    /// Delimiter of input CSVs.
    pub input_delimiter: Option<char>,
    /// Delimiter of written CSVs.
    pub delimiter: Option<char>,
}

impl Config {
    /// Load config from the default location.
    pub fn load() -> Self {
        Self::load_from_path(Self::default_path())
    }

    /// Load config from a specific path.
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {e}");
                Self::default()
            }),
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {e}");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("obliq").join("config.toml"))
    }
}
