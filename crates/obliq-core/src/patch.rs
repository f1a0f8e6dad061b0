//! Build-time parameters for engines configured through their sources.
//!
//! Some engine builds hardcode the filter threshold and comparator. They are
//! set by rewriting comment-delimited placeholders before the build; a
//! [`SourcePatch`] puts the original file back when it goes out of scope.

use crate::engine::FilterPredicate;
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File holding the filter placeholders, relative to the operator directory.
pub const FILTER_SOURCE: &str = "enclave/scalable_oblivious_join.c";

/// Header defining the payload width, relative to the operator directory.
pub const PAYLOAD_HEADER: &str = "common/elem_t.h";

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("source file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("{}: '{needle}' not found", .path.display())]
    MarkerNotFound { path: PathBuf, needle: String },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A placeholder wrapped in unique comment markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub start: String,
    pub token: String,
    pub end: String,
}

impl Placeholder {
    pub fn new(start: impl Into<String>, token: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            token: token.into(),
            end: end.into(),
        }
    }

    fn needle(&self) -> String {
        format!("{}{}{}", self.start, self.token, self.end)
    }

    fn filled(&self, value: &str) -> String {
        format!("{}{}{}", self.start, value, self.end)
    }
}

/// Threshold and comparator placeholders for the multi- and single-threaded
/// filter paths, paired with the values the predicate needs.
pub fn filter_substitutions(predicate: &FilterPredicate) -> Vec<(Placeholder, String)> {
    let threshold = predicate.threshold.to_string();
    let comparator = predicate.comparator.symbol().to_string();
    vec![
        (
            Placeholder::new("/*MT_FILTER_START*/", "FILTER_PLACEHOLDER_VALUE_OP1_MT", "/*MT_FILTER_END*/"),
            threshold.clone(),
        ),
        (
            Placeholder::new("/*ST_FILTER_START*/", "FILTER_PLACEHOLDER_VALUE_OP1_ST", "/*ST_FILTER_END*/"),
            threshold,
        ),
        (
            Placeholder::new("/*MT_COND_START*/", "FILTER_PLACEHOLDER_COND_OP1_MT", "/*MT_COND_END*/"),
            comparator.clone(),
        ),
        (
            Placeholder::new("/*ST_COND_START*/", "FILTER_PLACEHOLDER_COND_OP1_ST", "/*ST_COND_END*/"),
            comparator,
        ),
    ]
}

/// Scoped rewrite of a source file.
///
/// The original contents are written back by [`SourcePatch::restore`] or,
/// failing that, on drop.
#[derive(Debug)]
pub struct SourcePatch {
    path: PathBuf,
    original: String,
    restored: bool,
}

impl SourcePatch {
    /// Replace every placeholder. Nothing is written unless all are found.
    pub fn apply(path: &Path, substitutions: &[(Placeholder, String)]) -> Result<Self, PatchError> {
        if !path.is_file() {
            return Err(PatchError::NotFound(path.to_path_buf()));
        }
        let original = fs::read_to_string(path).map_err(|source| PatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut patched = original.clone();
        for (placeholder, value) in substitutions {
            let needle = placeholder.needle();
            if !patched.contains(&needle) {
                return Err(PatchError::MarkerNotFound {
                    path: path.to_path_buf(),
                    needle,
                });
            }
            patched = patched.replace(&needle, &placeholder.filled(value));
        }

        write_synced(path, &patched)?;
        tracing::debug!(path = %path.display(), count = substitutions.len(), "patched source");
        Ok(Self {
            path: path.to_path_buf(),
            original,
            restored: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Put the original contents back.
    pub fn restore(mut self) -> Result<(), PatchError> {
        self.write_back()
    }

    fn write_back(&mut self) -> Result<(), PatchError> {
        if self.restored {
            return Ok(());
        }
        write_synced(&self.path, &self.original)?;
        self.restored = true;
        tracing::debug!(path = %self.path.display(), "restored source");
        Ok(())
    }
}

impl Drop for SourcePatch {
    fn drop(&mut self) {
        if let Err(e) = self.write_back() {
            tracing::error!("failed to restore patched source: {e}");
        }
    }
}

fn write_synced(path: &Path, contents: &str) -> Result<(), PatchError> {
    let io = |source| PatchError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(io)?;
    file.write_all(contents.as_bytes()).map_err(io)?;
    file.sync_all().map_err(io)
}

/// Rewrite `#define DATA_LENGTH <n>` in a payload header.
pub fn set_payload_size(header: &Path, size: usize) -> Result<(), PatchError> {
    if !header.is_file() {
        return Err(PatchError::NotFound(header.to_path_buf()));
    }
    let content = fs::read_to_string(header).map_err(|source| PatchError::Io {
        path: header.to_path_buf(),
        source,
    })?;

    let re = Regex::new(r"(#define\s+DATA_LENGTH\s+)\d+")?;
    if !re.is_match(&content) {
        return Err(PatchError::MarkerNotFound {
            path: header.to_path_buf(),
            needle: "#define DATA_LENGTH".into(),
        });
    }
    let updated = re.replace_all(&content, format!("${{1}}{size}"));
    write_synced(header, &updated)?;
    tracing::info!(header = %header.display(), size, "set payload size");
    Ok(())
}
