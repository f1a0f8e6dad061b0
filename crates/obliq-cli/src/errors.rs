//! Better error messages with actionable suggestions.

use obliq_core::{ErrorCategory, FormatError, PipelineError, WorkflowError};
use std::path::Path;

/// Build an error message for an input file that cannot be read.
pub fn file_read_error(path: &Path, err: &std::io::Error) -> String {
    use std::io::ErrorKind;

    let mut msg = format!("Failed to read '{}'", path.display());

    match err.kind() {
        ErrorKind::NotFound => {
            msg.push_str(": file not found");

            if let Some(suggestions) = find_similar_files(path)
                && !suggestions.is_empty()
            {
                msg.push_str(&format!(".\n\nDid you mean: {}?", suggestions.join(", ")));
            }
        }
        ErrorKind::PermissionDenied => {
            msg.push_str(": permission denied. Check file permissions.");
        }
        _ => {
            msg.push_str(&format!(": {err}"));
        }
    }

    msg
}

/// Suggest close column names for each missing one.
pub fn column_suggestions(missing: &[String], found: &[String]) -> Vec<String> {
    missing
        .iter()
        .filter_map(|m| {
            found
                .iter()
                .map(|f| (levenshtein(&m.to_lowercase(), &f.to_lowercase()), f))
                .filter(|(d, _)| *d <= 2)
                .min_by_key(|(d, _)| *d)
                .map(|(_, f)| format!("'{m}' -> '{f}'"))
        })
        .collect()
}

/// Extra help for an error, if any applies.
pub fn hint(err: &anyhow::Error) -> Option<String> {
    for cause in err.chain() {
        if let Some(FormatError::MissingColumns { missing, found, .. }) = cause.downcast_ref() {
            let suggestions = column_suggestions(missing, found);
            if !suggestions.is_empty() {
                return Some(format!("Did you mean: {}?", suggestions.join(", ")));
            }
        }
        if let Some(PipelineError::UnknownColumn { column, available }) = cause.downcast_ref() {
            let suggestions = column_suggestions(std::slice::from_ref(column), available);
            if !suggestions.is_empty() {
                return Some(format!("Did you mean: {}?", suggestions.join(", ")));
            }
            return Some(format!("Available columns: {}", available.join(", ")));
        }
        if let Some(obliq_core::StageError::Execution { code, .. }) = cause.downcast_ref() {
            return Some(format!(
                "The engine exited with {code}. Rerun with --keep-scratch to inspect its input."
            ));
        }
    }
    None
}

/// Process exit code for an error.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    let category = err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<PipelineError>() {
            return Some(e.category());
        }
        match cause.downcast_ref::<WorkflowError>() {
            Some(WorkflowError::Execution { source, .. }) => return Some(source.category()),
            Some(_) => return Some(ErrorCategory::Configuration),
            None => {}
        }
        if let Some(e) = cause.downcast_ref::<obliq_core::StageError>() {
            return Some(e.category());
        }
        None
    });
    match category {
        Some(ErrorCategory::Configuration) => 2,
        Some(ErrorCategory::Build) => 3,
        Some(ErrorCategory::Execution) => 4,
        Some(ErrorCategory::ContractViolation) => 5,
        Some(ErrorCategory::Io) => 6,
        None => 1,
    }
}

/// Edit distance, one row at a time.
fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = (above + 1)
                .min(row[j] + 1)
                .min(diagonal + usize::from(ca != *cb));
            diagonal = above;
        }
    }

    row[b.len()]
}

/// Find files with similar names in the same directory.
fn find_similar_files(path: &Path) -> Option<Vec<String>> {
    let filename = path.file_name()?.to_str()?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let entries = std::fs::read_dir(parent).ok()?;
    let mut suggestions: Vec<String> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| name != filename && levenshtein(filename, name) <= 2)
        .collect();

    suggestions.sort();
    suggestions.truncate(3);
    Some(suggestions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("id", "id"), 0);
        assert_eq!(levenshtein("name", "nme"), 1);
        assert_eq!(levenshtein("creationDate", "creationdate"), 1);
        assert_eq!(levenshtein("abc", "xyz"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn test_column_suggestions() {
        let found = vec!["personId".to_string(), "firstName".to_string()];
        let missing = vec!["personid".to_string(), "zzz".to_string()];
        assert_eq!(column_suggestions(&missing, &found), vec!["'personid' -> 'personId'"]);
    }

    #[test]
    fn test_similar_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("person.csv"), "").unwrap();
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        let msg = file_read_error(&dir.path().join("persn.csv"), &err);
        assert!(msg.contains("Did you mean: person.csv?"));
    }

    #[test]
    fn test_exit_code_from_pipeline_error() {
        let err = anyhow::Error::from(PipelineError::EngineNotRegistered(
            obliq_core::OperatorKind::Join,
        ))
        .context("running join");
        assert_eq!(exit_code(&err), 2);
        assert_eq!(exit_code(&anyhow::anyhow!("plain")), 1);
    }
}
