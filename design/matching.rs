//! # Subject Matching
//!
//! Discovers measurement files in a directory and resolves the subject each one
//! belongs to. Subject identity is recovered from the file name by a pluggable
//! [`SubjectIdRule`]; the stock rule is positional (split on a delimiter, take a
//! fixed field), which mirrors how the imaging outputs are named on disk.
//!
//! Ordering is deterministic: files come back sorted by subject id
//! (lexicographic) and then by natural file-name order, so two runs over the same
//! directory always feed rows to the model in the same order.

use itertools::Itertools;
use natord::compare;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("Unable to list measurement directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid file pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(
        "Could not resolve a subject id from file '{file}'. The file matched the discovery pattern but does not follow the naming rule ({rule})."
    )]
    UnresolvedSubject { file: PathBuf, rule: String },
    #[error(
        "Subject '{subject_id}' has {count} measurement files; exactly one per subject is required for a group model: {files}"
    )]
    MultipleFiles {
        subject_id: String,
        count: usize,
        files: String,
    },
}

/// Which stage of the analysis a measurement file feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnalysisLevel {
    First,
    Second,
}

impl fmt::Display for AnalysisLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => f.write_str("first level"),
            Self::Second => f.write_str("second level"),
        }
    }
}

/// A discovered measurement file. Identity is `(subject_id, path)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeasurementFile {
    pub path: PathBuf,
    pub subject_id: String,
    pub level: AnalysisLevel,
}

impl MeasurementFile {
    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

/// All files discovered for one subject, in natural file-name order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectFiles {
    pub subject_id: String,
    pub files: Vec<MeasurementFile>,
}

/// Strategy for recovering a subject id from a file name.
pub trait SubjectIdRule: Sync {
    fn extract_subject_id(&self, file_name: &str) -> Option<String>;

    /// Human-readable description used in error messages.
    fn describe(&self) -> String;
}

/// Splits the extension-less file name on `delimiter` and returns field `index`.
///
/// `beta_values_sub01_maskA_seed.nii.gz` with delimiter `_` and index 2 yields
/// `sub01`. Everything from the first `.` onward is treated as extension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionalRule {
    pub delimiter: String,
    pub index: usize,
}

impl PositionalRule {
    pub fn new(delimiter: impl Into<String>, index: usize) -> Self {
        Self {
            delimiter: delimiter.into(),
            index,
        }
    }
}

impl SubjectIdRule for PositionalRule {
    fn extract_subject_id(&self, file_name: &str) -> Option<String> {
        let stem = strip_extensions(file_name);
        if self.delimiter.is_empty() {
            return None;
        }
        stem.split(self.delimiter.as_str())
            .nth(self.index)
            .filter(|field| !field.is_empty())
            .map(str::to_string)
    }

    fn describe(&self) -> String {
        format!(
            "field {} of the file name split on '{}'",
            self.index, self.delimiter
        )
    }
}

/// A compiled file-name glob. Supports `*` and `?`; every other character is
/// matched literally. Matching is against the bare file name, never the path.
#[derive(Clone, Debug)]
pub struct FilePattern {
    source: String,
    regex: Regex,
}

impl FilePattern {
    pub fn new(glob: &str) -> Result<Self, MatchError> {
        let mut translated = String::with_capacity(glob.len() + 8);
        translated.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => translated.push_str(".*"),
                '?' => translated.push('.'),
                other => translated.push_str(&regex::escape(&other.to_string())),
            }
        }
        translated.push('$');

        let regex = Regex::new(&translated).map_err(|source| MatchError::Pattern {
            pattern: glob.to_string(),
            source,
        })?;
        Ok(Self {
            source: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.regex.is_match(file_name)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Lists `dir` (non-recursively) and returns every regular file whose name
/// matches `pattern`, in natural file-name order.
pub fn list_matching(dir: &Path, pattern: &FilePattern) -> Result<Vec<PathBuf>, MatchError> {
    let io_error = |source| MatchError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_file() && pattern.matches(&file_name_of(&path)) {
            paths.push(path);
        }
    }
    paths.sort_by(|a, b| compare(&file_name_of(a), &file_name_of(b)));
    Ok(paths)
}

/// Lists the files in `dir` matching `pattern` and tags each with its subject id.
///
/// The result is sorted by subject id, then by natural file-name order. An empty
/// result is returned as-is; callers decide whether that is fatal.
pub fn discover(
    dir: &Path,
    pattern: &FilePattern,
    rule: &dyn SubjectIdRule,
    level: AnalysisLevel,
) -> Result<Vec<MeasurementFile>, MatchError> {
    let mut files = Vec::new();
    for path in list_matching(dir, pattern)? {
        let name = file_name_of(&path);
        let Some(subject_id) = rule.extract_subject_id(&name) else {
            return Err(MatchError::UnresolvedSubject {
                file: path,
                rule: rule.describe(),
            });
        };
        log::debug!("Matched {name} to subject {subject_id}");
        files.push(MeasurementFile {
            path,
            subject_id,
            level,
        });
    }

    // Stable sort keeps the natural file-name order within a subject.
    files.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));

    log::info!(
        "Discovered {} {} file(s) matching '{}' in {}",
        files.len(),
        level,
        pattern.as_str(),
        dir.display()
    );
    Ok(files)
}

/// Groups files per subject. Input order within a subject is preserved, and the
/// groups come back in lexicographic subject order.
pub fn group_by_subject(files: &[MeasurementFile]) -> Vec<SubjectFiles> {
    let mut grouped: BTreeMap<&str, Vec<MeasurementFile>> = BTreeMap::new();
    for file in files {
        grouped
            .entry(file.subject_id.as_str())
            .or_default()
            .push(file.clone());
    }
    grouped
        .into_iter()
        .map(|(subject_id, files)| SubjectFiles {
            subject_id: subject_id.to_string(),
            files,
        })
        .collect()
}

/// Collapses the discovered files to exactly one per subject, keyed by subject.
pub fn single_file_per_subject(
    files: &[MeasurementFile],
) -> Result<BTreeMap<String, MeasurementFile>, MatchError> {
    let mut by_subject = BTreeMap::new();
    for group in group_by_subject(files) {
        if group.files.len() != 1 {
            return Err(MatchError::MultipleFiles {
                subject_id: group.subject_id,
                count: group.files.len(),
                files: group.files.iter().map(MeasurementFile::file_name).join(", "),
            });
        }
        let mut files = group.files;
        by_subject.insert(group.subject_id, files.remove(0));
    }
    Ok(by_subject)
}

/// Returns the file name with every extension removed (`a_b.nii.gz` → `a_b`).
pub fn strip_extensions(file_name: &str) -> &str {
    match file_name.find('.') {
        Some(0) | None => file_name,
        Some(idx) => &file_name[..idx],
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
